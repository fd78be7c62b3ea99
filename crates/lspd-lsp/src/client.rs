//! LSP Client: one instance per `(serverId, projectRoot)`.
//!
//! Owns a JSON-RPC connection over a spawned language server's stdio, tracks
//! open documents and their most recent diagnostics, and exposes the
//! document-scoped operations the Manager drives (open/close, diagnostics,
//! hover, document symbols, type definition).

use crate::catalog::ServerDescriptor;
use crate::error::{LspError, LspResult};
use crate::process_registry::ProcessRegistry;
use crate::transport::{Incoming, Transport};
use lspd_util::path::is_within;
use lsp_types::{
    ClientCapabilities, CompletionClientCapabilities, CompletionParams, CompletionResponse,
    Diagnostic, DiagnosticClientCapabilities, DidChangeTextDocumentParams,
    DidCloseTextDocumentParams, DidOpenTextDocumentParams, DocumentSymbolClientCapabilities,
    DocumentSymbolParams, DocumentSymbolResponse, GotoCapability, GotoDefinitionParams,
    GotoDefinitionResponse, Hover, HoverClientCapabilities, HoverParams, InitializeParams,
    InitializeResult, InitializedParams, MarkupKind, PartialResultParams,
    PublishDiagnosticsClientCapabilities, Position, PublishDiagnosticsParams,
    SignatureHelp, SignatureHelpClientCapabilities, SignatureHelpParams,
    TextDocumentClientCapabilities, TextDocumentContentChangeEvent, TextDocumentIdentifier,
    TextDocumentItem, TextDocumentPositionParams, TextDocumentSyncClientCapabilities,
    VersionedTextDocumentIdentifier, WorkDoneProgressParams, WorkspaceClientCapabilities,
    WorkspaceFolder,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{trace, warn};

/// How long to wait for a push-mode `publishDiagnostics` notification before
/// assuming an empty, cacheable result.
pub const PUSH_DIAGNOSTICS_TIMEOUT: Duration = Duration::from_millis(3000);
/// Transport-disposed retry budget for hover/signature-help/document-symbol.
const RETRY_ATTEMPTS: u32 = 2;
const RETRY_PAUSE: Duration = Duration::from_millis(100);
/// Graceful-shutdown budget before the caller should escalate to a kill.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(5000);

/// A resolved hover-probe location, and why it was probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Location,
    TypeDefinition,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Location => "Location",
            ProbeKind::TypeDefinition => "Type Definition",
        }
    }
}

/// One server-side occurrence of hover+signature-help data at a location.
#[derive(Debug, Clone)]
pub struct HoverProbeResult {
    pub hover: Option<Hover>,
    pub signature_help: Option<SignatureHelp>,
}

/// An LSP Client: spawned language server process plus its live session state.
pub struct LspClient {
    pub server_id: String,
    pub project_root: PathBuf,
    pub created_at: Instant,
    transport: Arc<Transport>,
    capabilities: lsp_types::ServerCapabilities,
    diagnostics: RwLock<HashMap<PathBuf, Vec<Diagnostic>>>,
    diagnostics_waiters: Mutex<HashMap<PathBuf, Vec<oneshot::Sender<()>>>>,
    open_files: RwLock<HashSet<PathBuf>>,
    version_counter: Mutex<HashMap<PathBuf, i32>>,
    push_diagnostics_timeout: Duration,
}

impl LspClient {
    /// Spawn `descriptor`'s process rooted at `root`, run `initialize` +
    /// `initialized`, and register the unconditional notification/request
    /// handlers before returning.
    pub async fn spawn(
        descriptor: &ServerDescriptor,
        root: PathBuf,
        daemon_pid: u32,
        daemon_env: &HashMap<String, String>,
        registry: &ProcessRegistry,
        push_diagnostics_timeout: Duration,
    ) -> LspResult<Arc<Self>> {
        let argv = descriptor.argv(&root);
        let Some(command) = argv.first() else {
            return Err(LspError::ProcessError("empty command".into()));
        };
        let args: Vec<String> = argv[1..].to_vec();

        let mut env = daemon_env.clone();
        env.extend(descriptor.env.clone());

        let (transport, mut incoming) = Transport::spawn(command, &args, &root, &env).await?;
        registry.register(*transport.process_handle()).await;

        let root_uri = format!("file://{}", root.display());
        let workspace_folder = WorkspaceFolder {
            uri: root_uri
                .parse()
                .map_err(|e| LspError::InvalidUri(format!("{root_uri}: {e}")))?,
            name: root
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("workspace")
                .to_string(),
        };

        let init_params = InitializeParams {
            process_id: Some(daemon_pid),
            root_uri: Some(workspace_folder.uri.clone()),
            workspace_folders: Some(vec![workspace_folder]),
            initialization_options: descriptor.init_options.clone(),
            capabilities: client_capabilities(),
            ..Default::default()
        };

        let response = transport
            .request("initialize", Some(serde_json::to_value(&init_params)?))
            .await?;
        let init_result: InitializeResult = serde_json::from_value(response)
            .map_err(|e| LspError::InitializationFailed(e.to_string()))?;

        transport
            .notify(
                "initialized",
                Some(serde_json::to_value(InitializedParams {})?),
            )
            .await?;

        let client = Arc::new(Self {
            server_id: descriptor.id.clone(),
            project_root: root,
            created_at: Instant::now(),
            transport,
            capabilities: init_result.capabilities,
            diagnostics: RwLock::new(HashMap::new()),
            diagnostics_waiters: Mutex::new(HashMap::new()),
            open_files: RwLock::new(HashSet::new()),
            version_counter: Mutex::new(HashMap::new()),
            push_diagnostics_timeout,
        });

        let dispatch_client = client.clone();
        tokio::spawn(async move {
            while let Some(incoming) = incoming.recv().await {
                dispatch_client.handle_incoming(incoming).await;
            }
        });

        Ok(client)
    }

    /// True if the server advertised a `textDocument/diagnostic` provider.
    pub fn supports_pull_diagnostics(&self) -> bool {
        self.capabilities.diagnostic_provider.is_some()
    }

    async fn handle_incoming(&self, incoming: Incoming) {
        match incoming {
            Incoming::Notification { method, params } => {
                self.handle_notification(&method, params).await
            }
            Incoming::Request { id, method, params } => {
                self.handle_server_request(id, &method, params).await
            }
        }
    }

    async fn handle_notification(&self, method: &str, params: Value) {
        if method != "textDocument/publishDiagnostics" {
            return;
        }
        let parsed: PublishDiagnosticsParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "dropping malformed publishDiagnostics");
                return;
            }
        };
        let path = uri_to_path(parsed.uri.as_str());
        self.diagnostics
            .write()
            .await
            .insert(path.clone(), parsed.diagnostics);

        let mut waiters = self.diagnostics_waiters.lock().await;
        if let Some(senders) = waiters.remove(&path) {
            for sender in senders {
                let _ = sender.send(());
            }
        }
    }

    async fn handle_server_request(&self, id: Value, method: &str, _params: Value) {
        let result = match method {
            "window/workDoneProgress/create" => Value::Null,
            "workspace/configuration" => Value::Array(vec![serde_json::json!({})]),
            other => {
                trace!(method = other, "unhandled server-initiated request");
                return;
            }
        };
        if let Err(e) = self.transport.respond(id, result).await {
            warn!(error = %e, "failed to respond to server-initiated request");
        }
    }

    /// Open `path` if not already open: `didOpen` followed immediately by a
    /// forced `didChange` retransmitting the same text at version 1 (some
    /// servers cache diagnostics by document version and won't re-emit on a
    /// plain re-open).
    pub async fn open_file(&self, path: &Path, language_id: &str) -> LspResult<()> {
        if !is_within(path, &self.project_root) {
            return Err(LspError::outside_root(
                path.display().to_string(),
                self.project_root.display().to_string(),
            ));
        }

        if self.open_files.read().await.contains(path) {
            return Ok(());
        }

        let uri = path_to_uri(path)?;
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(LspError::Io)?;

        let open_params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: uri.clone(),
                language_id: language_id.to_string(),
                version: 0,
                text: text.clone(),
            },
        };
        self.transport
            .notify(
                "textDocument/didOpen",
                Some(serde_json::to_value(&open_params)?),
            )
            .await?;

        let change_params = DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier { uri, version: 1 },
            content_changes: vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text,
            }],
        };
        self.transport
            .notify(
                "textDocument/didChange",
                Some(serde_json::to_value(&change_params)?),
            )
            .await?;

        self.open_files.write().await.insert(path.to_path_buf());
        self.version_counter.lock().await.insert(path.to_path_buf(), 1);
        Ok(())
    }

    /// Send a further `didChange` for an already-open file, strictly
    /// incrementing its version counter.
    pub async fn change_file(&self, path: &Path, text: String) -> LspResult<()> {
        let uri = path_to_uri(path)?;
        let version = {
            let mut counters = self.version_counter.lock().await;
            let entry = counters.entry(path.to_path_buf()).or_insert(1);
            *entry += 1;
            *entry
        };
        let params = DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier { uri, version },
            content_changes: vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text,
            }],
        };
        self.transport
            .notify(
                "textDocument/didChange",
                Some(serde_json::to_value(&params)?),
            )
            .await
    }

    pub async fn close_file(&self, path: &Path) -> LspResult<()> {
        if !self.open_files.write().await.remove(path) {
            return Ok(());
        }
        let uri = path_to_uri(path)?;
        let params = DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier { uri },
        };
        self.transport
            .notify(
                "textDocument/didClose",
                Some(serde_json::to_value(&params)?),
            )
            .await?;
        // Keep the cached diagnostics (including a timed-out empty result) so a
        // subsequent open/request cycle doesn't re-pay a push-mode wait for a
        // server that never publishes for this path.
        self.version_counter.lock().await.remove(path);
        Ok(())
    }

    /// Close every currently open file. Invoked by the Manager's
    /// request-lifecycle wrapper after every request.
    pub async fn close_all_files(&self) {
        let open: Vec<PathBuf> = self.open_files.read().await.iter().cloned().collect();
        for path in open {
            if let Err(e) = self.close_file(&path).await {
                warn!(file = %path.display(), error = %e, "failed to close file");
            }
        }
    }

    /// Pull-mode or push-mode diagnostics acquisition, depending on server capability.
    pub async fn diagnostics_for(
        &self,
        path: &Path,
        language_id: &str,
    ) -> LspResult<Vec<Diagnostic>> {
        self.open_file(path, language_id).await?;

        if self.supports_pull_diagnostics() {
            self.pull_diagnostics(path).await
        } else {
            self.push_diagnostics(path).await
        }
    }

    async fn pull_diagnostics(&self, path: &Path) -> LspResult<Vec<Diagnostic>> {
        let uri = path_to_uri(path)?;
        let params = serde_json::json!({
            "textDocument": { "uri": uri },
        });
        let response = self
            .transport
            .request("textDocument/diagnostic", Some(params))
            .await?;

        let kind = response.get("kind").and_then(Value::as_str).unwrap_or("");
        match kind {
            "unchanged" => Ok(self
                .diagnostics
                .read()
                .await
                .get(path)
                .cloned()
                .unwrap_or_default()),
            _ => {
                let items: Vec<Diagnostic> = response
                    .get("items")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(LspError::Json)?
                    .unwrap_or_default();
                self.diagnostics
                    .write()
                    .await
                    .insert(path.to_path_buf(), items.clone());
                Ok(items)
            }
        }
    }

    async fn push_diagnostics(&self, path: &Path) -> LspResult<Vec<Diagnostic>> {
        if let Some(cached) = self.diagnostics.read().await.get(path) {
            return Ok(cached.clone());
        }

        let (tx, rx) = oneshot::channel();
        self.diagnostics_waiters
            .lock()
            .await
            .entry(path.to_path_buf())
            .or_default()
            .push(tx);

        match tokio::time::timeout(self.push_diagnostics_timeout, rx).await {
            Ok(_) => Ok(self
                .diagnostics
                .read()
                .await
                .get(path)
                .cloned()
                .unwrap_or_default()),
            Err(_) => {
                // Timed out: assume and cache the empty list so future
                // requests return immediately.
                self.diagnostics
                    .write()
                    .await
                    .entry(path.to_path_buf())
                    .or_insert_with(Vec::new);
                Ok(Vec::new())
            }
        }
    }

    /// Document symbols, retry-wrapped against transport-disposed errors.
    pub async fn document_symbols(&self, path: &Path) -> LspResult<DocumentSymbolResponse> {
        let uri = path_to_uri(path)?;
        let params = DocumentSymbolParams {
            text_document: TextDocumentIdentifier { uri },
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        self.retrying(|| async {
            let response = self
                .transport
                .request(
                    "textDocument/documentSymbol",
                    Some(serde_json::to_value(&params)?),
                )
                .await?;
            serde_json::from_value(response).map_err(LspError::Json)
        })
        .await
    }

    /// `getTypeDefinition`: resolves to `Location[]`, `LocationLink[]`, or
    /// `None` if the server doesn't answer with a location.
    pub async fn type_definition(
        &self,
        path: &Path,
        position: Position,
    ) -> LspResult<Option<GotoDefinitionResponse>> {
        let uri = path_to_uri(path)?;
        let params = GotoDefinitionParams {
            text_document_position_params: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier { uri },
                position,
            },
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        self.retrying(|| async {
            let response = self
                .transport
                .request(
                    "textDocument/typeDefinition",
                    Some(serde_json::to_value(&params)?),
                )
                .await?;
            if response.is_null() {
                Ok(None)
            } else {
                serde_json::from_value(response)
                    .map(Some)
                    .map_err(LspError::Json)
            }
        })
        .await
    }

    /// `textDocument/definition`, for callers that want a plain
    /// definition lookup rather than the type-definition the hover
    /// pipeline follows.
    pub async fn definition(
        &self,
        path: &Path,
        position: Position,
    ) -> LspResult<Option<GotoDefinitionResponse>> {
        self.goto(path, position, "textDocument/definition").await
    }

    /// `textDocument/declaration`.
    pub async fn declaration(
        &self,
        path: &Path,
        position: Position,
    ) -> LspResult<Option<GotoDefinitionResponse>> {
        self.goto(path, position, "textDocument/declaration").await
    }

    async fn goto(
        &self,
        path: &Path,
        position: Position,
        method: &'static str,
    ) -> LspResult<Option<GotoDefinitionResponse>> {
        let uri = path_to_uri(path)?;
        let params = GotoDefinitionParams {
            text_document_position_params: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier { uri },
                position,
            },
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        self.retrying(|| async {
            let response = self
                .transport
                .request(method, Some(serde_json::to_value(&params)?))
                .await?;
            if response.is_null() {
                Ok(None)
            } else {
                serde_json::from_value(response)
                    .map(Some)
                    .map_err(LspError::Json)
            }
        })
        .await
    }

    /// `textDocument/completion`, retry-wrapped like the other document
    /// queries. Not used by the diagnostics/hover pipelines; exposed for
    /// parity with the rest of the client's request surface.
    pub async fn completion(
        &self,
        path: &Path,
        position: Position,
    ) -> LspResult<Option<CompletionResponse>> {
        let uri = path_to_uri(path)?;
        let params = CompletionParams {
            text_document_position: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier { uri },
                position,
            },
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: None,
        };
        self.retrying(|| async {
            let response = self
                .transport
                .request(
                    "textDocument/completion",
                    Some(serde_json::to_value(&params)?),
                )
                .await?;
            if response.is_null() {
                Ok(None)
            } else {
                serde_json::from_value(response)
                    .map(Some)
                    .map_err(LspError::Json)
            }
        })
        .await
    }

    /// Hover and signature-help issued concurrently, each retry-wrapped.
    pub async fn hover_probe(&self, path: &Path, position: Position) -> LspResult<HoverProbeResult> {
        let uri = path_to_uri(path)?;
        let hover_params = HoverParams {
            text_document_position_params: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier { uri: uri.clone() },
                position,
            },
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        let sig_params = SignatureHelpParams {
            text_document_position_params: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier { uri },
                position,
            },
            work_done_progress_params: WorkDoneProgressParams::default(),
            context: None,
        };

        let hover_fut = self.retrying(|| async {
            let response = self
                .transport
                .request("textDocument/hover", Some(serde_json::to_value(&hover_params)?))
                .await?;
            if response.is_null() {
                Ok(None)
            } else {
                serde_json::from_value::<Hover>(response)
                    .map(Some)
                    .map_err(LspError::Json)
            }
        });
        let sig_fut = self.retrying(|| async {
            let response = self
                .transport
                .request(
                    "textDocument/signatureHelp",
                    Some(serde_json::to_value(&sig_params)?),
                )
                .await?;
            if response.is_null() {
                Ok(None)
            } else {
                serde_json::from_value::<SignatureHelp>(response)
                    .map(Some)
                    .map_err(LspError::Json)
            }
        });

        let (hover, signature_help) = tokio::join!(hover_fut, sig_fut);
        Ok(HoverProbeResult {
            hover: hover.unwrap_or(None),
            signature_help: signature_help.unwrap_or(None),
        })
    }

    /// Retry a connection-disposed-prone request up to [`RETRY_ATTEMPTS`]
    /// times with a [`RETRY_PAUSE`] pause between attempts.
    async fn retrying<F, Fut, T>(&self, mut f: F) -> LspResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = LspResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < RETRY_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Graceful shutdown: `shutdown` request, `exit` notification, close
    /// the transport. Callers enforce the 5s escalation-to-kill timeout.
    pub async fn shutdown(&self) -> LspResult<()> {
        let _ = self.transport.request("shutdown", None).await;
        self.transport.notify("exit", None).await?;
        self.transport.close().await;
        Ok(())
    }

    pub async fn kill(&self) {
        self.transport.kill().await;
    }

    pub fn process_handle(&self) -> &crate::process_registry::ProcessHandle {
        self.transport.process_handle()
    }

    pub async fn open_file_count(&self) -> usize {
        self.open_files.read().await.len()
    }

    pub async fn cached_diagnostics(&self, path: &Path) -> Option<Vec<Diagnostic>> {
        self.diagnostics.read().await.get(path).cloned()
    }
}

fn client_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        workspace: Some(WorkspaceClientCapabilities {
            configuration: Some(true),
            ..Default::default()
        }),
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(TextDocumentSyncClientCapabilities {
                did_save: Some(true),
                ..Default::default()
            }),
            publish_diagnostics: Some(PublishDiagnosticsClientCapabilities {
                related_information: Some(true),
                version_support: Some(true),
                ..Default::default()
            }),
            document_symbol: Some(DocumentSymbolClientCapabilities {
                hierarchical_document_symbol_support: Some(true),
                ..Default::default()
            }),
            definition: Some(GotoCapability {
                link_support: Some(true),
                ..Default::default()
            }),
            type_definition: Some(GotoCapability {
                link_support: Some(true),
                ..Default::default()
            }),
            hover: Some(HoverClientCapabilities {
                content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
                ..Default::default()
            }),
            signature_help: Some(SignatureHelpClientCapabilities::default()),
            completion: Some(CompletionClientCapabilities::default()),
            declaration: Some(GotoCapability {
                link_support: Some(true),
                ..Default::default()
            }),
            diagnostic: Some(DiagnosticClientCapabilities {
                related_document_support: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn path_to_uri(path: &Path) -> LspResult<lsp_types::Uri> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().map_err(LspError::Io)?.join(path)
    };
    format!("file://{}", absolute.display())
        .parse()
        .map_err(|e| LspError::InvalidUri(format!("{}: {e}", absolute.display())))
}

pub fn uri_to_path(uri: &str) -> PathBuf {
    PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
}

/// Range helper for constructing a zero-based `(line, character)` position.
pub fn position(line: u32, character: u32) -> Position {
    Position { line, character }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_round_trip() {
        let path = Path::new("/tmp/example/main.rs");
        let uri = path_to_uri(path).unwrap();
        assert_eq!(uri_to_path(uri.as_str()), path);
    }

    #[test]
    fn probe_kind_labels_match_spec() {
        assert_eq!(ProbeKind::Location.as_str(), "Location");
        assert_eq!(ProbeKind::TypeDefinition.as_str(), "Type Definition");
    }
}
