//! LSP Manager: the singleton that maps client keys to LSP Clients,
//! single-flights initialization, and runs the diagnostics and hover
//! request pipelines.

use crate::catalog::ServerCatalog;
use crate::client::{position, uri_to_path, HoverProbeResult, LspClient, ProbeKind};
use crate::error::{LspError, LspResult};
use crate::process_registry::ProcessRegistry;
use crate::root::resolve_root;
use lsp_types::{Diagnostic, DocumentSymbol, DocumentSymbolResponse, GotoDefinitionResponse, Hover, Location, Position, SignatureHelp, SymbolInformation, SymbolKind};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{info, warn};

type ClientKey = (String, PathBuf);

/// One entry of [`LspManager::running_servers`].
#[derive(Debug, Clone)]
pub struct RunningServer {
    pub server_id: String,
    pub root: PathBuf,
    pub uptime_ms: u128,
}

/// An aggregated hover result for one resolved location, matching the §3 shape.
#[derive(Debug, Clone)]
pub struct HoverResult {
    pub symbol_name: String,
    pub hover_contents: Option<Hover>,
    pub signature_help: Option<SignatureHelp>,
    pub resolved_file: PathBuf,
    pub resolved_line: u32,
    pub resolved_character: u32,
    pub description: ProbeKind,
    occurrence_line: u32,
    occurrence_character: u32,
}

/// Tunables that would otherwise be hardcoded constants (§4.10 ambient config layering).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub shutdown_timeout: Duration,
    pub push_diagnostics_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: crate::client::SHUTDOWN_TIMEOUT,
            push_diagnostics_timeout: crate::client::PUSH_DIAGNOSTICS_TIMEOUT,
        }
    }
}

pub struct LspManager {
    catalog: Arc<ServerCatalog>,
    daemon_cwd: PathBuf,
    daemon_pid: u32,
    daemon_env: HashMap<String, String>,
    registry: Arc<ProcessRegistry>,
    config: ManagerConfig,
    clients: RwLock<HashMap<ClientKey, Arc<LspClient>>>,
    initializing: Mutex<HashMap<ClientKey, Arc<Notify>>>,
    broken: RwLock<HashSet<ClientKey>>,
}

impl LspManager {
    pub fn new(
        catalog: Arc<ServerCatalog>,
        daemon_cwd: PathBuf,
        daemon_env: HashMap<String, String>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            catalog,
            daemon_cwd,
            daemon_pid: std::process::id(),
            daemon_env,
            registry: ProcessRegistry::new(),
            config,
            clients: RwLock::new(HashMap::new()),
            initializing: Mutex::new(HashMap::new()),
            broken: RwLock::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &ServerCatalog {
        &self.catalog
    }

    /// Single-flighted client acquisition for `(server_id, root)`.
    async fn acquire_client(&self, server_id: &str, root: &Path) -> LspResult<Arc<LspClient>> {
        let key: ClientKey = (server_id.to_string(), root.to_path_buf());

        loop {
            if self.broken.read().await.contains(&key) {
                return Err(LspError::Broken(server_id.to_string()));
            }
            if let Some(client) = self.clients.read().await.get(&key) {
                return Ok(client.clone());
            }

            let notify = {
                let mut initializing = self.initializing.lock().await;
                if let Some(notify) = initializing.get(&key) {
                    Some(notify.clone())
                } else {
                    initializing.insert(key.clone(), Arc::new(Notify::new()));
                    None
                }
            };

            if let Some(notify) = notify {
                notify.notified().await;
                continue; // re-check clients/broken after the other initializer finished
            }

            let descriptor = self
                .catalog
                .by_id(server_id)
                .ok_or_else(|| LspError::ServerNotFound(server_id.to_string()))?;

            let result = LspClient::spawn(
                descriptor,
                root.to_path_buf(),
                self.daemon_pid,
                &self.daemon_env,
                &self.registry,
                self.config.push_diagnostics_timeout,
            )
            .await;

            match &result {
                Ok(client) => {
                    self.clients.write().await.insert(key.clone(), client.clone());
                    info!(server = server_id, root = %root.display(), "LSP client connected");
                }
                Err(e) => {
                    warn!(server = server_id, error = %e, "LSP client initialization failed");
                    self.broken.write().await.insert(key.clone());
                }
            }

            if let Some(notify) = self.initializing.lock().await.remove(&key) {
                notify.notify_waiters();
            }

            return result;
        }
    }

    /// Tear down a client after an unretryable connection-disposed failure
    /// (§4.4): remove it from `clients`, mark the key `broken` so it is never
    /// retried within the daemon's lifetime, and kill its process group.
    async fn mark_broken(&self, server_id: &str, root: &Path, client: &Arc<LspClient>) {
        let key: ClientKey = (server_id.to_string(), root.to_path_buf());
        self.clients.write().await.remove(&key);
        self.broken.write().await.insert(key);
        client.kill().await;
        self.registry.unregister(client.process_handle().pid()).await;
        warn!(server = server_id, root = %root.display(), "client marked broken after connection-disposed error");
    }

    /// Fire-and-forget client acquisition for every detected server id, so
    /// `start` (§4.6) pre-warms sessions without blocking its response.
    pub fn prewarm(manager: Arc<Self>, dir: PathBuf, server_ids: Vec<String>) {
        for id in server_ids {
            let root = manager.root_for(&dir, &id);
            let manager = manager.clone();
            tokio::spawn(async move {
                let _ = manager.acquire_client(&id, &root).await;
            });
        }
    }

    fn root_for(&self, file_path: &Path, server_id: &str) -> PathBuf {
        let markers = self
            .catalog
            .by_id(server_id)
            .map(|s| s.root_markers.clone())
            .unwrap_or_default();
        resolve_root(file_path, &markers, &self.daemon_cwd)
    }

    /// Close every open file on every live client. Invoked after every
    /// request regardless of success or failure.
    async fn close_all_files_everywhere(&self) {
        let clients: Vec<Arc<LspClient>> = self.clients.read().await.values().cloned().collect();
        for client in clients {
            client.close_all_files().await;
        }
    }

    /// `diagnostics <file>`: aggregate across every applicable server, in
    /// catalog order, closing every file afterward regardless of outcome.
    pub async fn diagnostics(&self, file_path: &Path) -> LspResult<Vec<Diagnostic>> {
        let result = self.diagnostics_inner(file_path).await;
        self.close_all_files_everywhere().await;
        result
    }

    async fn diagnostics_inner(&self, file_path: &Path) -> LspResult<Vec<Diagnostic>> {
        if !file_path.exists() {
            return Err(LspError::request_failed(format!(
                "File does not exist: {}",
                file_path.display()
            )));
        }

        let servers = self.catalog.applicable_to(file_path);
        let ext = file_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        let language_id = self.catalog.language_id_for_extension(&ext);

        let mut all = Vec::new();
        for server in servers {
            let root = self.root_for(file_path, &server.id);
            let client = match self.acquire_client(&server.id, &root).await {
                Ok(c) => c,
                Err(_) => continue,
            };
            match client.diagnostics_for(file_path, &language_id).await {
                Ok(diags) => all.extend(diags),
                Err(e) => {
                    warn!(server = %server.id, error = %e, "diagnostics request failed");
                    if e.is_retryable() {
                        self.mark_broken(&server.id, &root, &client).await;
                    }
                }
            }
        }
        Ok(all)
    }

    /// `hover <file> <symbol>`.
    pub async fn hover(&self, file_path: &Path, symbol: &str) -> LspResult<Vec<HoverResult>> {
        let result = self.hover_inner(file_path, symbol).await;
        self.close_all_files_everywhere().await;
        result
    }

    async fn hover_inner(&self, file_path: &Path, symbol: &str) -> LspResult<Vec<HoverResult>> {
        if !file_path.exists() {
            return Err(LspError::request_failed(format!(
                "File does not exist: {}",
                file_path.display()
            )));
        }

        let servers = self.catalog.applicable_to(file_path);
        let ext = file_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        let is_graphql = ext == ".graphql" || ext == ".gql";
        let language_id = self.catalog.language_id_for_extension(&ext);
        let content = tokio::fs::read_to_string(file_path)
            .await
            .map_err(LspError::Io)?;

        let mut results: Vec<HoverResult> = Vec::new();
        let mut seen_probes: HashSet<(PathBuf, u32, u32)> = HashSet::new();

        'servers: for server in servers {
            let root = self.root_for(file_path, &server.id);
            let client = match self.acquire_client(&server.id, &root).await {
                Ok(c) => c,
                Err(_) => continue,
            };
            if client.open_file(file_path, &language_id).await.is_err() {
                continue;
            }

            let occurrences = if is_graphql {
                Vec::new()
            } else {
                match client.document_symbols(file_path).await {
                    Ok(response) => find_symbol_occurrences(&response, symbol),
                    Err(e) if e.is_retryable() => {
                        self.mark_broken(&server.id, &root, &client).await;
                        continue 'servers;
                    }
                    Err(_) => Vec::new(),
                }
            };

            let occurrences = if occurrences.is_empty() {
                word_boundary_occurrences(&content, symbol)
                    .into_iter()
                    .map(|(line, character)| (line, character, None))
                    .collect()
            } else {
                dedupe_sorted(occurrences)
            };

            let mut server_results = Vec::new();
            let mut server_broken = false;
            for (line, character, kind) in occurrences {
                let occurrence_pos = position(line, character);

                let mut probes: Vec<(PathBuf, Position, ProbeKind)> = Vec::new();
                if seen_probes.insert((file_path.to_path_buf(), line, character)) {
                    probes.push((file_path.to_path_buf(), occurrence_pos, ProbeKind::Location));
                }

                let should_follow_type = !matches!(
                    kind,
                    Some(SymbolKind::FUNCTION) | Some(SymbolKind::METHOD) | Some(SymbolKind::CONSTRUCTOR)
                );
                if should_follow_type {
                    match client.type_definition(file_path, occurrence_pos).await {
                        Ok(Some(response)) => {
                            if let Some((type_file, type_pos)) =
                                first_location(&response).filter(|(f, p)| {
                                    f != file_path || p.line != line
                                })
                            {
                                if seen_probes.insert((
                                    type_file.clone(),
                                    type_pos.line,
                                    type_pos.character,
                                )) {
                                    probes.push((type_file, type_pos, ProbeKind::TypeDefinition));
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(e) if e.is_retryable() => {
                            self.mark_broken(&server.id, &root, &client).await;
                            server_broken = true;
                            break;
                        }
                        Err(_) => {}
                    }
                }

                for (probe_file, probe_pos, description) in probes {
                    let outcome = client.hover_probe(&probe_file, probe_pos).await;
                    let HoverProbeResult {
                        hover,
                        signature_help,
                    } = match outcome {
                        Ok(r) => r,
                        Err(e) => {
                            if e.is_retryable() {
                                self.mark_broken(&server.id, &root, &client).await;
                                server_broken = true;
                            }
                            continue;
                        }
                    };
                    if hover.is_none() && signature_help.is_none() {
                        continue;
                    }
                    server_results.push(HoverResult {
                        symbol_name: symbol.to_string(),
                        hover_contents: hover,
                        signature_help,
                        resolved_file: probe_file,
                        resolved_line: probe_pos.line,
                        resolved_character: probe_pos.character,
                        description,
                        occurrence_line: line,
                        occurrence_character: character,
                    });
                }

                if server_broken {
                    break;
                }
            }

            if !server_results.is_empty() {
                results.extend(server_results);
                // First server to yield results for this file wins; stop here.
                break;
            }
        }

        results.sort_by_key(|r| {
            (
                r.occurrence_line,
                r.occurrence_character,
                r.resolved_line,
                r.resolved_character,
            )
        });
        Ok(results)
    }

    /// Race a client's [`LspClient::shutdown`] against the configured
    /// timeout, escalating to a process-group kill on expiry.
    async fn shutdown_one(&self, client: &Arc<LspClient>) {
        let outcome = tokio::time::timeout(self.config.shutdown_timeout, client.shutdown()).await;
        if outcome.is_err() {
            warn!(server = %client.server_id, "shutdown timed out, killing process group");
            client.process_handle().kill_group();
        }
        self.registry.unregister(client.process_handle().pid()).await;
    }

    /// Shut down every client, then drain the process registry for any
    /// leaked descendants, then clear all three maps.
    pub async fn shutdown_all(&self) {
        let clients: Vec<Arc<LspClient>> = self.clients.write().await.drain().map(|(_, c)| c).collect();
        for client in &clients {
            self.shutdown_one(client).await;
        }
        self.registry.kill_all().await;
        self.initializing.lock().await.clear();
        self.broken.write().await.clear();
    }

    pub async fn running_servers(&self) -> Vec<RunningServer> {
        self.clients
            .read()
            .await
            .values()
            .map(|c| RunningServer {
                server_id: c.server_id.clone(),
                root: c.project_root.clone(),
                uptime_ms: c.created_at.elapsed().as_millis(),
            })
            .collect()
    }
}

fn first_location(response: &GotoDefinitionResponse) -> Option<(PathBuf, Position)> {
    match response {
        GotoDefinitionResponse::Scalar(loc) => Some((uri_to_path(loc.uri.as_str()), loc.range.start)),
        GotoDefinitionResponse::Array(locs) => locs
            .first()
            .map(|loc| (uri_to_path(loc.uri.as_str()), loc.range.start)),
        GotoDefinitionResponse::Link(links) => links.first().map(|link| {
            (
                uri_to_path(link.target_uri.as_str()),
                link.target_selection_range.start,
            )
        }),
    }
}

/// Collect positions (and symbol kind, if known) of document symbols whose
/// name exactly matches `query`, handling both hierarchical and flat shapes.
fn find_symbol_occurrences(
    response: &DocumentSymbolResponse,
    query: &str,
) -> Vec<(u32, u32, Option<SymbolKind>)> {
    let mut out = Vec::new();
    match response {
        DocumentSymbolResponse::Nested(symbols) => collect_nested(symbols, query, &mut out),
        DocumentSymbolResponse::Flat(symbols) => collect_flat(symbols, query, &mut out),
    }
    out
}

fn collect_nested(symbols: &[DocumentSymbol], query: &str, out: &mut Vec<(u32, u32, Option<SymbolKind>)>) {
    for symbol in symbols {
        if symbol.name == query {
            out.push((
                symbol.selection_range.start.line,
                symbol.selection_range.start.character,
                Some(symbol.kind),
            ));
        }
        if let Some(children) = &symbol.children {
            collect_nested(children, query, out);
        }
    }
}

fn collect_flat(symbols: &[SymbolInformation], query: &str, out: &mut Vec<(u32, u32, Option<SymbolKind>)>) {
    for symbol in symbols {
        if symbol.name == query {
            out.push((
                symbol.location.range.start.line,
                symbol.location.range.start.character,
                Some(symbol.kind),
            ));
        }
    }
}

fn dedupe_sorted(
    mut occurrences: Vec<(u32, u32, Option<SymbolKind>)>,
) -> Vec<(u32, u32, Option<SymbolKind>)> {
    occurrences.sort_by_key(|(l, c, _)| (*l, *c));
    occurrences.dedup_by_key(|(l, c, _)| (*l, *c));
    occurrences
}

/// Find every whole-word occurrence of `query` in `content`, where a word
/// boundary is any character not in `[A-Za-z0-9_$]`.
fn word_boundary_occurrences(content: &str, query: &str) -> Vec<(u32, u32)> {
    if query.is_empty() {
        return Vec::new();
    }
    let is_word_char = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '$';
    let mut out = Vec::new();

    for (line_no, line) in content.lines().enumerate() {
        let chars: Vec<char> = line.chars().collect();
        let query_chars: Vec<char> = query.chars().collect();
        if query_chars.is_empty() || chars.len() < query_chars.len() {
            continue;
        }
        for start in 0..=(chars.len() - query_chars.len()) {
            if chars[start..start + query_chars.len()] != query_chars[..] {
                continue;
            }
            let before_ok = start == 0 || !is_word_char(chars[start - 1]);
            let end = start + query_chars.len();
            let after_ok = end == chars.len() || !is_word_char(chars[end]);
            if before_ok && after_ok {
                out.push((line_no as u32, start as u32));
            }
        }
    }
    let mut sorted: Vec<(u32, u32, Option<SymbolKind>)> =
        out.into_iter().map(|(l, c)| (l, c, None)).collect();
    sorted = dedupe_sorted(sorted);
    sorted.into_iter().map(|(l, c, _)| (l, c)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_boundary_matches_exact_word_only() {
        let content = "let add = 1;\naddress.add(3);\nlet padded = add + 1;\n";
        let hits = word_boundary_occurrences(content, "add");
        // line0: "add" in "let add"; line1: "add(" inside "address.add("; line2: " add "
        assert_eq!(hits, vec![(0, 4), (1, 8), (2, 11)]);
    }

    #[test]
    fn word_boundary_finds_nothing_for_absent_query() {
        let content = "no matches here";
        assert!(word_boundary_occurrences(content, "xyz").is_empty());
    }

    #[test]
    fn dedupe_sorted_removes_duplicate_positions() {
        let input = vec![(2, 3, None), (1, 0, None), (1, 0, None)];
        assert_eq!(dedupe_sorted(input), vec![(1, 0, None), (2, 3, None)]);
    }
}
