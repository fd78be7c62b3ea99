//! LSP transport: Content-Length-framed JSON-RPC over a child process's stdio.
//!
//! Unlike a simple request/response transport, a real LSP server can push
//! notifications (`textDocument/publishDiagnostics`) and issue its own
//! requests (`workspace/configuration`, `window/workDoneProgress/create`) at
//! any time. A background task owns the child's stdout, demultiplexing
//! responses (matched to pending requests by id) from server-initiated
//! notifications and requests, which are forwarded on an unbounded channel
//! for the owning [`crate::client::ServerConnection`] to handle.

use crate::error::{LspError, LspResult};
use crate::process_registry::ProcessHandle;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A server-initiated notification or request, handed to the owner of the
/// connection for dispatch.
#[derive(Debug)]
pub enum Incoming {
    Notification { method: String, params: Value },
    /// A server -> client request; `id` must be echoed back via [`Transport::respond`].
    Request { id: Value, method: String, params: Value },
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<Value, JsonRpcError>>>>;

/// A live JSON-RPC connection to one language server child process.
pub struct Transport {
    stdin: Mutex<ChildStdin>,
    next_id: AtomicU64,
    pending: PendingMap,
    child: Mutex<Option<Child>>,
    handle: ProcessHandle,
}

impl Transport {
    /// Spawn `command` with `args` in `cwd`, with `env` overlaid on the
    /// current process environment, placing the child in its own process
    /// group so that a forced shutdown can reap its whole tree.
    pub async fn spawn(
        command: &str,
        args: &[String],
        cwd: &std::path::Path,
        env: &HashMap<String, String>,
    ) -> LspResult<(Arc<Self>, mpsc::UnboundedReceiver<Incoming>)> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(cwd)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        crate::process_registry::detach_new_group(&mut cmd);

        debug!(command, ?args, cwd = %cwd.display(), "spawning language server");

        let mut child = cmd
            .spawn()
            .map_err(|e| LspError::ProcessError(format!("failed to start {command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LspError::ProcessError("child has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LspError::ProcessError("child has no stdout".into()))?;

        let pid = child.id().ok_or_else(|| {
            LspError::ProcessError("child exited before its pid could be read".into())
        })?;
        let handle = ProcessHandle::new(pid);

        let transport = Arc::new(Self {
            stdin: Mutex::new(stdin),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            child: Mutex::new(Some(child)),
            handle: handle.clone(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::read_loop(transport.clone(), BufReader::new(stdout), tx));

        Ok((transport, rx))
    }

    pub fn process_handle(&self) -> &ProcessHandle {
        &self.handle
    }

    /// Send a request and await its matched response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> LspResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(e) = self.send(&body).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(LspError::request_failed(format!(
                "{} (code {})",
                err.message, err.code
            ))),
            Err(_) => Err(LspError::connection_disposed()),
        }
    }

    /// Send a notification (no reply expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> LspResult<()> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.send(&body).await
    }

    /// Reply to a server-initiated request.
    pub async fn respond(&self, id: Value, result: Value) -> LspResult<()> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        });
        self.send(&body).await
    }

    async fn send(&self, body: &Value) -> LspResult<()> {
        let content = serde_json::to_string(body)?;
        let mut stdin = self.stdin.lock().await;
        let message = format!("Content-Length: {}\r\n\r\n{}", content.len(), content);
        trace!(%content, "sending LSP message");
        stdin
            .write_all(message.as_bytes())
            .await
            .map_err(|_| LspError::connection_disposed())?;
        stdin
            .flush()
            .await
            .map_err(|_| LspError::connection_disposed())
    }

    async fn read_loop(
        transport: Arc<Self>,
        mut stdout: BufReader<tokio::process::ChildStdout>,
        tx: mpsc::UnboundedSender<Incoming>,
    ) {
        loop {
            match Self::read_message(&mut stdout).await {
                Ok(Some(raw)) => {
                    let value: Value = match serde_json::from_str(&raw) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "dropping malformed LSP message");
                            continue;
                        }
                    };
                    transport.dispatch(value, &tx).await;
                }
                Ok(None) => {
                    debug!("language server closed its stdout");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "error reading from language server");
                    break;
                }
            }
        }
        // Fail any requests still awaiting a response; the connection is gone.
        let mut pending = transport.pending.lock().await;
        for (_, waiter) in pending.drain() {
            let _ = waiter.send(Err(JsonRpcError {
                code: -32000,
                message: "connection closed".into(),
                data: None,
            }));
        }
    }

    async fn dispatch(&self, value: Value, tx: &mpsc::UnboundedSender<Incoming>) {
        let has_id = value.get("id").is_some();
        let has_method = value.get("method").is_some();

        if has_id && !has_method {
            // A response to one of our own requests.
            let Some(id) = value.get("id").and_then(Value::as_u64) else {
                warn!("response had non-numeric id, dropping");
                return;
            };
            let Some(waiter) = self.pending.lock().await.remove(&id) else {
                return;
            };
            if let Some(err) = value.get("error") {
                if let Ok(err) = serde_json::from_value::<JsonRpcError>(err.clone()) {
                    let _ = waiter.send(Err(err));
                    return;
                }
            }
            let result = value.get("result").cloned().unwrap_or(Value::Null);
            let _ = waiter.send(Ok(result));
        } else if has_id && has_method {
            let id = value.get("id").cloned().unwrap_or(Value::Null);
            let method = value
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            let _ = tx.send(Incoming::Request { id, method, params });
        } else if has_method {
            let method = value
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            let _ = tx.send(Incoming::Notification { method, params });
        }
    }

    async fn read_message(
        stdout: &mut BufReader<tokio::process::ChildStdout>,
    ) -> LspResult<Option<String>> {
        let mut content_length: Option<usize> = None;
        loop {
            let mut line = String::new();
            let bytes = stdout.read_line(&mut line).await?;
            if bytes == 0 {
                return Ok(None);
            }
            let line = line.trim();
            if line.is_empty() {
                break;
            }
            if let Some(len_str) = line.strip_prefix("Content-Length: ") {
                content_length = Some(
                    len_str
                        .parse()
                        .map_err(|_| LspError::protocol_error("invalid Content-Length"))?,
                );
            }
        }

        let content_length =
            content_length.ok_or_else(|| LspError::protocol_error("missing Content-Length"))?;

        let mut content = vec![0u8; content_length];
        stdout.read_exact(&mut content).await?;
        let content = String::from_utf8(content)
            .map_err(|e| LspError::protocol_error(format!("invalid UTF-8: {e}")))?;
        trace!(%content, "received LSP message");
        Ok(Some(content))
    }

    /// Graceful close: drop stdin so the server sees EOF, give it a moment,
    /// then fall through to the process group kill on the caller's timeout.
    pub async fn close(&self) {
        // Dropping stdin would require replacing the mutex contents; a
        // shutdown/exit notification pair is expected to have already been
        // sent by the caller, so here we just ensure the child is reaped.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let mut child = self.child.lock().await;
        if let Some(child) = child.as_mut() {
            let _ = child.start_kill();
        }
    }

    pub async fn kill(&self) {
        let mut child = self.child.lock().await;
        if let Some(child) = child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let result = Transport::spawn(
            "definitely_not_a_real_lsp_binary_12345",
            &[],
            std::path::Path::new("."),
            &HashMap::new(),
        )
        .await;
        assert!(result.is_err());
    }
}
