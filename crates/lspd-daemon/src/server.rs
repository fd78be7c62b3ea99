//! Daemon Server: accepts local-socket connections, validates requests
//! against the fixed schema, dispatches to the [`LspManager`], and returns
//! one JSON response per connection.

use crate::instancing::DaemonPaths;
use crate::protocol::{failure, success, Command, Request};
use lspd_lsp::manager::LspManager;
use lspd_util::appendlog::AppendLog;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tracing::{error, info, warn};

pub struct DaemonServer {
    manager: Arc<LspManager>,
    paths: DaemonPaths,
    cwd: PathBuf,
    log: Arc<AppendLog>,
    shutdown: Arc<Notify>,
    fatal: Arc<AtomicBool>,
}

impl DaemonServer {
    pub fn new(manager: Arc<LspManager>, paths: DaemonPaths, cwd: PathBuf) -> Self {
        let log = Arc::new(AppendLog::new(paths.log_file.clone()));
        Self {
            manager,
            paths,
            cwd,
            log,
            shutdown: Arc::new(Notify::new()),
            fatal: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.log.path().to_path_buf()
    }

    /// Remove stale socket/PID/config files from a prior crashed instance,
    /// bind the socket, write our own PID file, and serve until a shutdown
    /// signal (SIGINT/SIGTERM, an internal `stop` command, or a panic).
    pub async fn run(self) -> anyhow::Result<()> {
        crate::instancing::cleanup_stale_files(&self.paths);

        let listener = UnixListener::bind(&self.paths.socket_path)?;
        crate::instancing::write_pid_file(&self.paths.pid_file, std::process::id())?;
        self.log.write_line("daemon started").ok();
        info!(socket = %self.paths.socket_path.display(), "daemon listening");

        let server = Arc::new(self);
        install_signal_handlers(server.clone());

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let server = server.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    warn!(error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "accept error"),
                    }
                }
                _ = server.shutdown.notified() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        server.shutdown_and_cleanup().await;
        if server.fatal.load(Ordering::SeqCst) {
            anyhow::bail!("daemon terminated after an uncaught panic");
        }
        Ok(())
    }

    async fn handle_connection(&self, mut stream: UnixStream) -> anyhow::Result<()> {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;

        let response = match serde_json::from_slice::<Request>(&buf) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => failure(format!("malformed request: {e}")),
        };

        let body = serde_json::to_vec(&response)?;
        stream.write_all(&body).await?;
        stream.shutdown().await.ok();
        Ok(())
    }

    async fn dispatch(&self, request: Request) -> serde_json::Value {
        let Some(command) = Command::parse(&request.command) else {
            return failure(format!("unknown command: {}", request.command));
        };
        if let Err(e) = command.validate_args(&request.args) {
            return failure(e);
        }

        self.log
            .write_line(&format!("command={} args={:?}", request.command, request.args))
            .ok();

        match command {
            Command::Status => success(serde_json::Value::String(self.status_text().await)),
            Command::Diagnostics => self.handle_diagnostics(&request.args[0]).await,
            Command::Hover => self.handle_hover(&request.args[0], &request.args[1]).await,
            Command::Start => self.handle_start(request.args.first()).await,
            Command::Logs => success(serde_json::Value::String(
                self.log.path().display().to_string(),
            )),
            Command::Pwd => success(serde_json::Value::String(self.cwd.display().to_string())),
            Command::Stop => {
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    shutdown.notify_one();
                });
                success(serde_json::Value::String("Daemon stopping…".to_string()))
            }
        }
    }

    async fn handle_diagnostics(&self, file_arg: &str) -> serde_json::Value {
        let path = resolve_path(&self.cwd, file_arg);
        match self.manager.diagnostics(&path).await {
            Ok(diags) => success(serde_json::to_value(diags).unwrap_or_default()),
            Err(e) => failure(e),
        }
    }

    async fn handle_hover(&self, file_arg: &str, symbol: &str) -> serde_json::Value {
        let path = resolve_path(&self.cwd, file_arg);
        match self.manager.hover(&path, symbol).await {
            Ok(results) => {
                let json: Vec<serde_json::Value> = results
                    .into_iter()
                    .map(|r| {
                        serde_json::json!({
                            "symbolName": r.symbol_name,
                            "hoverContents": r.hover_contents,
                            "signatureHelp": r.signature_help,
                            "resolvedLocation": {
                                "file": r.resolved_file,
                                "line": r.resolved_line,
                                "character": r.resolved_character,
                            },
                            "description": r.description.as_str(),
                        })
                    })
                    .collect();
                success(serde_json::Value::Array(json))
            }
            Err(e) => failure(e),
        }
    }

    async fn handle_start(&self, dir_arg: Option<&String>) -> serde_json::Value {
        let dir = dir_arg
            .map(|d| resolve_path(&self.cwd, d))
            .unwrap_or_else(|| self.cwd.clone());

        let ids = match lspd_lsp::detect::detect_servers(&dir, self.manager.catalog()).await {
            Ok(ids) => ids,
            Err(e) => return failure(e),
        };

        if !ids.is_empty() {
            LspManager::prewarm(
                self.manager.clone(),
                dir,
                ids.iter().map(|s| s.to_string()).collect(),
            );
        }

        let summary = if ids.is_empty() {
            "No applicable language servers detected".to_string()
        } else {
            format!("Detected servers: {}", ids.join(", "))
        };
        success(serde_json::Value::String(summary))
    }

    async fn status_text(&self) -> String {
        let running = self.manager.running_servers().await;
        if running.is_empty() {
            return "No language servers running".to_string();
        }
        let mut lines = vec![format!("{} language server(s) running:", running.len())];
        for server in running {
            lines.push(format!(
                "  {} @ {} (uptime {}ms)",
                server.server_id,
                server.root.display(),
                server.uptime_ms
            ));
        }
        lines.join("\n")
    }

    async fn shutdown_and_cleanup(&self) {
        self.manager.shutdown_all().await;
        crate::instancing::cleanup_stale_files(&self.paths);
        self.log.write_line("daemon stopped").ok();
    }
}

fn resolve_path(cwd: &std::path::Path, arg: &str) -> PathBuf {
    let path = PathBuf::from(arg);
    if path.is_absolute() {
        path
    } else {
        cwd.join(path)
    }
}

/// `SIGINT`/`SIGTERM` trigger graceful shutdown; a panic anywhere is logged,
/// flags the shutdown as fatal (§6: exit 1 rather than 0), and also triggers
/// shutdown (there is no Rust equivalent of an `unhandledRejection` to
/// separately suppress — a task's `Result::Err` is already handled locally
/// by its caller and never escalates).
fn install_signal_handlers(server: Arc<DaemonServer>) {
    let panic_fatal = server.fatal.clone();
    let panic_shutdown = server.shutdown.clone();
    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!(panic = %info, "uncaught panic, shutting down");
        panic_fatal.store(true, Ordering::SeqCst);
        panic_shutdown.notify_one();
        previous_hook(info);
    }));

    #[cfg(unix)]
    {
        let sigint_shutdown = server.shutdown.clone();
        tokio::spawn(async move {
            let mut sigint =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).unwrap();
            sigint.recv().await;
            info!("SIGINT received");
            sigint_shutdown.notify_one();
        });
        let sigterm_shutdown = server.shutdown.clone();
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).unwrap();
            sigterm.recv().await;
            info!("SIGTERM received");
            sigterm_shutdown.notify_one();
        });
    }
    #[cfg(not(unix))]
    {
        let ctrlc_shutdown = server.shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            ctrlc_shutdown.notify_one();
        });
    }
}
