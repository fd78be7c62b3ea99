//! Minimal entry point wiring the daemon and client driver together.
//!
//! Full subcommand parsing, human-facing formatters, and the hook/MCP
//! front-ends are out of scope for this crate (§1); this binary exposes
//! just enough argv handling to run the daemon and issue the fixed request
//! set against it.

use lspd_daemon::{client_driver, config_loader, instancing, server};
use lspd_util::log::{init as init_tracing, LogConfig};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    if std::env::var("DAEMON_MODE").as_deref() == Ok("1") || args.first().map(String::as_str) == Some("daemon") {
        return run_daemon(cwd).await;
    }

    let mut iter = args.into_iter();
    let command = iter.next().unwrap_or_else(|| "status".to_string());
    let rest: Vec<String> = iter.collect();

    init_tracing(LogConfig {
        print: true,
        ..Default::default()
    });

    let response = client_driver::send(&cwd, None, &command, &rest).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    let success = response.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
    std::process::exit(if success { 0 } else { 1 });
}

async fn run_daemon(cwd: PathBuf) -> anyhow::Result<()> {
    let loaded = config_loader::load(None)?;

    init_tracing(LogConfig {
        print: false,
        level: loaded.daemon.log_level,
        ..Default::default()
    });

    let paths = instancing::DaemonPaths::for_cwd(&cwd);
    let metadata = instancing::ConfigMetadata {
        config_path: loaded.config_path.clone(),
        started_at: chrono::Utc::now().to_rfc3339(),
    };
    metadata.write(&paths.config_metadata_file)?;

    let daemon_env: std::collections::HashMap<String, String> = std::env::vars().collect();
    let manager_config = lspd_lsp::manager::ManagerConfig {
        shutdown_timeout: loaded.daemon.shutdown_timeout,
        push_diagnostics_timeout: loaded.daemon.push_diagnostics_timeout,
    };
    let manager = std::sync::Arc::new(lspd_lsp::manager::LspManager::new(
        std::sync::Arc::new(loaded.catalog),
        cwd.clone(),
        daemon_env,
        manager_config,
    ));

    let daemon = server::DaemonServer::new(manager, paths, cwd);
    daemon.run().await
}
