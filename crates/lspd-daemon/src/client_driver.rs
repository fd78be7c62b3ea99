//! Client Driver: the short-lived command-side half of the system (§4.9).
//! Locates or spawns a daemon for a working directory, opens the socket,
//! sends one request, and returns the one response it reads back.

use crate::instancing::{is_running, resolve_config_conflict, DaemonPaths};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// Bounded retries while waiting for a freshly-spawned daemon's socket to
/// start accepting connections.
const STARTUP_POLL_ATTEMPTS: u32 = 50;
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Ensure a daemon is running for `cwd`, spawning one if absent or stale,
/// and resolving a config-path mismatch against an already-running one.
pub async fn ensure_daemon(cwd: &Path, config_path: Option<&Path>) -> anyhow::Result<DaemonPaths> {
    let paths = DaemonPaths::for_cwd(cwd);

    if is_running(&paths).await {
        let restarted = resolve_config_conflict(&paths, config_path).await?;
        if !restarted {
            return Ok(paths);
        }
    }

    spawn_daemon(cwd, &paths)?;
    wait_for_socket(&paths.socket_path).await?;
    Ok(paths)
}

fn spawn_daemon(cwd: &Path, paths: &DaemonPaths) -> anyhow::Result<()> {
    crate::instancing::cleanup_stale_files(paths);

    let exe = std::env::current_exe()?;
    std::process::Command::new(exe)
        .current_dir(cwd)
        .env("DAEMON_MODE", "1")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;
    Ok(())
}

async fn wait_for_socket(socket_path: &Path) -> anyhow::Result<()> {
    for _ in 0..STARTUP_POLL_ATTEMPTS {
        if UnixStream::connect(socket_path).await.is_ok() {
            return Ok(());
        }
        tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
    }
    anyhow::bail!("timed out waiting for daemon to start")
}

/// Open the socket, write one JSON request, read one JSON response, close.
pub async fn send_raw_request(
    paths: &DaemonPaths,
    command: &str,
    args: &[String],
) -> anyhow::Result<Value> {
    let mut stream = UnixStream::connect(&paths.socket_path).await?;

    let request = serde_json::json!({ "command": command, "args": args });
    stream.write_all(&serde_json::to_vec(&request)?).await?;
    stream.shutdown().await.ok();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Ensure a daemon exists for `cwd`, then send one request and return its response.
pub async fn send(
    cwd: &Path,
    config_path: Option<&Path>,
    command: &str,
    args: &[String],
) -> anyhow::Result<Value> {
    let paths = ensure_daemon(cwd, config_path).await?;
    send_raw_request(&paths, command, args).await
}
