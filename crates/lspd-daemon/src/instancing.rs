//! Daemon Instancing: maps a working directory to a deterministic socket
//! path, PID file, config-metadata file, and log file, and implements the
//! liveness probe and config-conflict check that keep one daemon per
//! working directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;

const PREFIX: &str = "lspd";
/// Config-switch poll budget: 20 polls at 200ms, ~4s total.
const CONFIG_SWITCH_POLLS: u32 = 20;
const CONFIG_SWITCH_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// The set of deterministic, sibling paths for one working directory's daemon.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub socket_path: PathBuf,
    pub pid_file: PathBuf,
    pub config_metadata_file: PathBuf,
    pub log_file: PathBuf,
}

impl DaemonPaths {
    /// Derive all sibling paths from `cwd`'s hash, rooted in the system temp directory.
    pub fn for_cwd(cwd: &Path) -> Self {
        let hash = hash_workdir(cwd);
        let base = std::env::temp_dir();
        Self {
            socket_path: base.join(format!("{PREFIX}-{hash}.sock")),
            pid_file: base.join(format!("{PREFIX}-{hash}.pid")),
            config_metadata_file: base.join(format!("{PREFIX}-{hash}.config")),
            log_file: base.join(format!("{PREFIX}-{hash}.log")),
        }
    }
}

/// Absolute value of a 32-bit multiplicative (Java-style) hash of the
/// working directory's display string, base-36 encoded. A naming
/// convenience only; not a security boundary (see DESIGN.md).
pub fn hash_workdir(cwd: &Path) -> String {
    let s = cwd.display().to_string();
    let mut h: i32 = 0;
    for c in s.chars() {
        h = h.wrapping_mul(31).wrapping_add(c as i32);
    }
    to_base36(h.unsigned_abs())
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap()
}

/// `{ configPath | null, startedAt }`, persisted at daemon startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMetadata {
    #[serde(rename = "configPath")]
    pub config_path: Option<PathBuf>,
    #[serde(rename = "startedAt")]
    pub started_at: String,
}

impl ConfigMetadata {
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, serde_json::to_string(self)?)
    }

    pub fn read(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(std::io::Error::other)
    }
}

pub fn write_pid_file(path: &Path, pid: u32) -> std::io::Result<()> {
    std::fs::write(path, pid.to_string())
}

pub fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    // Safety: kill(pid, 0) performs no action beyond existence/permission checks.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}

async fn socket_accepts_connections(socket_path: &Path) -> bool {
    UnixStream::connect(socket_path).await.is_ok()
}

/// A daemon is "running" iff the PID file exists, names a live process, and
/// the socket accepts a test connection. Any missing condition is stale.
pub async fn is_running(paths: &DaemonPaths) -> bool {
    let Some(pid) = read_pid_file(&paths.pid_file) else {
        return false;
    };
    if !pid_is_alive(pid) {
        return false;
    }
    socket_accepts_connections(&paths.socket_path).await
}

/// Remove a prior crashed instance's socket, PID, and metadata files.
pub fn cleanup_stale_files(paths: &DaemonPaths) {
    let _ = std::fs::remove_file(&paths.socket_path);
    let _ = std::fs::remove_file(&paths.pid_file);
    let _ = std::fs::remove_file(&paths.config_metadata_file);
}

/// Compare `requested_config` (canonicalized) against the running daemon's
/// stored config path; on mismatch ask it to stop and poll for shutdown.
pub async fn resolve_config_conflict(
    paths: &DaemonPaths,
    requested_config: Option<&Path>,
) -> anyhow::Result<bool> {
    let Ok(metadata) = ConfigMetadata::read(&paths.config_metadata_file) else {
        return Ok(false);
    };
    let requested = requested_config.and_then(|p| p.canonicalize().ok());
    let stored = metadata.config_path.and_then(|p| p.canonicalize().ok());
    if requested == stored {
        return Ok(false);
    }

    crate::client_driver::send_raw_request(paths, "stop", &[]).await.ok();

    for _ in 0..CONFIG_SWITCH_POLLS {
        if !is_running(paths).await {
            return Ok(true);
        }
        tokio::time::sleep(CONFIG_SWITCH_POLL_INTERVAL).await;
    }
    anyhow::bail!("timed out waiting for mismatched-config daemon to stop")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let a = hash_workdir(Path::new("/home/user/project"));
        let b = hash_workdir(Path::new("/home/user/project"));
        assert_eq!(a, b);
    }

    #[test]
    fn hash_differs_across_dirs() {
        let a = hash_workdir(Path::new("/home/user/project-a"));
        let b = hash_workdir(Path::new("/home/user/project-b"));
        assert_ne!(a, b);
    }

    #[test]
    fn for_cwd_builds_four_sibling_paths_sharing_hash() {
        let paths = DaemonPaths::for_cwd(Path::new("/tmp/example"));
        let hash = hash_workdir(Path::new("/tmp/example"));
        assert!(paths.socket_path.to_string_lossy().contains(&hash));
        assert!(paths.pid_file.to_string_lossy().contains(&hash));
        assert!(paths.config_metadata_file.to_string_lossy().contains(&hash));
        assert!(paths.log_file.to_string_lossy().contains(&hash));
    }

    #[tokio::test]
    async fn is_running_false_without_pid_file() {
        let paths = DaemonPaths {
            socket_path: PathBuf::from("/tmp/lspd-test-missing.sock"),
            pid_file: PathBuf::from("/tmp/lspd-test-missing.pid"),
            config_metadata_file: PathBuf::from("/tmp/lspd-test-missing.config"),
            log_file: PathBuf::from("/tmp/lspd-test-missing.log"),
        };
        assert!(!is_running(&paths).await);
    }

    #[test]
    fn pid_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");
        write_pid_file(&path, 4242).unwrap();
        assert_eq!(read_pid_file(&path), Some(4242));
    }

    #[test]
    fn config_metadata_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.config");
        let metadata = ConfigMetadata {
            config_path: Some(PathBuf::from("/etc/lspd.json")),
            started_at: "2026-01-01T00:00:00Z".to_string(),
        };
        metadata.write(&path).unwrap();
        let read_back = ConfigMetadata::read(&path).unwrap();
        assert_eq!(read_back.config_path, metadata.config_path);
        assert_eq!(read_back.started_at, metadata.started_at);
    }
}
