//! Process Registry: a daemon-global safety net for language-server child
//! processes and their descendants.
//!
//! Every LSP child is spawned into its own process group (`setsid` on
//! POSIX) so a forced shutdown can signal the whole group at once, catching
//! grandchildren some language servers spawn outside of normal supervision.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Arranges for a spawned child to become the leader of a new process group.
#[cfg(unix)]
pub fn detach_new_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    // Safety: setsid(2) is async-signal-safe and is the only syscall made
    // between fork and exec here.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(windows)]
pub fn detach_new_group(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

/// A lightweight handle identifying a spawned child's process group leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pid: u32,
}

impl ProcessHandle {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Signal-0 liveness probe: does this pid still exist?
    #[cfg(unix)]
    pub fn is_alive(&self) -> bool {
        // Safety: kill(pid, 0) performs no action beyond error checking.
        unsafe { libc::kill(self.pid as libc::pid_t, 0) == 0 }
    }

    #[cfg(not(unix))]
    pub fn is_alive(&self) -> bool {
        true
    }

    /// Force-kill the entire process group this pid leads.
    #[cfg(unix)]
    pub fn kill_group(&self) {
        // Since the child was started via setsid(), its pid is also its
        // process group id; signaling the negated pid targets the group.
        unsafe {
            libc::kill(-(self.pid as libc::pid_t), libc::SIGKILL);
        }
    }

    #[cfg(windows)]
    pub fn kill_group(&self) {
        // Best effort: taskkill /T walks the process tree rooted at pid.
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &self.pid.to_string(), "/T", "/F"])
            .output();
    }
}

/// Daemon-global registry of every child the LSP layer has spawned.
#[derive(Default)]
pub struct ProcessRegistry {
    children: Mutex<HashMap<u32, ProcessHandle>>,
}

impl ProcessRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, handle: ProcessHandle) {
        self.children.lock().await.insert(handle.pid(), handle);
    }

    pub async fn unregister(&self, pid: u32) {
        self.children.lock().await.remove(&pid);
    }

    pub async fn len(&self) -> usize {
        self.children.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Force-kill every remaining registered process group. Used on the
    /// shutdown timeout escalation path, and as a safety net for any
    /// descendant that escaped its owning [`crate::client::ServerConnection`].
    pub async fn kill_all(&self) {
        let mut children = self.children.lock().await;
        for (pid, handle) in children.drain() {
            debug!(pid, "force-killing leaked process group");
            handle.kill_group();
        }
    }

    /// Drop entries whose process has already exited, logging anything that
    /// outlived its owner.
    pub async fn reap_dead(&self) {
        let mut children = self.children.lock().await;
        children.retain(|pid, handle| {
            let alive = handle.is_alive();
            if !alive {
                debug!(pid, "process registry entry reaped (already exited)");
            }
            alive
        });
        if !children.is_empty() {
            warn!(count = children.len(), "process registry non-empty after reap");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_unregister() {
        let registry = ProcessRegistry::new();
        registry.register(ProcessHandle::new(1)).await;
        assert_eq!(registry.len().await, 1);
        registry.unregister(1).await;
        assert_eq!(registry.len().await, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_current_process_is_alive() {
        let handle = ProcessHandle::new(std::process::id());
        assert!(handle.is_alive());
    }
}
