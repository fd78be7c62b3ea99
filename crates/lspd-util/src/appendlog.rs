//! The daemon's own line-oriented log file.
//!
//! This is a separate, deliberately minimal sink from the `tracing` setup in
//! [`crate::log`]: its exact line format (`[ISO-8601] message`) is part of
//! the daemon's external contract, since the `logs` command reports this
//! file's path to callers.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only writer for the daemon log file.
#[derive(Debug, Clone)]
pub struct AppendLog {
    path: PathBuf,
}

impl AppendLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one `[ISO-8601] message` line, creating the file if needed.
    pub fn write_line(&self, message: &str) -> std::io::Result<()> {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "[{timestamp}] {message}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_line_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = AppendLog::new(dir.path().join("daemon.log"));
        log.write_line("first").unwrap();
        log.write_line("second").unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("first"));
        assert!(lines[1].ends_with("second"));
        assert!(lines[0].starts_with('['));
    }
}
