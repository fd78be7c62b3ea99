//! Project Root Resolver: walks upward from a file looking for marker files.

use std::path::{Path, PathBuf};

/// Resolve the project root for `path` given an ordered list of marker
/// patterns (exact filenames or glob patterns containing `*`).
///
/// `SINGLE_ROOT_MODE=true` short-circuits the search and always returns
/// `daemon_cwd`. Otherwise, walks upward testing each marker pattern at
/// each directory; on first hit, returns that directory. If the filesystem
/// root is reached without a hit, returns `daemon_cwd`.
pub fn resolve_root(path: &Path, markers: &[String], daemon_cwd: &Path) -> PathBuf {
    if single_root_mode() {
        return daemon_cwd.to_path_buf();
    }

    let mut dir = if path.is_file() {
        match path.parent() {
            Some(p) => p.to_path_buf(),
            None => return daemon_cwd.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    };

    loop {
        for marker in markers {
            if marker_matches(&dir, marker) {
                return dir;
            }
        }
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => return daemon_cwd.to_path_buf(),
        }
    }
}

fn single_root_mode() -> bool {
    std::env::var("SINGLE_ROOT_MODE")
        .map(|v| v == "true")
        .unwrap_or(false)
}

fn marker_matches(dir: &Path, pattern: &str) -> bool {
    if pattern.contains('*') {
        let full_pattern = dir.join(pattern);
        let Some(pattern_str) = full_pattern.to_str() else {
            return false;
        };
        glob::glob(pattern_str)
            .map(|mut matches| matches.next().is_some())
            .unwrap_or(false)
    } else {
        dir.join(pattern).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // SINGLE_ROOT_MODE is process-global; serialize the tests that touch it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn finds_exact_marker_in_ancestor() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("SINGLE_ROOT_MODE");
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("go.mod"), "module x").unwrap();
        std::fs::create_dir(dir.path().join("pkg")).unwrap();
        let file = dir.path().join("pkg/main.go");
        std::fs::write(&file, "package pkg").unwrap();

        let root = resolve_root(&file, &["go.mod".to_string()], dir.path());
        assert_eq!(root, dir.path());
    }

    #[test]
    fn falls_back_to_daemon_cwd_without_marker() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("SINGLE_ROOT_MODE");
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("lonely.go");
        std::fs::write(&file, "package main").unwrap();

        let root = resolve_root(&file, &["go.mod".to_string()], dir.path());
        assert_eq!(root, dir.path());
    }

    #[test]
    fn single_root_mode_short_circuits() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("SINGLE_ROOT_MODE", "true");
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("go.mod"), "module x").unwrap();
        let cwd = tempfile::tempdir().unwrap();
        let root = resolve_root(dir.path(), &["go.mod".to_string()], cwd.path());
        std::env::remove_var("SINGLE_ROOT_MODE");
        assert_eq!(root, cwd.path());
    }

    #[test]
    fn glob_marker_matches() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("SINGLE_ROOT_MODE");
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.csproj"), "<Project/>").unwrap();
        let file = dir.path().join("Program.cs");
        std::fs::write(&file, "class Program {}").unwrap();

        let root = resolve_root(&file, &["*.csproj".to_string()], dir.path());
        assert_eq!(root, dir.path());
    }

    #[test]
    fn idempotent_on_already_resolved_root() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("SINGLE_ROOT_MODE");
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("go.mod"), "module x").unwrap();
        let file = dir.path().join("main.go");
        std::fs::write(&file, "package main").unwrap();

        let once = resolve_root(&file, &["go.mod".to_string()], dir.path());
        let twice = resolve_root(&once, &["go.mod".to_string()], dir.path());
        assert_eq!(once, twice);
    }
}
