//! Project Type Detector: given a directory, return the applicable servers.

use crate::catalog::ServerCatalog;
use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

const MAX_GLOB_DEPTH: usize = 3;

/// Detect which catalog servers apply to `dir`, in catalog enumeration order,
/// without duplicates.
pub async fn detect_servers<'a>(
    dir: &Path,
    catalog: &'a ServerCatalog,
) -> anyhow::Result<Vec<&'a str>> {
    let extensions = if is_vcs_tree(dir) {
        vcs_tracked_extensions(dir, catalog).await?
    } else {
        fallback_detect_extensions(dir, catalog).await
    };

    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for server in catalog.all() {
        if seen.contains(&server.id) {
            continue;
        }
        if server.extensions.iter().any(|e| extensions.contains(e)) {
            seen.insert(server.id.clone());
            ids.push(server.id.as_str());
        }
    }
    Ok(ids)
}

fn is_vcs_tree(dir: &Path) -> bool {
    let mut probe = Some(dir.to_path_buf());
    while let Some(d) = probe {
        if d.join(".git").exists() {
            return true;
        }
        probe = d.parent().map(|p| p.to_path_buf());
    }
    false
}

/// Fast path: `git ls-files`, stopping as soon as every catalog extension
/// has been observed (or stdout is exhausted), then killing the process.
async fn vcs_tracked_extensions(
    dir: &Path,
    catalog: &ServerCatalog,
) -> anyhow::Result<HashSet<String>> {
    let mut remaining: HashSet<String> = catalog
        .all()
        .iter()
        .flat_map(|s| s.extensions.iter().cloned())
        .collect();
    let mut found = HashSet::new();

    let mut child = Command::new("git")
        .arg("-C")
        .arg(dir)
        .arg("ls-files")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while !remaining.is_empty() {
            match lines.next_line().await? {
                Some(line) => {
                    if let Some(ext) = extension_of(&line) {
                        if remaining.remove(&ext) {
                            found.insert(ext);
                        }
                    }
                }
                None => break,
            }
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;

    Ok(found)
}

/// Fallback: probe each server's markers and a depth-limited glob for its
/// extensions, concurrently across servers.
async fn fallback_detect_extensions(dir: &Path, catalog: &ServerCatalog) -> HashSet<String> {
    let probes = catalog.all().iter().map(|server| {
        let dir = dir.to_path_buf();
        let markers = server.root_markers.clone();
        let extensions = server.extensions.clone();
        async move {
            if probe_markers(&dir, &markers) || probe_extensions_by_glob(&dir, &extensions) {
                extensions
            } else {
                Vec::new()
            }
        }
    });

    let results = futures::future::join_all(probes).await;
    results.into_iter().flatten().collect()
}

fn probe_markers(dir: &Path, markers: &[String]) -> bool {
    markers.iter().any(|m| {
        if m.contains('*') {
            dir.join(m)
                .to_str()
                .map(|p| glob::glob(p).map(|mut g| g.next().is_some()).unwrap_or(false))
                .unwrap_or(false)
        } else {
            dir.join(m).exists()
        }
    })
}

fn probe_extensions_by_glob(dir: &Path, extensions: &[String]) -> bool {
    for depth in 0..=MAX_GLOB_DEPTH {
        let prefix = "*/".repeat(depth);
        for ext in extensions {
            let pattern = dir.join(format!("{prefix}*{ext}"));
            if let Some(pattern_str) = pattern.to_str() {
                if glob::glob(pattern_str)
                    .map(|mut g| g.next().is_some())
                    .unwrap_or(false)
                {
                    return true;
                }
            }
        }
    }
    false
}

fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ServerCatalog;

    #[tokio::test]
    async fn fallback_detects_rust_project() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();

        let catalog = ServerCatalog::load(None).unwrap();
        let ids = detect_servers(dir.path(), &catalog).await.unwrap();
        assert!(ids.contains(&"rust-analyzer"));
    }

    #[tokio::test]
    async fn fallback_detects_nothing_for_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = ServerCatalog::load(None).unwrap();
        let ids = detect_servers(dir.path(), &catalog).await.unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn extension_of_extracts_dotted_extension() {
        assert_eq!(extension_of("main.rs"), Some(".rs".to_string()));
        assert_eq!(extension_of("README"), None);
    }
}
