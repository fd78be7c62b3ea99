//! Resolves the optional JSON config file path (§6) and loads the catalog
//! and daemon tunables from it in one pass.

use lspd_lsp::catalog::{CatalogConfigFile, ServerCatalog};
use lspd_lsp::config::{DaemonConfig, DaemonConfigFile};
use std::path::{Path, PathBuf};

/// `DAEMON_CONFIG_FILE` env var, else a default path under the user's
/// config directory. Paths starting with `~/` are expanded against `$HOME`.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(raw) = std::env::var("DAEMON_CONFIG_FILE") {
        return Some(lspd_util::path::expand_home(&raw));
    }
    lspd_util::log::default_config_dir().map(|dir| dir.join("config.json"))
}

/// The combined config-file sections this daemon understands (`servers`,
/// `languageExtensions`, plus the daemon-tunable section).
#[derive(Debug, Default, serde::Deserialize)]
struct FullConfigFile {
    #[serde(flatten)]
    pub catalog: CatalogConfigFile,
    #[serde(flatten)]
    pub daemon: DaemonConfigFile,
}

pub struct LoadedConfig {
    pub catalog: ServerCatalog,
    pub daemon: DaemonConfig,
    pub config_path: Option<PathBuf>,
}

/// Load the catalog and daemon config, honoring an explicit override path
/// (e.g. from a CLI flag) ahead of the environment-resolved default.
pub fn load(explicit_path: Option<&Path>) -> anyhow::Result<LoadedConfig> {
    let config_path = explicit_path
        .map(|p| p.to_path_buf())
        .or_else(resolve_config_path);

    let daemon_section = config_path
        .as_deref()
        .filter(|p| p.is_file())
        .and_then(|p| std::fs::read_to_string(p).ok())
        .and_then(|text| serde_json::from_str::<FullConfigFile>(&text).ok())
        .map(|f| f.daemon);

    Ok(LoadedConfig {
        catalog: ServerCatalog::load(config_path.as_deref())?,
        daemon: DaemonConfig::resolve(daemon_section.as_ref()),
        config_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_defaults_without_a_config_file() {
        let loaded = load(Some(Path::new("/nonexistent/path.json"))).unwrap();
        assert!(loaded.catalog.by_id("rust-analyzer").is_some());
    }
}
