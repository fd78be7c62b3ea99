//! Daemon-tunable configuration, layered CLI/env > config file > built-in
//! defaults, mirroring the catalog's own config-file overlay (§4.3) but for
//! the values the distilled spec left as literal constants.

use crate::client::{PUSH_DIAGNOSTICS_TIMEOUT, SHUTDOWN_TIMEOUT};
use serde::Deserialize;
use std::time::Duration;

/// The daemon-level section of the config file, alongside `servers` and
/// `languageExtensions` (see [`crate::catalog::CatalogConfigFile`]).
#[derive(Debug, Default, Deserialize)]
pub struct DaemonConfigFile {
    #[serde(rename = "logLevel")]
    pub log_level: Option<String>,
    #[serde(rename = "pushDiagnosticsTimeoutMs")]
    pub push_diagnostics_timeout_ms: Option<u64>,
    #[serde(rename = "shutdownTimeoutMs")]
    pub shutdown_timeout_ms: Option<u64>,
}

/// Resolved daemon tunables.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub log_level: lspd_util::LogLevel,
    pub push_diagnostics_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: lspd_util::LogLevel::Info,
            push_diagnostics_timeout: PUSH_DIAGNOSTICS_TIMEOUT,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }
}

impl DaemonConfig {
    /// Resolve: explicit env override, then the config file's `daemon`
    /// section (if present), then built-in defaults.
    pub fn resolve(file: Option<&DaemonConfigFile>) -> Self {
        let mut config = Self::default();

        if let Some(file) = file {
            if let Some(level) = file.log_level.as_deref().and_then(lspd_util::LogLevel::parse) {
                config.log_level = level;
            }
            if let Some(ms) = file.push_diagnostics_timeout_ms {
                config.push_diagnostics_timeout = Duration::from_millis(ms);
            }
            if let Some(ms) = file.shutdown_timeout_ms {
                config.shutdown_timeout = Duration::from_millis(ms);
            }
        }

        if let Ok(level) = std::env::var("LSPD_LOG_LEVEL") {
            if let Some(level) = lspd_util::LogLevel::parse(&level) {
                config.log_level = level;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let config = DaemonConfig::resolve(None);
        assert_eq!(config.push_diagnostics_timeout, Duration::from_millis(3000));
        assert_eq!(config.shutdown_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn file_overrides_defaults() {
        let file = DaemonConfigFile {
            log_level: Some("debug".to_string()),
            push_diagnostics_timeout_ms: Some(1500),
            shutdown_timeout_ms: None,
        };
        let config = DaemonConfig::resolve(Some(&file));
        assert_eq!(config.log_level, lspd_util::LogLevel::Debug);
        assert_eq!(config.push_diagnostics_timeout, Duration::from_millis(1500));
        assert_eq!(config.shutdown_timeout, Duration::from_millis(5000));
    }
}
