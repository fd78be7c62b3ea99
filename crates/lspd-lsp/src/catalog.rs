//! Server Catalog: the static, extensible table of known language servers.
//!
//! Built-in entries are augmented (and possibly overridden) at daemon
//! startup by an optional JSON config file; see [`CatalogConfig::load`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

/// Which PATH/package-installer family a server belongs to, for availability checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Available if `command[0]` resolves on `PATH`.
    OnPath,
    /// Always available; a local package installer fetches the binary lazily on first spawn.
    ManagedInstall,
    /// Available only if `DOTNET_ROOT` is set (the C#/OmniSharp family).
    RequiresDotnetRoot,
}

/// An immutable description of one known language server.
#[derive(Debug, Clone)]
pub struct ServerDescriptor {
    pub id: String,
    pub extensions: Vec<String>,
    pub root_markers: Vec<String>,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub init_options: Option<Value>,
    /// Pure function from project root to an additional argv tail.
    pub dynamic_args: Option<fn(&Path) -> Vec<String>>,
    pub package_name: Option<String>,
    pub availability: Availability,
}

impl ServerDescriptor {
    pub fn handles_extension(&self, ext: &str) -> bool {
        self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
    }

    /// Full argv for spawning this server against `root`: `command + dynamicArgs(root)`.
    pub fn argv(&self, root: &Path) -> Vec<String> {
        let mut argv = self.command.clone();
        if let Some(f) = self.dynamic_args {
            argv.extend(f(root));
        }
        argv
    }

    fn is_available(&self) -> bool {
        match self.availability {
            Availability::ManagedInstall => true,
            Availability::RequiresDotnetRoot => std::env::var_os("DOTNET_ROOT").is_some(),
            Availability::OnPath => self
                .command
                .first()
                .map(|bin| resolve_on_path(bin).is_some())
                .unwrap_or(false),
        }
    }
}

fn resolve_on_path(bin: &str) -> Option<std::path::PathBuf> {
    if bin.contains('/') || bin.contains('\\') {
        let p = std::path::PathBuf::from(bin);
        return p.is_file().then_some(p);
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(bin))
        .find(|p| p.is_file())
}

/// JSON shape of an overridden/appended server entry in the config file.
#[derive(Debug, Deserialize, Serialize)]
struct ConfigServerEntry {
    id: String,
    extensions: Vec<String>,
    #[serde(default, rename = "rootPatterns")]
    root_patterns: Vec<String>,
    command: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    initialization: Option<Value>,
}

/// JSON shape of the full config file (`servers` + `languageExtensions`, plus
/// the daemon-tunable section layered in by [`crate::config::DaemonConfig`]).
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CatalogConfigFile {
    #[serde(default)]
    servers: Vec<ConfigServerEntry>,
    #[serde(default, rename = "languageExtensions")]
    pub language_extensions: HashMap<String, String>,
}

/// `byId` / `applicableTo` / `all` over the combined built-in + config-overlaid table.
pub struct ServerCatalog {
    servers: Vec<ServerDescriptor>,
    language_extensions: HashMap<String, String>,
}

impl ServerCatalog {
    /// Build the catalog from the built-in list, overlaying any config file entries.
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let mut servers = built_in_servers();
        let mut language_extensions = default_language_extensions();

        if let Some(path) = config_path {
            if path.is_file() {
                let text = std::fs::read_to_string(path)?;
                let file: CatalogConfigFile = serde_json::from_str(&text)?;
                for entry in file.servers {
                    let descriptor = ServerDescriptor {
                        id: entry.id.clone(),
                        extensions: entry.extensions,
                        root_markers: entry.root_patterns,
                        command: entry.command,
                        env: entry.env,
                        init_options: entry.initialization,
                        dynamic_args: None,
                        package_name: None,
                        availability: Availability::OnPath,
                    };
                    if let Some(existing) =
                        servers.iter_mut().find(|s: &&mut ServerDescriptor| s.id == entry.id)
                    {
                        *existing = descriptor;
                    } else {
                        servers.push(descriptor);
                    }
                }
                language_extensions.extend(file.language_extensions);
            }
        }

        Ok(Self {
            servers,
            language_extensions,
        })
    }

    pub fn by_id(&self, id: &str) -> Option<&ServerDescriptor> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Servers applicable to `file_path`'s extension, filtered to available ones,
    /// in built-in enumeration order.
    pub fn applicable_to(&self, file_path: &Path) -> Vec<&ServerDescriptor> {
        let ext = file_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        self.servers
            .iter()
            .filter(|s| s.handles_extension(&ext) && s.is_available())
            .collect()
    }

    pub fn all(&self) -> &[ServerDescriptor] {
        &self.servers
    }

    /// `languageId` for an extension, falling back to `"plaintext"`.
    pub fn language_id_for_extension(&self, ext: &str) -> String {
        self.language_extensions
            .get(ext)
            .cloned()
            .unwrap_or_else(|| "plaintext".to_string())
    }
}

fn default_language_extensions() -> HashMap<String, String> {
    [
        (".rs", "rust"),
        (".ts", "typescript"),
        (".tsx", "typescriptreact"),
        (".js", "javascript"),
        (".jsx", "javascriptreact"),
        (".py", "python"),
        (".go", "go"),
        (".c", "c"),
        (".h", "c"),
        (".cpp", "cpp"),
        (".cc", "cpp"),
        (".hpp", "cpp"),
        (".java", "java"),
        (".cs", "csharp"),
        (".rb", "ruby"),
        (".php", "php"),
        (".lua", "lua"),
        (".sh", "shellscript"),
        (".json", "json"),
        (".yaml", "yaml"),
        (".yml", "yaml"),
        (".md", "markdown"),
        (".graphql", "graphql"),
        (".gql", "graphql"),
        (".html", "html"),
        (".css", "css"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// The built-in server table. Order here is the enumeration order used for
/// deterministic result ordering elsewhere (project detection, diagnostics
/// aggregation).
pub fn built_in_servers() -> Vec<ServerDescriptor> {
    fn d(
        id: &str,
        extensions: &[&str],
        root_markers: &[&str],
        command: &[&str],
        availability: Availability,
    ) -> ServerDescriptor {
        ServerDescriptor {
            id: id.to_string(),
            extensions: extensions.iter().map(|s| s.to_string()).collect(),
            root_markers: root_markers.iter().map(|s| s.to_string()).collect(),
            command: command.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            init_options: None,
            dynamic_args: None,
            package_name: None,
            availability,
        }
    }

    vec![
        d(
            "rust-analyzer",
            &[".rs"],
            &["Cargo.toml"],
            &["rust-analyzer"],
            Availability::OnPath,
        ),
        d(
            "typescript-language-server",
            &[".ts", ".tsx", ".js", ".jsx"],
            &["package.json", "tsconfig.json"],
            &["typescript-language-server", "--stdio"],
            Availability::ManagedInstall,
        ),
        d(
            "pyright",
            &[".py"],
            &["pyproject.toml", "setup.py", "requirements.txt"],
            &["pyright-langserver", "--stdio"],
            Availability::ManagedInstall,
        ),
        d(
            "gopls",
            &[".go"],
            &["go.mod"],
            &["gopls"],
            Availability::OnPath,
        ),
        d(
            "clangd",
            &[".c", ".h", ".cpp", ".cc", ".cxx", ".hpp", ".hxx"],
            &["compile_commands.json", "CMakeLists.txt"],
            &["clangd"],
            Availability::OnPath,
        ),
        d(
            "jdtls",
            &[".java"],
            &["pom.xml", "build.gradle", "settings.gradle"],
            &["jdtls"],
            Availability::OnPath,
        ),
        d(
            "omnisharp",
            &[".cs"],
            &["*.csproj", "*.sln"],
            &["omnisharp", "-lsp"],
            Availability::RequiresDotnetRoot,
        ),
        d(
            "solargraph",
            &[".rb"],
            &["Gemfile", "*.gemspec"],
            &["solargraph", "stdio"],
            Availability::ManagedInstall,
        ),
        d(
            "intelephense",
            &[".php"],
            &["composer.json"],
            &["intelephense", "--stdio"],
            Availability::ManagedInstall,
        ),
        d(
            "graphql-lsp",
            &[".graphql", ".gql"],
            &[".graphqlrc", ".graphqlrc.yml", "graphql.config.js"],
            &["graphql-lsp", "server", "-m", "stream"],
            Availability::ManagedInstall,
        ),
        d(
            "bash-language-server",
            &[".sh", ".bash"],
            &[],
            &["bash-language-server", "start"],
            Availability::ManagedInstall,
        ),
        d(
            "yaml-language-server",
            &[".yaml", ".yml"],
            &[],
            &["yaml-language-server", "--stdio"],
            Availability::ManagedInstall,
        ),
        d(
            "vscode-json-language-server",
            &[".json", ".jsonc"],
            &[],
            &["vscode-json-language-server", "--stdio"],
            Availability::ManagedInstall,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_ins_are_stable_order() {
        let a = built_in_servers();
        let b = built_in_servers();
        let ids_a: Vec<_> = a.iter().map(|s| s.id.clone()).collect();
        let ids_b: Vec<_> = b.iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids_a, ids_b);
        assert_eq!(ids_a.first().unwrap(), "rust-analyzer");
    }

    #[test]
    fn handles_extension_is_case_insensitive() {
        let rs = &built_in_servers()[0];
        assert!(rs.handles_extension(".rs"));
        assert!(!rs.handles_extension(".py"));
    }

    #[test]
    fn applicable_to_filters_by_extension_and_availability() {
        let catalog = ServerCatalog::load(None).unwrap();
        let results = catalog.applicable_to(Path::new("README.txt"));
        assert!(results.is_empty());
    }

    #[test]
    fn config_file_overrides_builtin_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(
            &config_path,
            r#"{"servers":[{"id":"rust-analyzer","extensions":[".rs"],"command":["my-custom-ra"]}]}"#,
        )
        .unwrap();
        let catalog = ServerCatalog::load(Some(&config_path)).unwrap();
        let ra = catalog.by_id("rust-analyzer").unwrap();
        assert_eq!(ra.command, vec!["my-custom-ra".to_string()]);
    }

    #[test]
    fn config_file_appends_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(
            &config_path,
            r#"{"servers":[{"id":"custom-lang","extensions":[".cst"],"command":["custom-lsp"]}]}"#,
        )
        .unwrap();
        let catalog = ServerCatalog::load(Some(&config_path)).unwrap();
        assert!(catalog.by_id("custom-lang").is_some());
        assert!(catalog.by_id("rust-analyzer").is_some());
    }

    #[test]
    fn language_extensions_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(
            &config_path,
            r#"{"languageExtensions":{".foo":"foolang"}}"#,
        )
        .unwrap();
        let catalog = ServerCatalog::load(Some(&config_path)).unwrap();
        assert_eq!(catalog.language_id_for_extension(".foo"), "foolang");
        assert_eq!(catalog.language_id_for_extension(".rs"), "rust");
        assert_eq!(catalog.language_id_for_extension(".zzz"), "plaintext");
    }
}
