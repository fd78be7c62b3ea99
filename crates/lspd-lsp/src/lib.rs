//! The LSP session layer: server catalog, project root resolution, project
//! type detection, the per-`(server, root)` LSP client, and the manager
//! that single-flights initialization and runs the diagnostics/hover
//! pipelines on top of it.

pub mod catalog;
pub mod client;
pub mod config;
pub mod detect;
pub mod error;
pub mod manager;
pub mod process_registry;
pub mod root;
pub mod transport;

pub use catalog::{ServerCatalog, ServerDescriptor};
pub use client::LspClient;
pub use config::DaemonConfig;
pub use error::{LspError, LspResult};
pub use manager::{HoverResult, LspManager, ManagerConfig, RunningServer};
pub use process_registry::ProcessRegistry;
