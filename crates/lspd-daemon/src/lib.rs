//! Daemon-side plumbing around the [`lspd_lsp`] session layer: instancing
//! (socket/PID/config-metadata paths), the socket server, the client
//! driver, and config-file resolution.

pub mod client_driver;
pub mod config_loader;
pub mod instancing;
pub mod protocol;
pub mod server;
