//! Error types for the LSP session layer.

use std::io;
use thiserror::Error;

pub type LspResult<T> = Result<T, LspError>;

#[derive(Debug, Error)]
pub enum LspError {
    #[error("no server descriptor with id '{0}'")]
    ServerNotFound(String),

    #[error("no language server applies to this file")]
    NoServerForFile,

    #[error("connection is disposed")]
    ConnectionDisposed,

    #[error("failed to spawn language server process: {0}")]
    ProcessError(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("operation timed out")]
    Timeout,

    #[error("server initialization failed: {0}")]
    InitializationFailed(String),

    #[error("invalid URI: {0}")]
    InvalidUri(String),

    #[error("client key '{0}' is marked broken")]
    Broken(String),

    #[error("file '{0}' is outside project root '{1}'")]
    OutsideRoot(String, String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LspError {
    pub fn connection_disposed() -> Self {
        LspError::ConnectionDisposed
    }

    pub fn protocol_error(msg: impl Into<String>) -> Self {
        LspError::ProtocolError(msg.into())
    }

    pub fn request_failed(msg: impl Into<String>) -> Self {
        LspError::RequestFailed(msg.into())
    }

    pub fn outside_root(path: impl Into<String>, root: impl Into<String>) -> Self {
        LspError::OutsideRoot(path.into(), root.into())
    }

    /// Transport errors that the hover/signature-help pipeline should retry,
    /// per the "Connection is disposed" retry rule.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LspError::ConnectionDisposed)
    }
}
