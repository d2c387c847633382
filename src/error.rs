use std::time::Duration;
use thiserror::Error;

use crate::protocol::{INTERNAL_ERROR, METHOD_NOT_FOUND};

/// Broker failure taxonomy. Fatal kinds (`Spawn`, `Handshake`) abort startup;
/// `ChannelClosed` and `Io` terminate the session; the rest are per-request.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to spawn LSP server: {0}")]
    Spawn(String),

    #[error("initialize handshake failed: {0}")]
    Handshake(String),

    #[error("LSP channel closed")]
    ChannelClosed,

    #[error("transport failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("LSP error {code}: {message}")]
    Lsp { code: i64, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("file watcher error: {0}")]
    Watcher(String),
}

impl BrokerError {
    /// Map this error to the (code, message) pair reported on the client API.
    /// LSP server errors pass through their original code verbatim.
    pub fn api_error(&self) -> (i64, String) {
        match self {
            BrokerError::Lsp { code, message } => (*code, message.clone()),
            BrokerError::UnknownMethod(_) => (METHOD_NOT_FOUND, self.to_string()),
            _ => (INTERNAL_ERROR, self.to_string()),
        }
    }
}
