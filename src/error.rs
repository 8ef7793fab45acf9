//! Error types for talking to the simulator

use std::io;

/// Everything that can go wrong between starting a simulator session and
/// closing it.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The simulator process could not be started
    #[error("failed to launch simulator: {0}")]
    Launch(String),

    /// The process started but we never got a usable connection
    #[error("handshake with simulator failed: {0}")]
    Handshake(String),

    /// Query or close issued on a session that is already closed
    #[error("connection already closed")]
    Closed,

    /// The simulator answered a command with a non-OK status
    #[error("simulator rejected command 0x{command:02x}: {message}")]
    Command { command: u8, message: String },

    /// The response bytes did not decode
    #[error("malformed response: {0}")]
    Protocol(String),

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        ConnectionError::Protocol(message.into())
    }
}
