//! Error types for the process group.

use thiserror::Error;

use crate::protocol::Pid;

/// Errors raised by the protocol, the transports and the process collaborators.
#[derive(Debug, Error)]
pub enum EcdysisError {
    /// Empty message, or a payload too short for its operation
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Operation byte outside the closed set
    #[error("Unknown operation: {0}")]
    UnknownOperation(u8),

    /// The target process is gone
    #[error("Peer {pid} unreachable: {reason}")]
    PeerUnreachable {
        /// Pid the message was addressed to
        pid: Pid,
        /// Transport-level cause
        reason: String,
    },

    /// The local transport endpoint was closed
    #[error("Transport closed")]
    TransportClosed,

    /// Listener snapshot could not be encoded or decoded
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),

    /// Listener adoption or binding failed
    #[error("Listener error: {0}")]
    Listener(String),

    /// Spawning a child process failed
    #[error("Spawn failed: {0}")]
    Spawn(String),

    /// Invalid process environment or configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EcdysisError {
    /// Create a new malformed message error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedMessage(msg.into())
    }

    /// Create a new peer unreachable error.
    pub fn unreachable(pid: Pid, reason: impl Into<String>) -> Self {
        Self::PeerUnreachable {
            pid,
            reason: reason.into(),
        }
    }

    /// Create a new listener error.
    pub fn listener(msg: impl Into<String>) -> Self {
        Self::Listener(msg.into())
    }

    /// Create a new spawn error.
    pub fn spawn(msg: impl Into<String>) -> Self {
        Self::Spawn(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Returns true if the error means the addressed process has exited.
    pub fn is_peer_gone(&self) -> bool {
        matches!(self, Self::PeerUnreachable { .. })
    }
}

/// Result type alias for process group operations.
pub type Result<T> = std::result::Result<T, EcdysisError>;
