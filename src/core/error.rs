//! Error types for connection and command dispatch

use std::io;
use thiserror::Error;

/// Result type used across the crate
pub type RedisResult<T> = Result<T, RedisError>;

/// Comprehensive error type for client operations
#[derive(Error, Debug)]
pub enum RedisError {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid connection configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Command failed structural validation
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Command issued against a disconnected connection
    #[error("Connection is not established")]
    NotConnected,

    /// Multi-node operation requires cluster mode
    #[error("Connection is not in cluster mode")]
    NotCluster,

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Transport-level failure surfaced by the worker
    #[error("Transport error: {0}")]
    Transport(String),

    /// Server returned an error reply
    #[error("Server error: {0}")]
    Server(String),

    /// Protocol parsing error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Command promise was cancelled before completion
    #[error("Command cancelled")]
    Cancelled,

    /// Cluster operation failure
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// SSH tunnelling requested but no tunnel transport installed
    #[error("Client built without SSH tunnel support")]
    SshUnsupported,
}

impl RedisError {
    /// True when the error represents a cancelled command promise.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
