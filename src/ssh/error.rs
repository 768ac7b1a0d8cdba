// ABOUTME: SSH-specific error types.
// ABOUTME: Each variant names the connection stage that failed.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] crate::error::Error),

    #[error("failed to decode key {key}: {reason}")]
    KeyParse { key: String, reason: String },

    #[error("SSH agent not available: {0}")]
    AgentUnavailable(String),

    #[error("failed to load known_hosts {path}: {source}")]
    KnownHosts {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("host key for {host}:{port} rejected")]
    HostKeyRejected { host: String, port: u16 },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to spawn proxy command {command:?}: {source}")]
    ProxySpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy command timed out after {0:?}")]
    ProxyTimeout(Duration),

    #[error("authentication failed: no valid credentials")]
    AuthenticationFailed,

    #[error("command execution failed: {0}")]
    CommandFailed(String),

    #[error("command timed out after {0:?}")]
    CommandTimeout(Duration),

    #[error("channel closed unexpectedly without exit status")]
    ChannelClosed,

    #[error("SSH protocol error: {0}")]
    Protocol(#[from] russh::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
