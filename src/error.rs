// ABOUTME: Configuration-layer error types for sshc.
// ABOUTME: Covers config loading, parsing, and host parameter resolution failures.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read ssh_config {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("invalid port {value:?} for host {host}")]
    InvalidPort { host: String, value: String },

    #[error("invalid ProxyJump {0:?}: port must be numeric")]
    InvalidProxyJump(String),

    #[error("failed to read identity file {path}: {source}")]
    ReadIdentity {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not determine home directory")]
    HomeDirUnavailable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
