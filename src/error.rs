use std::path::PathBuf;

use thiserror::Error;

/// Fatal errors raised while starting the server.
#[derive(Error, Debug)]
pub enum ServeError {
    #[error("Port {0} is already in use")]
    PortInUse(u16),

    #[error("No free port found between {0} and 65535")]
    PortRangeExhausted(u16),

    #[error("Root directory is not usable: {path}: {reason}")]
    InvalidRoot { path: PathBuf, reason: String },

    #[error("Failed to load config file {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Returned by the pipeline when a request was deliberately aborted.
///
/// The connection driver treats this as a service failure and drops the
/// connection without writing a response.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("request aborted by fault injection")]
pub struct Aborted;

/// Why a request path could not be mapped under the served root.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Path is outside root directory")]
    PathTraversal,

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
