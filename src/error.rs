//! Error taxonomy shared by every core component.
//!
//! Local recovery (rotate a key, skip a file, retry a batch) happens inside
//! the component that can act on it; everything that escapes carries enough
//! context for the caller to print a one-line reason.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed configuration. Fatal for the operation,
    /// recoverable by editing the config and retrying.
    #[error("config error: {0}")]
    Config(String),

    /// Unknown project, node, or file.
    #[error("not found: {0}")]
    NotFound(String),

    /// Rate limit, timeout, or 5xx from the provider. Triggers rotation
    /// and retries before it is surfaced.
    #[error("provider transient failure: {0}")]
    ProviderTransient(String),

    /// Malformed response or non-429 4xx. Surfaced immediately.
    #[error("provider terminal failure: {0}")]
    ProviderTerminal(String),

    /// Unreadable source encountered during sync; the file is skipped and
    /// the sync continues.
    #[error("parse error in {path}: {reason}")]
    Parse { path: String, reason: String },

    /// The validator rejected a proposed edit.
    #[error("syntax rejected: {0}")]
    SyntaxInvalid(String),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// A second surgery was requested against a path that already has a
    /// pending journal.
    #[error("surgery already pending on {}", .0.display())]
    Conflict(PathBuf),

    /// Cooperative cancellation observed at a batch or stage boundary.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// True for failures worth retrying after rotating credentials.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ProviderTransient(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(format!("serialization: {e}"))
    }
}
