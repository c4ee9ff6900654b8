use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failure reading or writing one of the on-disk stores.
///
/// None of these are fatal: every store treats them as a miss on read and
/// drops them on write. They exist so the reason can be logged.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("cache document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cache version mismatch (found {found:?}, expected {expected})")]
    VersionMismatch {
        found: Option<String>,
        expected: &'static str,
    },
    #[error("failed to move cache file into place: {0}")]
    Persist(#[from] tempfile::PersistError),
    #[error("cache path {0} has no parent directory")]
    NoParent(String),
}

/// Failure of an underlying data source (git, keychain, usage endpoint).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` exited with status {status}")]
    Exit { program: String, status: i32 },
    #[error("`{program}` did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("request timed out")]
    RequestTimeout,
    #[error("unexpected HTTP status {0}")]
    Http(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed response: {0}")]
    Parse(String),
}

impl SourceError {
    /// Short stable code stored alongside cached failures.
    pub fn code(&self) -> String {
        match self {
            Self::Spawn { .. } => "spawn".to_string(),
            Self::Exit { .. } => "exit".to_string(),
            Self::Timeout { .. } | Self::RequestTimeout => "timeout".to_string(),
            Self::Http(status) => format!("http-{status}"),
            Self::Network(_) => "network".to_string(),
            Self::Parse(_) => "parse".to_string(),
        }
    }
}
