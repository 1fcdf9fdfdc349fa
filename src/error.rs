//! Error types for the media cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the media cache.
///
/// Request rejections (malformed paths, foreign shards, bad secrets) are
/// not errors and are modelled by [`crate::media::Rejection`] instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration, fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level failure talking to an upstream host
    #[error("Fetch from {host} failed: {source}")]
    Fetch {
        host: String,
        #[source]
        source: reqwest::Error,
    },

    /// Upstream did not answer within the connect or total timeout
    #[error("Fetch from {host} timed out")]
    FetchTimeout { host: String },

    /// Upstream answered with a non-success status
    #[error("Upstream {host} responded with status {status}")]
    UpstreamStatus { host: String, status: u16 },

    /// Access ledger backend error
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Ledger(e.to_string())
    }
}

impl Error {
    /// Whether the error came from the remote side of a fetch.
    ///
    /// Download failures of this kind are swallowed by the coordinator;
    /// everything else is an internal failure.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(
            self,
            Error::Fetch { .. } | Error::FetchTimeout { .. } | Error::UpstreamStatus { .. }
        )
    }
}
