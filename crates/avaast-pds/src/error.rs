//! Error types for PDS resolution and record access.

use thiserror::Error;

pub type PdsResult<T> = Result<T, PdsError>;

/// Errors surfaced by the PDS resolver and client.
#[derive(Debug, Error)]
pub enum PdsError {
    /// The identifier could not be mapped to a PDS endpoint.
    #[error("resolution failed for {0}")]
    Resolution(String),

    /// The upstream returned a non-success status.
    #[error("upstream returned status {status}")]
    Upstream { status: u16 },

    /// The record or blob does not exist.
    #[error("not found")]
    NotFound,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("decode error: {0}")]
    Decode(String),
}

impl PdsError {
    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PdsError::Http(_) => true,
            PdsError::Upstream { status } => *status >= 500,
            _ => false,
        }
    }
}
