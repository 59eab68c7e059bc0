use thiserror::Error;

use crate::types::UserId;

/// Errors returned by a [`QuotaStore`](super::QuotaStore) implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The request never produced a response (connection, TLS, timeout)
    #[error("Store request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The store answered with a non-success status
    #[error("Store rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The response body was not the expected projection
    #[error("Failed to decode store response: {0}")]
    Decode(#[from] serde_json::Error),

    /// A targeted write matched no row
    #[error("Profile {id} not found")]
    NotFound { id: UserId },

    /// The store is unavailable for a reason other than transport
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },
}

impl StoreError {
    /// HTTP status of a rejected request, if there was one
    pub fn status(&self) -> Option<u16> {
        match self {
            StoreError::Rejected { status, .. } => Some(*status),
            StoreError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
