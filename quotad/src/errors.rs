use thiserror::Error as ThisError;

use crate::store::StoreError;

/// Result type for fallible worker operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Missing or invalid startup configuration (store endpoint, credential, schedule)
    #[error("Invalid configuration: {message}")]
    StartupConfig { message: String },

    /// Configuration sources could not be read or extracted
    #[error(transparent)]
    Config(#[from] Box<figment::Error>),

    /// Candidate fetch failed; the run is aborted before any write is issued
    #[error("Failed to fetch candidates: {0}")]
    Fetch(#[source] StoreError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl Error {
    pub fn startup_config(message: impl Into<String>) -> Self {
        Error::StartupConfig { message: message.into() }
    }

    /// Whether this error should stop the process rather than just the current run
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StartupConfig { .. } | Error::Config(_))
    }
}
