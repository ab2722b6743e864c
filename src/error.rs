//! Error types for the batching middleware.

use thiserror::Error;

/// Result type alias using the batchling error type.
pub type Result<T> = std::result::Result<T, BatchlingError>;

/// Main error type for the batching middleware.
#[derive(Error, Debug)]
pub enum BatchlingError {
    /// Request body is missing fields the batcher needs (e.g. `model`).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or rejected credential. Fatal for the whole batch.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Provider-side failure during submission, polling or result download.
    #[error("Provider error{}: {message}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Provider {
        /// HTTP status returned by the provider, when one exists
        status: Option<u16>,
        message: String,
    },

    /// Batch reached a terminal state but this request was absent from the results.
    #[error("Batch {batch_id} reached terminal state '{state}' without a result for this request")]
    ProviderIncomplete { batch_id: String, state: String },

    /// Caller dropped interest in a pending request.
    #[error("Request cancelled")]
    Cancelled,

    /// Intake after the engine was closed.
    #[error("Batching engine is closed")]
    EngineClosed,

    /// Deferred mode stopped active polling for this run.
    ///
    /// Not a failure: the caller is expected to exit with success and let a
    /// later run resume the outstanding batches from cache.
    #[error("Deferred mode idle threshold reached; outstanding batches resume from cache")]
    DeferredExit,

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cache storage error
    #[error("Cache error: {0}")]
    Cache(#[from] sqlx::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BatchlingError {
    /// Produce an equivalent error for fanning one failure out to many
    /// completion handles.
    ///
    /// Infrastructure variants that don't implement `Clone` collapse into a
    /// `Provider` error carrying the original message.
    pub(crate) fn replicate(&self) -> BatchlingError {
        match self {
            BatchlingError::InvalidRequest(msg) => BatchlingError::InvalidRequest(msg.clone()),
            BatchlingError::Auth(msg) => BatchlingError::Auth(msg.clone()),
            BatchlingError::Provider { status, message } => BatchlingError::Provider {
                status: *status,
                message: message.clone(),
            },
            BatchlingError::ProviderIncomplete { batch_id, state } => {
                BatchlingError::ProviderIncomplete {
                    batch_id: batch_id.clone(),
                    state: state.clone(),
                }
            }
            BatchlingError::Cancelled => BatchlingError::Cancelled,
            BatchlingError::EngineClosed => BatchlingError::EngineClosed,
            BatchlingError::DeferredExit => BatchlingError::DeferredExit,
            other => BatchlingError::Provider {
                status: None,
                message: other.to_string(),
            },
        }
    }
}
