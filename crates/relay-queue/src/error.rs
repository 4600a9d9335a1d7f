//! Error types for the queue engine.

use relay_core::{ChainId, JobId};

/// The result type used throughout relay-queue.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in queue operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A job type has no registered step executor.
    #[error("unknown job type: {job_type}")]
    UnknownJobType {
        /// The unregistered type tag.
        job_type: String,
    },

    /// A payload failed the job type's schema validation at enqueue time.
    #[error("invalid payload for job type {job_type}: {message}")]
    InvalidPayload {
        /// The job type whose validation rejected the payload.
        job_type: String,
        /// Description of the validation failure.
        message: String,
    },

    /// A job was not found in the queue.
    #[error("job not found: {job_id} in queue {queue}")]
    JobNotFound {
        /// The job ID that was looked up.
        job_id: JobId,
        /// The queue that was searched.
        queue: String,
    },

    /// A chain control record was not found.
    #[error("chain not found: {chain_id}")]
    ChainNotFound {
        /// The chain ID that was looked up.
        chain_id: ChainId,
    },

    /// An invalid status transition was attempted.
    #[error("invalid status transition: {from} -> {to} ({reason})")]
    InvalidStatusTransition {
        /// The current status.
        from: String,
        /// The attempted target status.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A manual requeue was attempted on a job that is not dead-lettered.
    #[error("job {job_id} is not dead-lettered (status {status}); refusing requeue")]
    NotDeadLettered {
        /// The job the operator tried to requeue.
        job_id: JobId,
        /// The status the job actually held.
        status: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Invalid service configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An error from relay-core.
    #[error("core error: {0}")]
    Core(#[from] relay_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}
