//! Stream error types and handler error categorization
//!
//! Handler errors are categorized to decide what happens to the entry:
//! - **NotFound**: the payload references something that no longer exists, drop it
//! - **InvalidPayload**: the payload can never be processed, drop it
//! - **Transient**: anything else, leave it pending so the stealer retries it

use std::time::Duration;
use thiserror::Error;

/// Category of a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Referenced resource not found - acknowledge and drop
    NotFound,
    /// Malformed payload - acknowledge and drop
    InvalidPayload,
    /// Temporary failure - leave pending for redelivery
    Transient,
}

impl ErrorCategory {
    /// Whether an entry failing with this category is acknowledged anyway.
    pub fn is_droppable(&self) -> bool {
        matches!(self, ErrorCategory::NotFound | ErrorCategory::InvalidPayload)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::InvalidPayload => "invalid_payload",
            ErrorCategory::Transient => "transient",
        }
    }
}

/// Error returned by a [`MessageHandler`](crate::MessageHandler).
#[derive(Error, Debug)]
#[error("{message}")]
pub struct HandleError {
    message: String,
    category: ErrorCategory,
}

impl HandleError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category,
        }
    }

    /// The entry references a resource that does not exist.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NotFound, message)
    }

    /// The entry payload is malformed.
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::InvalidPayload, message)
    }

    /// A retryable failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transient, message)
    }

    /// The handler did not finish within its timeout.
    pub fn timeout(limit: Duration) -> Self {
        Self::transient(format!("handler timed out after {}ms", limit.as_millis()))
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for HandleError {
    fn from(err: serde_json::Error) -> Self {
        HandleError::invalid_payload(err.to_string())
    }
}

impl From<StreamError> for HandleError {
    fn from(err: StreamError) -> Self {
        HandleError::transient(err.to_string())
    }
}

/// Stream store and engine errors
#[derive(Error, Debug)]
pub enum StreamError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// XGROUP CREATE on a group that already exists
    #[error("Consumer group '{group}' already exists on stream '{stream}'")]
    GroupExists { stream: String, group: String },

    /// The stream or the consumer group does not exist
    #[error("Consumer group '{group}' does not exist on stream '{stream}'")]
    NoGroup { stream: String, group: String },

    /// Payload serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store replied with something we could not interpret
    #[error("Unexpected store reply: {0}")]
    Protocol(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Orchestrator operation called in the wrong lifecycle state
    #[error("Invalid state: cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
}

impl StreamError {
    pub fn config(message: impl Into<String>) -> Self {
        StreamError::Config(message.into())
    }

    /// Whether this is the "group already exists" reply.
    pub fn is_group_exists(&self) -> bool {
        match self {
            StreamError::GroupExists { .. } => true,
            StreamError::Redis(e) => e.code() == Some("BUSYGROUP"),
            _ => false,
        }
    }
}

pub type StreamResult<T> = Result<T, StreamError>;
