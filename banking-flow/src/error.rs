use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while handling a conversation turn
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Concurrent update for chat {0}")]
    ConcurrentUpdate(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("No route for state {state} and input {command}")]
    NoRoute { state: String, command: String },

    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for FlowError {
    fn from(err: sqlx::Error) -> Self {
        FlowError::StorageError(err.to_string())
    }
}

impl FlowError {
    /// Whether a retry at the collaborator boundary may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FlowError::UpstreamUnavailable(_) | FlowError::RateLimited { .. }
        )
    }

    /// Pause the upstream asked for before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FlowError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
