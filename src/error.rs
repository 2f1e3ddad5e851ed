use std::time::Duration;
use thiserror::Error;

/// Result type used throughout stressfront
pub type Result<T> = std::result::Result<T, StressError>;

/// Errors raised by a completion barrier
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TracerError {
    /// `done()` was called more times than `add()` accounted for.
    /// This is a usage bug in the caller, never a data condition.
    #[error("tracer released more times than it was incremented")]
    Overreleased,

    #[error("tracer wait timed out after {0:?}")]
    Timeout(Duration),
}

/// Custom error type for the stressfront library
#[derive(Error, Debug)]
pub enum StressError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Write error: {0}")]
    Write(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid value '{value}' for '{property}': {reason}")]
    InvalidDirective {
        property: String,
        value: String,
        reason: String,
    },

    #[error("{0} channel closed")]
    ChannelClosed(&'static str),

    #[error("Tracer error: {0}")]
    Tracer(#[from] TracerError),

    #[error("Listener error: {0}")]
    Listener(String),

    #[error("{context} failed after {attempts} attempts: {message}")]
    Retry {
        context: String,
        attempts: usize,
        message: String,
    },

    #[error("Other error: {0}")]
    Other(String),
}

impl StressError {
    /// Build a retry exhaustion error from the last failure
    pub fn retry(context: &str, attempts: usize, err: impl std::fmt::Display) -> Self {
        StressError::Retry {
            context: context.to_string(),
            attempts,
            message: err.to_string(),
        }
    }

    pub(crate) fn invalid(property: &str, value: &str, reason: impl Into<String>) -> Self {
        StressError::InvalidDirective {
            property: property.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}
