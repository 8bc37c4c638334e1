//! Error types for the request shim.

use thiserror::Error;

/// Errors raised by the request facade and its collaborators.
#[derive(Debug, Error)]
pub enum XhrError {
    /// An operation was called in a lifecycle state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A URL or method pattern failed to compile.
    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Static template expansion failed.
    #[error("template expansion failed: {0}")]
    Template(#[from] handlebars::RenderError),

    /// A function template returned an error.
    #[error("response synthesis failed: {0:#}")]
    Synthesis(anyhow::Error),

    /// The synthesized body could not be serialized.
    #[error("failed to serialize response body: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Asynchronous mocked send needs a tokio runtime to schedule the delay.
    #[error("asynchronous send requires a running tokio runtime")]
    NoRuntime,

    /// The deferred completion task was cancelled or panicked.
    #[error("deferred completion did not finish: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Whatever the native transport raised, passed through as-is.
    #[error(transparent)]
    Native(anyhow::Error),
}

impl XhrError {
    pub(crate) fn invalid_pattern(pattern: &str, reason: impl ToString) -> Self {
        XhrError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        }
    }
}
