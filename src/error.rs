//! # Error Handling
//!
//! Error taxonomy for the orchestrator. Every variant maps to one of the
//! ways a request or a job can go wrong, and none of them is allowed to take
//! the worker process down:
//!
//! - **Protocol**: an inbound line that is not a well-formed message. Logged and dropped.
//! - **Validation**: a well-formed enqueue carrying a value we refuse (unknown model).
//!   Rejected before a job record exists.
//! - **Stage**: a subprocess failed to spawn, exited non-zero, timed out, or left an
//!   unreadable result. Recorded on the job as `failed`.
//! - **Config** / **Io**: startup and plumbing failures.
//!
//! Cancellation is not an error and has no variant here.

use thiserror::Error;

/// Errors produced by the orchestrator.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(OrchestratorError::Validation(format!("unknown model '{}'", model)));
/// ```
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Inbound line could not be decoded into a control message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Request was decoded but carries an unacceptable value
    #[error("Validation error: {0}")]
    Validation(String),

    /// A pipeline stage failed (spawn, exit code, timeout, result parsing)
    #[error("{0}")]
    Stage(String),

    /// Configuration file or environment variable problems
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem or pipe failure outside of a stage
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Broken internal invariant (a transition the queue should never request)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Convenience constructor for stage failures.
    pub fn stage(message: impl Into<String>) -> Self {
        OrchestratorError::Stage(message.into())
    }
}

/// JSON decoding errors on the control channel are always the host's fault.
impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Protocol(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for OrchestratorError {
    fn from(err: config::ConfigError) -> Self {
        OrchestratorError::Config(err.to_string())
    }
}

/// Shorthand for `Result<T, OrchestratorError>`.
pub type AppResult<T> = Result<T, OrchestratorError>;
