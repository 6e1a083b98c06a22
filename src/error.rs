//! Error types for agentloom
//!
//! This module defines all error types used throughout the agentloom substrate.
//! Uses `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.

use std::fmt;
use thiserror::Error;

// ============================================================================
// AI Call Error Classification
// ============================================================================

/// Structured AI-call error classification.
///
/// Provides fine-grained categorization of model call failures, enabling
/// retry decisions in the transaction wrapper without string matching.
#[derive(Debug, Clone)]
pub enum AiError {
    /// Transport-level failure (connection reset, timeout, 5xx from the backend)
    Transport(String),
    /// The model returned an empty reply
    Empty,
    /// The reply arrived but could not be used (unparseable score, bad payload)
    Malformed(String),
}

impl fmt::Display for AiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AiError::Transport(msg) => write!(f, "transport failure: {}", msg),
            AiError::Empty => write!(f, "empty reply"),
            AiError::Malformed(msg) => write!(f, "malformed reply: {}", msg),
        }
    }
}

impl AiError {
    /// Returns `true` if this error is transient and the call should be retried.
    ///
    /// Retryable errors: Transport, Empty. A malformed reply is deterministic
    /// for the same prompt and is not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AiError::Transport(_) | AiError::Empty)
    }
}

impl From<AiError> for LoomError {
    fn from(err: AiError) -> Self {
        LoomError::Ai(err)
    }
}

// ============================================================================
// Primary Error Type
// ============================================================================

/// The primary error type for agentloom operations.
#[derive(Error, Debug)]
pub enum LoomError {
    /// Configuration-related errors (invalid config, missing required fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The decode stream was exhausted before the target action appeared.
    ///
    /// Carries a truncated echo of the consumed input for diagnostics.
    #[error("no matching action found in stream (consumed: {echo:?})")]
    ActionNotFound {
        /// Truncated copy of everything read from the stream
        echo: String,
    },

    /// A single AI call failed with a classified cause.
    #[error("AI call error: {0}")]
    Ai(AiError),

    /// An AI transaction exhausted its retry budget.
    #[error("AI call failed after {attempts} attempts: {last}")]
    AiExhausted {
        /// Attempts made, including the first
        attempts: u32,
        /// Display of the last classified failure
        last: String,
    },

    /// Decode worker failures other than not-found (worker died, bad handoff)
    #[error("Decode error: {0}")]
    Decode(String),

    /// Checkpoint storage errors (lookup failures, unrecoverable writes, etc.)
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Endpoint errors (unknown id, double registration, etc.)
    #[error("Endpoint error: {0}")]
    Endpoint(String),

    /// Timeline errors (restore mismatch, id reassignment conflicts, etc.)
    #[error("Timeline error: {0}")]
    Timeline(String),

    /// A queue or handoff channel closed while a send was in flight
    #[error("channel closed")]
    ChannelClosed,

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized `Result` type for agentloom operations.
pub type Result<T> = std::result::Result<T, LoomError>;
