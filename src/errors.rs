//! Error taxonomy for the control plane
//!
//! Orchestrator-terminal errors are never thrown past the orchestrator
//! boundary; they are folded into a `LaunchResult` with a message and, where
//! one exists, the path to the captured launch log.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can terminate a launch attempt.
#[derive(Debug, Error)]
pub enum SwitchError {
    /// No stored recipe with the requested id
    #[error("recipe not found: {0}")]
    RecipeNotFound(String),

    /// The backend binary was missing or the child exited immediately
    #[error("failed to spawn backend for '{recipe}': {reason}")]
    SpawnFailure { recipe: String, reason: String },

    /// A known fatal pattern was matched in the backend's log output
    #[error("backend hit a fatal error for '{recipe}': {excerpt}")]
    FatalBackendError {
        recipe: String,
        excerpt: String,
        log_file: PathBuf,
    },

    /// The health probe never succeeded within the readiness ceiling
    #[error("backend for '{recipe}' did not become ready within {ceiling_secs}s")]
    ReadinessTimeout {
        recipe: String,
        ceiling_secs: u64,
        log_file: PathBuf,
    },

    /// Superseded by a newer switch request or explicitly cancelled
    #[error("launch of '{0}' was cancelled")]
    Cancelled(String),
}

impl SwitchError {
    /// Path to the captured launch log, when the failure produced one.
    pub fn log_file(&self) -> Option<&PathBuf> {
        match self {
            SwitchError::FatalBackendError { log_file, .. }
            | SwitchError::ReadinessTimeout { log_file, .. } => Some(log_file),
            _ => None,
        }
    }
}

/// Errors from the bounded queue primitive.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The wait was cancelled by the caller's cancellation token
    #[error("queue take was cancelled")]
    Cancelled,

    /// The queue was closed with nothing left to drain
    #[error("queue is closed")]
    Closed,
}
