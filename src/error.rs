//! Error kinds of the cage deformation core

use thiserror::Error;

use crate::drawable::StoreError;
use crate::session::SessionState;

/// Errors surfaced by cage editing, background jobs and commits.
///
/// A singular weight computation never shows up here: the solver falls back
/// to neutral weights for the affected sample instead.
#[derive(Debug, Error)]
pub enum CageError {
    /// Operation attempted in a state that does not allow it
    #[error("cannot {operation} while the session is {state}")]
    InvalidCageState {
        operation: &'static str,
        state: SessionState,
    },

    /// Fewer than 3 vertices when closing the cage
    #[error("a cage needs at least 3 vertices, it has {0}")]
    DegenerateCage(usize),

    /// Background job aborted before completion
    #[error("background job was cancelled")]
    Cancelled,

    /// Writing the rendered pixels back failed; nothing was merged
    #[error("failed to commit cage transform: {0}")]
    CommitFailure(#[source] StoreError),

    /// Background job panicked or was torn down by the runtime
    #[error("background job failed: {0}")]
    JobFailed(String),
}

impl CageError {
    pub fn invalid_state(operation: &'static str, state: SessionState) -> Self {
        CageError::InvalidCageState { operation, state }
    }

    /// Cancellation is expected during re-edits and halts, not a user error
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CageError::Cancelled)
    }
}
