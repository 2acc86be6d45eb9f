//! Errors returned synchronously to callers of the orchestrator.
//!
//! Anything that happens after a job exists (launch failures, nonzero exits,
//! timeouts) is reported through the job's terminal state instead.

use thiserror::Error;

use crate::core::render::RenderError;
use crate::core::types::{JobId, JobState};
use crate::io::workspace::WorkspaceError;
use crate::lock::WorkspaceBusy;

/// Rejections from [`crate::orchestrator::Orchestrator::submit`]. No job is
/// created for any of these.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid variables: {0}")]
    Render(#[from] RenderError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Busy(#[from] WorkspaceBusy),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CancelError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {id} is already {state}")]
    NotCancelable { id: JobId, state: JobState },
}
