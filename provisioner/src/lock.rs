//! Per-workspace mutual exclusion.
//!
//! A grant is a [`WorkspaceLease`]. Releasing it is exactly-once: the job calls
//! [`WorkspaceLease::release`] on its terminal transition, and `Drop` releases a
//! lease that was never released explicitly (supervisor panic or abort).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, warn};

use crate::core::types::JobId;

/// Rejection for a workspace that already has a holder. Not queued; callers
/// resubmit or poll.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("workspace {workspace} is busy with job {holder}")]
pub struct WorkspaceBusy {
    pub workspace: String,
    pub holder: JobId,
}

type Holders = Arc<Mutex<HashMap<String, JobId>>>;

#[derive(Debug, Default, Clone)]
pub struct LockManager {
    holders: Holders,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant the workspace to `job` unless someone holds it. Not reentrant:
    /// a job asking again for a workspace it already holds is also busy.
    pub fn try_acquire(
        &self,
        workspace: &str,
        job: JobId,
    ) -> Result<WorkspaceLease, WorkspaceBusy> {
        let mut holders = lock(&self.holders);
        if let Some(holder) = holders.get(workspace) {
            debug!(workspace, holder = %holder, requester = %job, "workspace busy");
            return Err(WorkspaceBusy {
                workspace: workspace.to_string(),
                holder: *holder,
            });
        }
        holders.insert(workspace.to_string(), job);
        debug!(workspace, job = %job, "workspace lock granted");
        Ok(WorkspaceLease {
            holders: Arc::clone(&self.holders),
            workspace: workspace.to_string(),
            job,
            released: false,
        })
    }

    pub fn holder(&self, workspace: &str) -> Option<JobId> {
        lock(&self.holders).get(workspace).copied()
    }

    #[cfg(test)]
    fn held(&self) -> usize {
        lock(&self.holders).len()
    }
}

fn lock(holders: &Holders) -> MutexGuard<'_, HashMap<String, JobId>> {
    holders.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Proof that a job holds a workspace.
#[derive(Debug)]
pub struct WorkspaceLease {
    holders: Holders,
    workspace: String,
    job: JobId,
    released: bool,
}

impl WorkspaceLease {
    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn job(&self) -> JobId {
        self.job
    }

    /// Release the workspace. Returns `false` if this lease no longer owned it.
    pub fn release(mut self) -> bool {
        self.release_inner()
    }

    fn release_inner(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        let mut holders = lock(&self.holders);
        if holders.get(&self.workspace) == Some(&self.job) {
            holders.remove(&self.workspace);
            debug!(workspace = %self.workspace, job = %self.job, "workspace lock released");
            true
        } else {
            false
        }
    }
}

impl Drop for WorkspaceLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                workspace = %self.workspace,
                job = %self.job,
                "releasing workspace lock from finalizer"
            );
            self.release_inner();
        }
    }
}
