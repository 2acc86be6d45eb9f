//! Job records and the in-memory job table.
//!
//! A [`JobHandle`] is owned by the table and mutated only through its
//! transition methods, which enforce the rules in
//! [`crate::core::state_machine`]. Everyone else reads [`JobSnapshot`]s or
//! subscribes to the job's event log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broadcast::{EventLog, EventStream};
use crate::core::state_machine::{Resolution, can_cancel, can_transition};
use crate::core::types::{
    EventKind, JobEvent, JobFailure, JobId, JobSnapshot, JobState, OperationKind, OutputStream,
};
use crate::error::CancelError;
use crate::lock::WorkspaceLease;

#[derive(Debug)]
struct JobRecord {
    state: JobState,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    signal: Option<i32>,
    failure: Option<JobFailure>,
    cancel_requested: bool,
    output_bytes: usize,
    truncated_bytes: u64,
    lease: Option<WorkspaceLease>,
}

#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    workspace: String,
    operation: OperationKind,
    created_at: DateTime<Utc>,
    output_limit: usize,
    record: Mutex<JobRecord>,
    log: Arc<EventLog>,
    cancel: watch::Sender<bool>,
}

impl JobHandle {
    /// Create a job in `queued`, holding `lease` until it reaches a terminal state.
    pub fn new(operation: OperationKind, lease: WorkspaceLease, output_limit: usize) -> Self {
        let (cancel, _) = watch::channel(false);
        let log = Arc::new(EventLog::new());
        log.append(EventKind::State {
            state: JobState::Queued,
        });
        Self {
            id: lease.job(),
            workspace: lease.workspace().to_string(),
            operation,
            created_at: Utc::now(),
            output_limit,
            record: Mutex::new(JobRecord {
                state: JobState::Queued,
                started_at: None,
                finished_at: None,
                exit_code: None,
                signal: None,
                failure: None,
                cancel_requested: false,
                output_bytes: 0,
                truncated_bytes: 0,
                lease: Some(lease),
            }),
            log,
            cancel,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    pub fn state(&self) -> JobState {
        self.record().state
    }

    pub fn cancel_requested(&self) -> bool {
        self.record().cancel_requested
    }

    /// Receiver that flips to `true` on cancellation.
    pub fn cancel_receiver(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let record = self.record();
        JobSnapshot {
            id: self.id,
            workspace: self.workspace.clone(),
            operation: self.operation,
            mutating: self.operation.is_mutating(),
            state: record.state,
            created_at: self.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
            exit_code: record.exit_code,
            signal: record.signal,
            failure: record.failure.clone(),
            cancel_requested: record.cancel_requested,
            output_truncated_bytes: record.truncated_bytes,
        }
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.log.snapshot()
    }

    pub fn subscribe(&self) -> EventStream {
        self.log.subscribe()
    }

    /// `queued → running`. Called once the first process has spawned; a no-op
    /// when already running.
    pub fn mark_running(&self) -> bool {
        {
            let mut record = self.record();
            if !can_transition(record.state, JobState::Running) {
                return false;
            }
            record.state = JobState::Running;
            record.started_at = Some(Utc::now());
        }
        debug!(job_id = %self.id, "job running");
        self.log.append(EventKind::State {
            state: JobState::Running,
        });
        true
    }

    /// Append one output line, honoring the per-job output limit.
    pub fn push_output(&self, stream: OutputStream, line: String) {
        {
            let mut record = self.record();
            if record.state.is_terminal() {
                return;
            }
            let size = line.len() + 1;
            if record.output_bytes + size > self.output_limit {
                record.truncated_bytes += size as u64;
                return;
            }
            record.output_bytes += size;
        }
        self.log.append(EventKind::Output { stream, line });
    }

    /// Orchestrator-authored line; not counted against the output limit.
    pub fn notice(&self, line: impl Into<String>) {
        self.log.append(EventKind::Output {
            stream: OutputStream::Notice,
            line: line.into(),
        });
    }

    /// Request cancellation. Rejected once the job is terminal.
    pub fn request_cancel(&self) -> Result<(), CancelError> {
        let mut record = self.record();
        if !can_cancel(record.state) {
            return Err(CancelError::NotCancelable {
                id: self.id,
                state: record.state,
            });
        }
        record.cancel_requested = true;
        self.cancel.send_replace(true);
        info!(job_id = %self.id, state = %record.state, "cancellation requested");
        Ok(())
    }

    /// Move to a terminal state exactly once.
    ///
    /// The workspace lease is released before the terminal event is published,
    /// so an observer that sees the terminal event can immediately resubmit.
    /// Returns `false` if the job was already terminal.
    pub fn finish(&self, resolution: Resolution) -> bool {
        let (lease, truncated) = {
            let mut record = self.record();
            if !can_transition(record.state, resolution.state) {
                return false;
            }
            record.state = resolution.state;
            record.finished_at = Some(Utc::now());
            record.exit_code = resolution.exit_code;
            record.signal = resolution.signal;
            record.failure = resolution.failure.clone();
            (record.lease.take(), record.truncated_bytes)
        };
        if let Some(lease) = lease {
            if !lease.release() {
                warn!(job_id = %self.id, workspace = %self.workspace, "lease was no longer held");
            }
        }
        if truncated > 0 {
            self.notice(format!("[output truncated: {truncated} bytes dropped]"));
        }
        info!(
            job_id = %self.id,
            workspace = %self.workspace,
            operation = %self.operation,
            state = %resolution.state,
            exit_code = ?resolution.exit_code,
            "job finished"
        );
        self.log.append_final(EventKind::State {
            state: resolution.state,
        });
        true
    }

    fn record(&self) -> MutexGuard<'_, JobRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Default)]
struct JobIndex {
    by_id: HashMap<JobId, Arc<JobHandle>>,
    /// Submission order.
    order: Vec<JobId>,
}

/// All jobs submitted since startup.
#[derive(Debug, Default)]
pub struct JobTable {
    index: Mutex<JobIndex>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Arc<JobHandle>) {
        let mut index = self.index();
        index.order.push(job.id());
        index.by_id.insert(job.id(), job);
    }

    pub fn get(&self, id: JobId) -> Option<Arc<JobHandle>> {
        self.index().by_id.get(&id).cloned()
    }

    /// Jobs newest first, optionally restricted to one workspace.
    pub fn list(&self, workspace: Option<&str>) -> Vec<Arc<JobHandle>> {
        let index = self.index();
        index
            .order
            .iter()
            .rev()
            .filter_map(|id| index.by_id.get(id))
            .filter(|job| workspace.is_none_or(|ws| job.workspace() == ws))
            .cloned()
            .collect()
    }

    /// Most recent job of `operation` on `workspace`.
    pub fn latest(&self, workspace: &str, operation: OperationKind) -> Option<Arc<JobHandle>> {
        self.list(Some(workspace))
            .into_iter()
            .find(|job| job.operation() == operation)
    }

    fn index(&self) -> MutexGuard<'_, JobIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FailureKind;
    use crate::lock::LockManager;
    use futures::StreamExt;

    fn job(locks: &LockManager, ws: &str, op: OperationKind, limit: usize) -> JobHandle {
        let lease = locks.try_acquire(ws, JobId::new()).expect("grant");
        JobHandle::new(op, lease, limit)
    }

    #[test]
    fn new_job_is_queued_and_holds_lock() {
        let locks = LockManager::new();
        let job = job(&locks, "w1", OperationKind::Plan, 1024);
        assert_eq!(job.state(), JobState::Queued);
        assert_eq!(locks.holder("w1"), Some(job.id()));
        let snapshot = job.snapshot();
        assert!(!snapshot.mutating);
        assert_eq!(job.events()[0].state(), Some(JobState::Queued));
    }

    #[test]
    fn finish_releases_lock_and_is_final() {
        let locks = LockManager::new();
        let job = job(&locks, "w1", OperationKind::Apply, 1024);
        assert!(job.mark_running());
        assert!(job.finish(Resolution::succeeded(Some(0))));
        assert_eq!(locks.holder("w1"), None);

        assert!(!job.finish(Resolution::failed(FailureKind::Timeout, "late")));
        assert!(!job.mark_running());
        assert_eq!(job.state(), JobState::Succeeded);
        assert_eq!(job.snapshot().exit_code, Some(0));
    }

    #[test]
    fn cancel_rejected_after_terminal() {
        let locks = LockManager::new();
        let job = job(&locks, "w1", OperationKind::Destroy, 1024);
        job.finish(Resolution::succeeded(Some(0)));
        assert_eq!(
            job.request_cancel(),
            Err(CancelError::NotCancelable {
                id: job.id(),
                state: JobState::Succeeded
            })
        );
    }

    #[test]
    fn cancel_flips_receiver() {
        let locks = LockManager::new();
        let job = job(&locks, "w1", OperationKind::Apply, 1024);
        let rx = job.cancel_receiver();
        job.request_cancel().expect("cancel");
        assert!(*rx.borrow());
        assert!(job.snapshot().cancel_requested);
    }

    #[test]
    fn output_beyond_limit_is_counted_and_noted() {
        let locks = LockManager::new();
        let job = job(&locks, "w1", OperationKind::Plan, 10);
        job.mark_running();
        job.push_output(OutputStream::Stdout, "12345".to_string());
        job.push_output(OutputStream::Stdout, "67890".to_string());
        job.finish(Resolution::succeeded(Some(0)));

        let lines: Vec<String> = job
            .events()
            .iter()
            .filter_map(|e| e.line().map(str::to_string))
            .collect();
        assert_eq!(lines[0], "12345");
        assert!(lines[1].contains("truncated: 6 bytes"));
        assert_eq!(job.snapshot().output_truncated_bytes, 6);
    }

    #[tokio::test]
    async fn terminal_event_closes_stream() {
        let locks = LockManager::new();
        let job = job(&locks, "w1", OperationKind::Plan, 1024);
        let stream = job.subscribe();
        job.mark_running();
        job.push_output(OutputStream::Stdout, "Plan: 0 to add".to_string());
        job.finish(Resolution::succeeded(Some(0)));

        let states: Vec<JobState> = stream
            .filter_map(|e| async move { e.state() })
            .collect()
            .await;
        assert_eq!(
            states,
            vec![JobState::Queued, JobState::Running, JobState::Succeeded]
        );
    }

    #[test]
    fn table_lists_newest_first_and_finds_latest_by_kind() {
        let locks = LockManager::new();
        let table = JobTable::new();
        let a = Arc::new(job(&locks, "w1", OperationKind::Apply, 1024));
        a.finish(Resolution::succeeded(Some(0)));
        let b = Arc::new(job(&locks, "w2", OperationKind::Plan, 1024));
        let c = Arc::new(job(&locks, "w1", OperationKind::Plan, 1024));
        table.insert(Arc::clone(&a));
        table.insert(Arc::clone(&b));
        table.insert(Arc::clone(&c));

        let ids: Vec<JobId> = table.list(None).iter().map(|j| j.id()).collect();
        assert_eq!(ids, vec![c.id(), b.id(), a.id()]);
        let w1: Vec<JobId> = table.list(Some("w1")).iter().map(|j| j.id()).collect();
        assert_eq!(w1, vec![c.id(), a.id()]);
        assert_eq!(
            table.latest("w1", OperationKind::Apply).map(|j| j.id()),
            Some(a.id())
        );
        assert!(table.latest("w2", OperationKind::Destroy).is_none());
    }
}
