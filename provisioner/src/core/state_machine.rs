//! Job lifecycle rules: allowed transitions and exit resolution.
//!
//! `queued → running → {succeeded, failed, canceled}`, plus direct
//! `queued → terminal` for jobs that never start a process. Terminal states
//! have no outgoing transitions.

use crate::core::types::{FailureKind, JobFailure, JobState, ProcessExit};

pub fn can_transition(from: JobState, to: JobState) -> bool {
    match from {
        JobState::Queued => to != JobState::Queued,
        JobState::Running => to.is_terminal(),
        JobState::Succeeded | JobState::Failed | JobState::Canceled => false,
    }
}

/// Cancellation is honored only before the job reaches a terminal state.
pub fn can_cancel(state: JobState) -> bool {
    !state.is_terminal()
}

/// Terminal outcome to record on a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub failure: Option<JobFailure>,
}

impl Resolution {
    pub fn succeeded(exit_code: Option<i32>) -> Self {
        Self {
            state: JobState::Succeeded,
            exit_code,
            signal: None,
            failure: None,
        }
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            exit_code: None,
            signal: None,
            failure: Some(JobFailure::new(kind, message)),
        }
    }

    pub fn canceled() -> Self {
        Self {
            state: JobState::Canceled,
            exit_code: None,
            signal: None,
            failure: None,
        }
    }

    fn with_exit(mut self, exit_code: Option<i32>, signal: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self.signal = signal;
        self
    }
}

/// Map an observed process exit to the job's terminal state.
///
/// A process that exited with code 0 succeeds even if a cancellation arrived
/// meanwhile; the runner only reports `Canceled` when the process actually
/// ended because of the cancel signal.
pub fn resolve_exit(exit: &ProcessExit) -> Resolution {
    match exit {
        ProcessExit::Exited { code: 0 } => Resolution::succeeded(Some(0)),
        ProcessExit::Exited { code } => {
            Resolution::failed(FailureKind::NonZeroExit, format!("exited with code {code}"))
                .with_exit(Some(*code), None)
        }
        ProcessExit::Signaled { signal } => Resolution::failed(
            FailureKind::Signaled,
            format!("terminated by signal {signal}"),
        )
        .with_exit(None, Some(*signal)),
        ProcessExit::TimedOut { forced, signal } => {
            let message = if *forced {
                "timed out; killed after grace period"
            } else {
                "timed out; terminated"
            };
            Resolution::failed(FailureKind::Timeout, message).with_exit(None, *signal)
        }
        ProcessExit::Canceled { code, signal } => Resolution::canceled().with_exit(*code, *signal),
        ProcessExit::Killed { signal } => Resolution::failed(
            FailureKind::Killed,
            "cancellation grace period expired; process killed",
        )
        .with_exit(None, *signal),
        ProcessExit::Crashed { message } => {
            Resolution::failed(FailureKind::CrashDuringExecution, message.clone())
        }
    }
}
