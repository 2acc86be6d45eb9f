//! Shared deterministic types for provisioning requests and jobs.
//!
//! These types define stable contracts between the orchestrator components and
//! its callers. They serialize to the JSON shapes exposed by the HTTP API and
//! persisted under `jobs/`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle verb executed against a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Plan,
    Apply,
    Destroy,
}

impl OperationKind {
    /// Subcommand name passed to the tool.
    pub fn verb(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        }
    }

    /// `plan` is a dry run; `apply` and `destroy` change remote infrastructure.
    pub fn is_mutating(self) -> bool {
        !matches!(self, Self::Plan)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown operation {0:?}: expected plan, apply or destroy")]
pub struct ParseOperationError(pub String);

impl FromStr for OperationKind {
    type Err = ParseOperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plan" => Ok(Self::Plan),
            "apply" => Ok(Self::Apply),
            "destroy" => Ok(Self::Destroy),
            other => Err(ParseOperationError(other.to_string())),
        }
    }
}

/// Variable name to value. Ordered so rendering is deterministic.
pub type Variables = BTreeMap<String, Value>;

/// A validated request handed over by the form layer. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    pub operation: OperationKind,
    pub workspace: String,
    #[serde(default)]
    pub variables: Variables,
}

impl ProvisioningRequest {
    pub fn new(operation: OperationKind, workspace: impl Into<String>) -> Self {
        Self {
            operation,
            workspace: workspace.into(),
            variables: Variables::new(),
        }
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

/// Correlation handle for a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Job lifecycle state. `Succeeded`, `Failed` and `Canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The executable could not be started.
    ProcessLaunch,
    /// The automatic `init` step did not succeed.
    InitFailed,
    /// The verb exited with a nonzero code.
    NonZeroExit,
    /// The process was terminated by a signal the orchestrator did not send.
    Signaled,
    /// The configured job timeout elapsed.
    Timeout,
    /// Cancellation escalated to a forced kill.
    Killed,
    /// The process vanished without a normal exit, or its supervisor died.
    CrashDuringExecution,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Source of an output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// Lines written by the orchestrator itself (skipped steps, truncation).
    Notice,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Output { stream: OutputStream, line: String },
    State { state: JobState },
}

/// One entry of a job's append-only event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Position in the job's log, starting at 0.
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl JobEvent {
    pub fn state(&self) -> Option<JobState> {
        match self.kind {
            EventKind::State { state } => Some(state),
            EventKind::Output { .. } => None,
        }
    }

    pub fn line(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Output { line, .. } => Some(line),
            EventKind::State { .. } => None,
        }
    }
}

/// How a supervised process ended, as observed by the process runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// Ran to completion with an exit code.
    Exited { code: i32 },
    /// Terminated by a signal the orchestrator did not send.
    Signaled { signal: i32 },
    /// Exceeded its deadline and was terminated; `forced` when the grace period also expired.
    TimedOut { forced: bool, signal: Option<i32> },
    /// Cancellation was requested and the process ended after the polite signal.
    Canceled {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Cancellation grace period expired and the process was killed.
    Killed { signal: Option<i32> },
    /// Waiting on the process failed; its fate is unknown.
    Crashed { message: String },
}

/// Point-in-time view of a job, safe to hand to any caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub workspace: String,
    pub operation: OperationKind,
    /// Whether the operation changes remote infrastructure.
    pub mutating: bool,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub failure: Option<JobFailure>,
    pub cancel_requested: bool,
    pub output_truncated_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_parses_case_insensitively() {
        assert_eq!("Apply".parse::<OperationKind>(), Ok(OperationKind::Apply));
        assert_eq!(" plan ".parse::<OperationKind>(), Ok(OperationKind::Plan));
        assert!("refresh".parse::<OperationKind>().is_err());
    }

    #[test]
    fn only_plan_is_a_dry_run() {
        assert!(!OperationKind::Plan.is_mutating());
        assert!(OperationKind::Apply.is_mutating());
        assert!(OperationKind::Destroy.is_mutating());
    }

    #[test]
    fn request_deserializes_without_variables() {
        let request: ProvisioningRequest =
            serde_json::from_str(r#"{"operation":"destroy","workspace":"w1"}"#).expect("parse");
        assert_eq!(request.operation, OperationKind::Destroy);
        assert!(request.variables.is_empty());
    }

    #[test]
    fn events_serialize_flat_with_type_tag() {
        let event = JobEvent {
            seq: 3,
            at: DateTime::from_timestamp(0, 0).expect("epoch"),
            kind: EventKind::Output {
                stream: OutputStream::Stdout,
                line: "Plan: 1 to add".to_string(),
            },
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "output");
        assert_eq!(json["stream"], "stdout");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["line"], "Plan: 1 to add");
    }
}
