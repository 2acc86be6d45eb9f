//! Job orchestration for an infrastructure-as-code CLI.
//!
//! Accepts provisioning requests (`plan`, `apply`, `destroy` against a named
//! workspace), renders their variables into a `.tfvars` file, runs the tool as
//! a supervised subprocess and streams its output to any number of observers.
//! The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (request types, rendering, the job
//!   state machine). No I/O.
//! - **[`io`]**: Side effects (workspace directories, config, child processes,
//!   persisted records).
//!
//! [`orchestrator::Orchestrator`] ties them together with the per-workspace
//! [`lock`]s, the job table in [`job`] and one supervisor task per job.

pub mod broadcast;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod job;
pub mod lock;
pub mod logging;
pub mod orchestrator;
mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use crate::core::types::{
    JobEvent, JobId, JobSnapshot, JobState, OperationKind, ProvisioningRequest,
};
pub use crate::error::{CancelError, SubmitError};
pub use crate::io::config::OrchestratorConfig;
pub use crate::orchestrator::Orchestrator;
