//! The orchestrator: the single owner of workspaces, locks and jobs.
//!
//! Submission is synchronous and never waits on the tool. Everything it can
//! reject (bad variables, bad workspace id, busy workspace, unusable
//! directory) is rejected before a job exists; once a [`JobId`] is returned,
//! the outcome is reported only through that job's state and events.

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{info, instrument, warn};

use crate::broadcast::EventStream;
use crate::core::render::render;
use crate::core::types::{JobEvent, JobId, JobSnapshot, OperationKind, ProvisioningRequest};
use crate::error::{CancelError, SubmitError};
use crate::io::config::OrchestratorConfig;
use crate::io::job_store::{JobStore, format_log};
use crate::io::outputs::OutputsStore;
use crate::io::process;
use crate::io::workspace::{WorkspaceError, WorkspaceStore, validate_workspace_id};
use crate::job::{JobHandle, JobTable};
use crate::lock::LockManager;
use crate::supervisor::{self, JobContext};

/// What is known about one workspace right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceSummary {
    pub workspace: String,
    /// Job currently holding the workspace lock.
    pub holder: Option<JobId>,
    pub initialized: bool,
    pub has_state: bool,
    /// `init` recorded a backend, so state may live outside the workspace.
    pub has_backend: bool,
    /// Resource addresses reported by `state list`. `None` when the tool was
    /// not asked (workspace busy or never initialized) or the query failed.
    pub resources: Option<Vec<String>>,
    pub last_plan: Option<JobSnapshot>,
    pub last_apply: Option<JobSnapshot>,
    pub last_destroy: Option<JobSnapshot>,
}

#[derive(Debug)]
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    workspaces: Arc<WorkspaceStore>,
    locks: LockManager,
    jobs: JobTable,
    records: JobStore,
    outputs: OutputsStore,
    runtime: Handle,
}

impl Orchestrator {
    /// Validate `config`, create the state directories and bind to the
    /// current tokio runtime, which runs every job's supervisor.
    pub fn new(config: OrchestratorConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let runtime =
            Handle::try_current().context("orchestrator must be created inside a tokio runtime")?;
        for dir in [
            config.workspaces_dir(),
            config.jobs_dir(),
            config.outputs_dir(),
        ] {
            fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        }
        info!(
            state_dir = %config.state_dir.display(),
            tool = %config.tool.executable,
            "orchestrator ready"
        );
        Ok(Arc::new(Self {
            workspaces: Arc::new(WorkspaceStore::new(
                config.workspaces_dir(),
                config.template_dir.clone(),
                config.input_file_name.clone(),
            )),
            locks: LockManager::new(),
            jobs: JobTable::new(),
            records: JobStore::new(config.jobs_dir()),
            outputs: OutputsStore::new(config.outputs_dir()),
            config: Arc::new(config),
            runtime,
        }))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Accept a request and start its job in the background.
    #[instrument(skip_all, fields(workspace = %request.workspace, operation = %request.operation))]
    pub fn submit(&self, request: ProvisioningRequest) -> Result<JobId, SubmitError> {
        validate_workspace_id(&request.workspace)?;
        let input = render(&request.variables)?;

        let id = JobId::new();
        let lease = self.locks.try_acquire(&request.workspace, id)?;
        // A destroy without variables reuses whatever the last apply wrote.
        let keep_input =
            request.operation == OperationKind::Destroy && request.variables.is_empty();
        let workdir = match self.prepare_workspace(&request.workspace, &input, keep_input) {
            Ok(dir) => dir,
            Err(err) => {
                lease.release();
                return Err(err.into());
            }
        };

        let job = Arc::new(JobHandle::new(
            request.operation,
            lease,
            self.config.output_limit_bytes,
        ));
        self.jobs.insert(Arc::clone(&job));
        info!(job_id = %id, "job submitted");

        supervisor::launch(
            &self.runtime,
            JobContext {
                job,
                workdir,
                config: Arc::clone(&self.config),
                workspaces: Arc::clone(&self.workspaces),
                outputs: self.outputs.clone(),
                records: self.records.clone(),
            },
        );
        Ok(id)
    }

    fn prepare_workspace(
        &self,
        workspace: &str,
        input: &str,
        keep_input: bool,
    ) -> Result<std::path::PathBuf, WorkspaceError> {
        let dir = self.workspaces.resolve(workspace)?;
        if !keep_input {
            self.workspaces.write_input(workspace, input)?;
        }
        Ok(dir)
    }

    /// Current snapshot; falls back to the persisted record for jobs that
    /// finished before a restart.
    pub fn status(&self, id: JobId) -> Option<JobSnapshot> {
        if let Some(job) = self.jobs.get(id) {
            return Some(job.snapshot());
        }
        match self.records.load(id) {
            Ok(record) => record,
            Err(err) => {
                warn!(job_id = %id, err = %format!("{err:#}"), "unreadable job record");
                None
            }
        }
    }

    /// Full backlog followed by live events; ends after the terminal event.
    pub fn stream_events(&self, id: JobId) -> Option<EventStream> {
        self.jobs.get(id).map(|job| job.subscribe())
    }

    /// Events recorded so far, without waiting.
    pub fn events(&self, id: JobId) -> Option<Vec<JobEvent>> {
        self.jobs.get(id).map(|job| job.events())
    }

    pub fn cancel(&self, id: JobId) -> Result<(), CancelError> {
        self.jobs
            .get(id)
            .ok_or(CancelError::NotFound(id))?
            .request_cancel()
    }

    /// Captured output as plain text: rendered from memory for jobs since
    /// startup, read from the persisted log otherwise.
    pub fn job_log(&self, id: JobId) -> Result<Option<String>> {
        match self.jobs.get(id) {
            Some(job) => Ok(Some(format_log(&job.events()))),
            None => self.records.read_log(id),
        }
    }

    /// Wait until the job is terminal and return its final snapshot.
    pub async fn wait(&self, id: JobId) -> Option<JobSnapshot> {
        let job = self.jobs.get(id)?;
        let mut events = job.subscribe();
        while events.next().await.is_some() {}
        Some(job.snapshot())
    }

    /// Jobs since startup, newest first.
    pub fn list_jobs(&self, workspace: Option<&str>) -> Vec<JobSnapshot> {
        self.jobs
            .list(workspace)
            .iter()
            .map(|job| job.snapshot())
            .collect()
    }

    pub fn last_job(&self, workspace: &str, operation: OperationKind) -> Option<JobSnapshot> {
        self.jobs
            .latest(workspace, operation)
            .map(|job| job.snapshot())
    }

    pub fn workspace_holder(&self, workspace: &str) -> Option<JobId> {
        self.locks.holder(workspace)
    }

    /// Outputs captured by the workspace's last successful apply.
    pub fn outputs(&self, workspace: &str) -> Result<Option<Value>> {
        validate_workspace_id(workspace)?;
        self.outputs.read(workspace)
    }

    pub async fn workspace_summary(
        &self,
        workspace: &str,
    ) -> Result<WorkspaceSummary, WorkspaceError> {
        validate_workspace_id(workspace)?;
        let holder = self.workspace_holder(workspace);
        let resources = if holder.is_none() {
            self.resources(workspace).await
        } else {
            None
        };
        Ok(WorkspaceSummary {
            workspace: workspace.to_string(),
            holder,
            initialized: self.workspaces.is_initialized(workspace),
            has_state: self.workspaces.has_state(workspace),
            has_backend: self.workspaces.has_backend(workspace),
            resources,
            last_plan: self.last_job(workspace, OperationKind::Plan),
            last_apply: self.last_job(workspace, OperationKind::Apply),
            last_destroy: self.last_job(workspace, OperationKind::Destroy),
        })
    }

    /// Ask the tool which resources the workspace manages.
    #[instrument(skip(self))]
    async fn resources(&self, workspace: &str) -> Option<Vec<String>> {
        if !self.workspaces.is_initialized(workspace) {
            return None;
        }
        if !self.workspaces.may_have_state(workspace) {
            return Some(Vec::new());
        }
        let spec = supervisor::command(
            &self.config,
            &self.workspaces.dir(workspace),
            supervisor::state_list_args(),
        );
        match process::capture(&spec, supervisor::QUERY_TIMEOUT).await {
            Ok(out) if out.status.success() => Some(
                out.stdout
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            Ok(out) => {
                warn!(status = %out.status, stderr = %out.stderr.trim(), "state list failed");
                None
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "state list failed");
                None
            }
        }
    }
}
