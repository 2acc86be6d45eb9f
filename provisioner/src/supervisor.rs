//! Per-job supervision: runs the tool phases for one job and resolves its
//! terminal state.
//!
//! Every job gets two tasks. The supervisor drives `init` (when needed), the
//! verb and the post-success steps. A watchdog awaits the supervisor's join
//! handle and fails the job with `CrashDuringExecution` if the supervisor
//! panicked or was aborted, so a job can never be left non-terminal with its
//! workspace locked.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::core::state_machine::{Resolution, resolve_exit};
use crate::core::types::{FailureKind, JobState, OperationKind};
use crate::io::config::{DestroyWithoutState, OrchestratorConfig};
use crate::io::job_store::JobStore;
use crate::io::outputs::OutputsStore;
use crate::io::process::{self, CommandSpec, RunLimits};
use crate::io::workspace::WorkspaceStore;
use crate::job::JobHandle;

/// Budget for short read-only tool queries (`output`, `state list`).
pub(crate) const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything a supervisor needs; cheap to build per job.
#[derive(Debug)]
pub(crate) struct JobContext {
    pub job: Arc<JobHandle>,
    pub workdir: PathBuf,
    pub config: Arc<OrchestratorConfig>,
    pub workspaces: Arc<WorkspaceStore>,
    pub outputs: OutputsStore,
    pub records: JobStore,
}

/// Start the supervisor and its watchdog on `runtime`.
pub(crate) fn launch(runtime: &Handle, ctx: JobContext) {
    let job = Arc::clone(&ctx.job);
    let records = ctx.records.clone();
    let supervisor = runtime.spawn(run_job(ctx));
    watch(runtime, job, records, supervisor);
}

/// Fail `job` with `CrashDuringExecution` if `supervisor` panics or is aborted
/// before resolving it.
fn watch(
    runtime: &Handle,
    job: Arc<JobHandle>,
    records: JobStore,
    supervisor: JoinHandle<()>,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        let Err(err) = supervisor.await else {
            return;
        };
        error!(job_id = %job.id(), err = %err, "job supervisor died");
        let resolution = Resolution::failed(
            FailureKind::CrashDuringExecution,
            format!("supervisor task failed: {err}"),
        );
        if job.finish(resolution) {
            persist(&records, &job);
        }
    })
}

#[instrument(skip_all, fields(job_id = %ctx.job.id(), workspace = %ctx.job.workspace(), operation = %ctx.job.operation()))]
async fn run_job(ctx: JobContext) {
    let resolution = drive(&ctx).await;
    if ctx.job.finish(resolution) {
        persist(&ctx.records, &ctx.job);
    }
}

async fn drive(ctx: &JobContext) -> Resolution {
    let job = &ctx.job;
    if job.cancel_requested() {
        job.notice("canceled before start");
        return Resolution::canceled();
    }

    if job.operation() == OperationKind::Destroy
        && ctx.config.destroy_without_state == DestroyWithoutState::Skip
        && !ctx.workspaces.may_have_state(job.workspace())
    {
        info!("no local state and no backend, skipping destroy");
        job.notice("no local state or configured backend found; nothing to destroy");
        return Resolution::succeeded(None);
    }

    // One budget for init and the verb together.
    let deadline = Instant::now() + ctx.config.job_timeout();

    if ctx.config.tool.auto_init && !ctx.workspaces.is_initialized(job.workspace()) {
        let init = run_phase(ctx, init_args(&ctx.config), deadline).await;
        if init.state != JobState::Succeeded {
            return init_failure(init);
        }
        if job.cancel_requested() {
            job.notice("canceled after init");
            return Resolution::canceled();
        }
    }

    let input = ctx.workdir.join(&ctx.config.input_file_name);
    let args = verb_args(&ctx.config, job.operation(), input.is_file());
    let resolution = run_phase(ctx, args, deadline).await;
    if resolution.state == JobState::Succeeded {
        after_success(ctx).await;
    }
    resolution
}

async fn run_phase(ctx: &JobContext, args: Vec<String>, deadline: Instant) -> Resolution {
    let job = &ctx.job;
    let spec = command(&ctx.config, &ctx.workdir, args);
    let running = match process::spawn(&spec) {
        Ok(running) => running,
        Err(err) => {
            warn!(err = %err, "tool failed to launch");
            return Resolution::failed(FailureKind::ProcessLaunch, err.to_string());
        }
    };
    job.mark_running();

    let limits = RunLimits {
        timeout: deadline.saturating_duration_since(Instant::now()),
        grace: ctx.config.cancel_grace(),
    };
    let exit = running
        .supervise(limits, job.cancel_receiver(), |stream, line| {
            job.push_output(stream, line);
        })
        .await;
    resolve_exit(&exit)
}

/// A nonzero `init` is its own failure kind; other outcomes pass through.
fn init_failure(resolution: Resolution) -> Resolution {
    let is_nonzero = resolution
        .failure
        .as_ref()
        .is_some_and(|f| f.kind == FailureKind::NonZeroExit);
    if !is_nonzero {
        return resolution;
    }
    let code = resolution.exit_code;
    let message = match code {
        Some(code) => format!("init exited with code {code}"),
        None => "init failed".to_string(),
    };
    Resolution {
        exit_code: code,
        ..Resolution::failed(FailureKind::InitFailed, message)
    }
}

async fn after_success(ctx: &JobContext) {
    let workspace = ctx.job.workspace();
    match ctx.job.operation() {
        OperationKind::Plan => {}
        OperationKind::Apply => capture_outputs(ctx).await,
        OperationKind::Destroy => {
            if let Err(err) = ctx.outputs.clear(workspace) {
                warn!(err = %err, "failed to clear outputs");
            }
        }
    }
}

async fn capture_outputs(ctx: &JobContext) {
    let workspace = ctx.job.workspace();
    let spec = command(&ctx.config, &ctx.workdir, output_args(&ctx.config));
    let stored = match process::capture(&spec, QUERY_TIMEOUT).await {
        Ok(out) if out.status.success() => {
            match ctx.outputs.write_simplified(workspace, &out.stdout) {
                Ok(value) => {
                    let count = value.as_object().map_or(0, |m| m.len());
                    debug!(count, "outputs captured");
                    Ok(())
                }
                Err(err) => ctx
                    .outputs
                    .write_error(workspace, &format!("{err:#}"), &out.stderr),
            }
        }
        Ok(out) => {
            let message = match out.status.code() {
                Some(code) => format!("output exited with code {code}"),
                None => "output was terminated by a signal".to_string(),
            };
            ctx.outputs.write_error(workspace, &message, &out.stderr)
        }
        Err(err) => ctx.outputs.write_error(workspace, &format!("{err:#}"), ""),
    };
    if let Err(err) = stored {
        warn!(err = %err, "failed to store outputs");
    }
}

/// Record and log are best effort; failures never change the outcome.
fn persist(records: &JobStore, job: &JobHandle) {
    if let Err(err) = records.persist(&job.snapshot()) {
        warn!(job_id = %job.id(), err = %format!("{err:#}"), "failed to persist job record");
    }
    if let Err(err) = records.write_log(job.id(), &job.events()) {
        warn!(job_id = %job.id(), err = %format!("{err:#}"), "failed to write job log");
    }
}

pub(crate) fn command(
    config: &OrchestratorConfig,
    workdir: &Path,
    args: Vec<String>,
) -> CommandSpec {
    let mut spec = CommandSpec::new(config.tool.executable.clone(), workdir)
        .args(config.tool.global_args.iter().cloned())
        .args(args);
    spec.env.insert("TF_IN_AUTOMATION".to_string(), "1".to_string());
    spec.env.extend(config.tool.env.clone());
    spec
}

fn init_args(config: &OrchestratorConfig) -> Vec<String> {
    let mut args = vec!["init".to_string(), "-input=false".to_string()];
    if config.tool.init_upgrade {
        args.push("-upgrade".to_string());
    }
    if config.tool.no_color {
        args.push("-no-color".to_string());
    }
    args
}

fn verb_args(
    config: &OrchestratorConfig,
    operation: OperationKind,
    has_input: bool,
) -> Vec<String> {
    let mut args = vec![operation.verb().to_string(), "-input=false".to_string()];
    if operation.is_mutating() {
        args.push("-auto-approve".to_string());
    }
    if config.tool.no_color {
        args.push("-no-color".to_string());
    }
    if has_input {
        args.push(format!("-var-file={}", config.input_file_name));
    }
    args
}

fn output_args(config: &OrchestratorConfig) -> Vec<String> {
    let mut args = vec!["output".to_string(), "-json".to_string()];
    if config.tool.no_color {
        args.push("-no-color".to_string());
    }
    args
}

pub(crate) fn state_list_args() -> Vec<String> {
    vec!["state".to_string(), "list".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::JobId;
    use crate::lock::LockManager;

    #[test]
    fn verb_args_follow_operation() {
        let config = OrchestratorConfig::default();
        assert_eq!(
            verb_args(&config, OperationKind::Plan, true),
            ["plan", "-input=false", "-no-color", "-var-file=terraform.tfvars"]
        );
        assert_eq!(
            verb_args(&config, OperationKind::Destroy, false),
            ["destroy", "-input=false", "-auto-approve", "-no-color"]
        );
    }

    #[test]
    fn command_puts_global_args_first() {
        let mut config = OrchestratorConfig::default();
        config.tool.global_args = vec!["-chdir=stack".to_string()];
        config.tool.no_color = false;
        config.tool.env.insert("TF_LOG".to_string(), "WARN".to_string());

        let spec = command(&config, Path::new("/tmp/w1"), init_args(&config));
        assert_eq!(spec.display(), "terraform -chdir=stack init -input=false");
        assert_eq!(spec.env.get("TF_LOG").map(String::as_str), Some("WARN"));
        assert_eq!(spec.env.get("TF_IN_AUTOMATION").map(String::as_str), Some("1"));
    }

    #[test]
    fn init_upgrade_is_opt_in() {
        let mut config = OrchestratorConfig::default();
        assert_eq!(init_args(&config), ["init", "-input=false", "-no-color"]);
        config.tool.init_upgrade = true;
        assert_eq!(
            init_args(&config),
            ["init", "-input=false", "-upgrade", "-no-color"]
        );
    }

    #[test]
    fn nonzero_init_becomes_init_failed() {
        let nonzero = resolve_exit(&crate::core::types::ProcessExit::Exited { code: 1 });
        let mapped = init_failure(nonzero);
        assert_eq!(mapped.state, JobState::Failed);
        assert_eq!(mapped.exit_code, Some(1));
        assert_eq!(mapped.failure.map(|f| f.kind), Some(FailureKind::InitFailed));

        let timeout = Resolution::failed(FailureKind::Timeout, "timed out");
        assert_eq!(init_failure(timeout.clone()), timeout);
        assert_eq!(init_failure(Resolution::canceled()), Resolution::canceled());
    }

    async fn crashing_supervisor() {
        panic!("supervisor bug");
    }

    fn held_job(locks: &LockManager) -> Arc<JobHandle> {
        let lease = locks.try_acquire("w1", JobId::new()).expect("grant");
        Arc::new(JobHandle::new(OperationKind::Apply, lease, 1024))
    }

    #[tokio::test]
    async fn panicking_supervisor_fails_job_and_frees_workspace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let records = JobStore::new(temp.path());
        let locks = LockManager::new();
        let job = held_job(&locks);
        assert_eq!(locks.holder("w1"), Some(job.id()));

        let supervisor = tokio::spawn(crashing_supervisor());
        watch(&Handle::current(), Arc::clone(&job), records.clone(), supervisor)
            .await
            .expect("watchdog");

        let snapshot = job.snapshot();
        assert_eq!(snapshot.state, JobState::Failed);
        assert_eq!(
            snapshot.failure.map(|f| f.kind),
            Some(FailureKind::CrashDuringExecution)
        );
        assert_eq!(locks.holder("w1"), None);
        let record = records.load(job.id()).expect("load").expect("record");
        assert_eq!(record.state, JobState::Failed);
    }

    #[tokio::test]
    async fn aborted_supervisor_fails_job() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locks = LockManager::new();
        let job = held_job(&locks);

        let supervisor = tokio::spawn(std::future::pending::<()>());
        supervisor.abort();
        watch(&Handle::current(), Arc::clone(&job), JobStore::new(temp.path()), supervisor)
            .await
            .expect("watchdog");

        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(locks.holder("w1"), None);
    }

    #[tokio::test]
    async fn finished_supervisor_leaves_job_alone() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locks = LockManager::new();
        let job = held_job(&locks);
        assert!(job.finish(Resolution::succeeded(Some(0))));

        let supervisor = tokio::spawn(async {});
        watch(&Handle::current(), Arc::clone(&job), JobStore::new(temp.path()), supervisor)
            .await
            .expect("watchdog");
        assert_eq!(job.state(), JobState::Succeeded);
    }
}
