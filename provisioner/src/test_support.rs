//! Test-only helpers: a scripted stand-in for the provisioning tool and
//! request builders.
//!
//! The fake tool is a `/bin/sh` script passed through `tool.global_args`, so
//! every invocation runs `/bin/sh <script> <subcommand> ...`. Each subcommand
//! runs a configurable shell snippet inside the workspace directory, and every
//! call is appended to `calls.log`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

use crate::core::types::{JobId, JobSnapshot, OperationKind, ProvisioningRequest};
use crate::io::config::OrchestratorConfig;
use crate::orchestrator::Orchestrator;

/// Shell snippets run for each subcommand, in the workspace directory.
#[derive(Debug, Clone)]
pub struct FakeScript {
    pub init: String,
    pub plan: String,
    pub apply: String,
    pub destroy: String,
    pub output: String,
    /// Handles `state <subcommand>`.
    pub state: String,
}

impl Default for FakeScript {
    fn default() -> Self {
        Self {
            init: "mkdir -p .terraform\necho 'Terraform has been successfully initialized!'"
                .to_string(),
            plan: "echo 'Plan: 1 to add, 0 to change, 0 to destroy.'".to_string(),
            apply: "echo 'aws_instance.web: Creating...'\n\
                    echo '{\"version\": 4}' > terraform.tfstate\n\
                    echo 'Apply complete! Resources: 1 added, 0 changed, 0 destroyed.'"
                .to_string(),
            destroy: "rm -f terraform.tfstate\necho 'Destroy complete! Resources: 1 destroyed.'"
                .to_string(),
            output: "echo '{\"public_ip\": {\"sensitive\": false, \"type\": \"string\", \"value\": \"10.0.0.5\"}}'"
                .to_string(),
            state: "if [ -s terraform.tfstate ]; then echo 'aws_instance.web'; fi".to_string(),
        }
    }
}

impl FakeScript {
    pub fn plan(mut self, snippet: &str) -> Self {
        self.plan = snippet.to_string();
        self
    }

    pub fn apply(mut self, snippet: &str) -> Self {
        self.apply = snippet.to_string();
        self
    }

    pub fn destroy(mut self, snippet: &str) -> Self {
        self.destroy = snippet.to_string();
        self
    }

    pub fn init(mut self, snippet: &str) -> Self {
        self.init = snippet.to_string();
        self
    }

    pub fn output(mut self, snippet: &str) -> Self {
        self.output = snippet.to_string();
        self
    }

    pub fn state(mut self, snippet: &str) -> Self {
        self.state = snippet.to_string();
        self
    }

    fn render(&self, calls_log: &Path) -> String {
        format!(
            "#!/bin/sh\n\
             cmd=\"$1\"\n\
             shift\n\
             echo \"$cmd $*\" >> '{calls}'\n\
             case \"$cmd\" in\n\
             init)\n{init}\n;;\n\
             plan)\n{plan}\n;;\n\
             apply)\n{apply}\n;;\n\
             destroy)\n{destroy}\n;;\n\
             output)\n{output}\n;;\n\
             state)\n{state}\n;;\n\
             *)\necho \"unknown command $cmd\" >&2\nexit 64\n;;\n\
             esac\n",
            calls = calls_log.display(),
            init = self.init,
            plan = self.plan,
            apply = self.apply,
            destroy = self.destroy,
            output = self.output,
            state = self.state,
        )
    }
}

/// A fake tool plus a private state directory, both removed on drop.
#[derive(Debug)]
pub struct FakeTool {
    root: TempDir,
    script: PathBuf,
}

impl FakeTool {
    pub fn new() -> Self {
        Self::with_script(FakeScript::default())
    }

    pub fn with_script(script: FakeScript) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let path = root.path().join("fake-terraform.sh");
        let calls = root.path().join("calls.log");
        fs::write(&path, script.render(&calls)).expect("write fake tool");
        Self { root, script: path }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.path().join("state")
    }

    pub fn workspace_dir(&self, workspace: &str) -> PathBuf {
        self.state_dir().join("workspaces").join(workspace)
    }

    /// Config driving this tool with short time limits.
    pub fn config(&self) -> OrchestratorConfig {
        let mut cfg = OrchestratorConfig {
            state_dir: self.state_dir(),
            job_timeout_secs: 30,
            cancel_grace_secs: 2,
            ..OrchestratorConfig::default()
        };
        cfg.tool.executable = "/bin/sh".to_string();
        cfg.tool.global_args = vec![self.script.display().to_string()];
        cfg
    }

    /// Every invocation so far, as `"<subcommand> <args...>"`.
    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.root.path().join("calls.log"))
            .map(|log| log.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

impl Default for FakeTool {
    fn default() -> Self {
        Self::new()
    }
}

pub fn plan(workspace: &str) -> ProvisioningRequest {
    ProvisioningRequest::new(OperationKind::Plan, workspace).with_var("region", "us-east-1")
}

pub fn apply(workspace: &str) -> ProvisioningRequest {
    ProvisioningRequest::new(OperationKind::Apply, workspace)
        .with_var("region", "us-east-1")
        .with_var("instance_type", "t3.micro")
}

pub fn destroy(workspace: &str) -> ProvisioningRequest {
    ProvisioningRequest::new(OperationKind::Destroy, workspace)
}

/// Wait for a job to finish, failing the test after 20 seconds.
pub async fn finish(orchestrator: &Orchestrator, id: JobId) -> JobSnapshot {
    tokio::time::timeout(Duration::from_secs(20), orchestrator.wait(id))
        .await
        .expect("job finished in time")
        .expect("job exists")
}
