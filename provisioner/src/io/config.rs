//! Orchestrator configuration stored as TOML (default `provisioner.toml`).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::atomic::write_atomic;

/// Orchestrator configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to values suitable
/// for driving a local `terraform` binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Root for workspaces, job records and captured outputs.
    pub state_dir: PathBuf,

    /// Root module copied into each new workspace (top-level files only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_dir: Option<PathBuf>,

    /// Name of the rendered variables file inside each workspace.
    pub input_file_name: String,

    /// Wall-clock budget for a whole job (init + verb) in seconds.
    pub job_timeout_secs: u64,

    /// Time between the polite termination signal and the forced kill.
    pub cancel_grace_secs: u64,

    /// Per-job cap on stored output; later lines are dropped and counted.
    pub output_limit_bytes: usize,

    pub destroy_without_state: DestroyWithoutState,

    pub tool: ToolConfig,
}

/// What to do with a `destroy` for a workspace that has neither local state
/// nor a configured backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DestroyWithoutState {
    /// Resolve as a successful no-op without running the tool.
    #[default]
    Skip,
    /// Run `destroy` anyway.
    Run,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolConfig {
    /// Executable to run (looked up on `PATH` when not absolute).
    pub executable: String,

    /// Arguments placed before the subcommand (e.g. `-chdir=...`).
    pub global_args: Vec<String>,

    /// Run `init` first when the workspace has no `.terraform/` directory.
    pub auto_init: bool,

    /// Pass `-upgrade` to `init`, re-resolving providers and modules instead
    /// of honoring versions already pinned in the lock file.
    pub init_upgrade: bool,

    /// Pass `-no-color` so captured output is plain text.
    pub no_color: bool,

    /// Extra environment variables for every invocation.
    pub env: BTreeMap<String, String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            executable: "terraform".to_string(),
            global_args: Vec::new(),
            auto_init: true,
            init_upgrade: false,
            no_color: true,
            env: BTreeMap::new(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".provisioner"),
            template_dir: None,
            input_file_name: "terraform.tfvars".to_string(),
            job_timeout_secs: 60 * 60,
            cancel_grace_secs: 10,
            output_limit_bytes: 10_000_000,
            destroy_without_state: DestroyWithoutState::Skip,
            tool: ToolConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.job_timeout_secs == 0 {
            return Err(anyhow!("job_timeout_secs must be > 0"));
        }
        if self.cancel_grace_secs == 0 {
            return Err(anyhow!("cancel_grace_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.tool.executable.trim().is_empty() {
            return Err(anyhow!("tool.executable must be non-empty"));
        }
        let name = self.input_file_name.as_str();
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(anyhow!("input_file_name must be a plain file name"));
        }
        if !name.ends_with(".tfvars") {
            return Err(anyhow!("input_file_name must end with .tfvars"));
        }
        Ok(())
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.state_dir.join("workspaces")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.state_dir.join("jobs")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.state_dir.join("outputs")
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes()).with_context(|| format!("write config {}", path.display()))
}
