//! Command-line front end: run one operation and stream its output.
//!
//! Job output goes to stdout (tool stderr to stderr) as it is produced;
//! orchestrator notes and state changes go to stderr.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::Value;

use provisioner::core::types::{EventKind, OutputStream, Variables};
use provisioner::exit_codes;
use provisioner::io::config::{OrchestratorConfig, load_config, write_config};
use provisioner::{JobState, OperationKind, Orchestrator, ProvisioningRequest, SubmitError};

#[derive(Parser)]
#[command(
    name = "provisioner",
    version,
    about = "Run plan/apply/destroy jobs against isolated workspaces"
)]
struct Cli {
    /// Config file (TOML). A missing file means defaults.
    #[arg(long, global = true, default_value = "provisioner.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one operation against a workspace and stream its output.
    Run {
        /// plan, apply or destroy.
        operation: OperationKind,

        /// Workspace id ([A-Za-z0-9_-], up to 64 characters).
        #[arg(long)]
        workspace: String,

        /// Variable as NAME=VALUE. VALUE is parsed as JSON when possible,
        /// otherwise taken as a string. Repeatable; overrides --var-file.
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,

        /// JSON object of variables.
        #[arg(long)]
        var_file: Option<PathBuf>,
    },
    /// Write a default config file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    provisioner::logging::init("warn");
    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::FAILED
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::InitConfig { force } => {
            cmd_init_config(&cli.config, force)?;
            Ok(exit_codes::OK)
        }
        Command::Run {
            operation,
            workspace,
            vars,
            var_file,
        } => {
            let variables = collect_variables(var_file.as_deref(), &vars)?;
            let request = ProvisioningRequest {
                operation,
                workspace,
                variables,
            };
            cmd_run(&cli.config, request).await
        }
    }
}

fn cmd_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &OrchestratorConfig::default())?;
    println!("{}", path.display());
    Ok(())
}

async fn cmd_run(config_path: &Path, request: ProvisioningRequest) -> Result<i32> {
    let config = load_config(config_path)?;
    let orchestrator = Orchestrator::new(config)?;

    let id = match orchestrator.submit(request) {
        Ok(id) => id,
        Err(SubmitError::Busy(busy)) => {
            eprintln!("{busy}");
            return Ok(exit_codes::BUSY);
        }
        Err(err) => return Err(err.into()),
    };
    eprintln!("job {id}");

    let mut events = orchestrator
        .stream_events(id)
        .context("job disappeared after submission")?;
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                print_event(&event.kind);
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                eprintln!("interrupted, canceling job {id}");
                if let Err(err) = orchestrator.cancel(id) {
                    eprintln!("{err}");
                }
            }
        }
    }

    let snapshot = orchestrator
        .status(id)
        .context("job disappeared after it finished")?;
    if let Some(failure) = &snapshot.failure {
        eprintln!("{}", failure.message);
    }
    Ok(match snapshot.state {
        JobState::Succeeded => exit_codes::OK,
        _ => exit_codes::FAILED,
    })
}

fn print_event(kind: &EventKind) {
    match kind {
        EventKind::Output {
            stream: OutputStream::Stdout,
            line,
        } => println!("{line}"),
        EventKind::Output {
            stream: OutputStream::Stderr,
            line,
        } => eprintln!("{line}"),
        EventKind::Output {
            stream: OutputStream::Notice,
            line,
        } => eprintln!("[provisioner] {line}"),
        EventKind::State { state } => eprintln!("==> {state}"),
    }
}

/// `--var-file` first, then each `--var` on top.
fn collect_variables(var_file: Option<&Path>, vars: &[String]) -> Result<Variables> {
    let mut variables = match var_file {
        Some(path) => {
            let raw =
                fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str::<Variables>(&raw)
                .with_context(|| format!("{} must hold a JSON object", path.display()))?
        }
        None => Variables::new(),
    };
    for var in vars {
        let (name, value) = parse_var(var)?;
        variables.insert(name, value);
    }
    Ok(variables)
}

fn parse_var(raw: &str) -> Result<(String, Value)> {
    let Some((name, value)) = raw.split_once('=') else {
        bail!("--var {raw:?} must look like NAME=VALUE");
    };
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.trim().to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn var_values_prefer_json() {
        assert_eq!(parse_var("replicas=3").expect("parse").1, json!(3));
        assert_eq!(parse_var("public=true").expect("parse").1, json!(true));
        assert_eq!(parse_var("tags=[\"a\"]").expect("parse").1, json!(["a"]));
        assert_eq!(parse_var("name=web").expect("parse").1, json!("web"));
        assert_eq!(parse_var("cidr=10.0.0.0/16").expect("parse").1, json!("10.0.0.0/16"));
        assert_eq!(parse_var("empty=").expect("parse").1, json!(""));
        assert!(parse_var("novalue").is_err());
    }

    #[test]
    fn cli_vars_override_var_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = temp.path().join("vars.json");
        fs::write(&file, r#"{"region": "us-east-1", "instance_type": "t3.micro"}"#).expect("write");

        let vars =
            collect_variables(Some(&file), &["region=eu-west-1".to_string()]).expect("collect");
        assert_eq!(vars["region"], json!("eu-west-1"));
        assert_eq!(vars["instance_type"], json!("t3.micro"));
    }

    #[test]
    fn cli_parses_run_command() {
        let cli = Cli::try_parse_from([
            "provisioner",
            "--config",
            "p.toml",
            "run",
            "apply",
            "--workspace",
            "dev",
            "--var",
            "a=1",
        ])
        .expect("parse");
        let Command::Run {
            operation,
            workspace,
            vars,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(operation, OperationKind::Apply);
        assert_eq!(workspace, "dev");
        assert_eq!(vars, ["a=1"]);
    }
}
