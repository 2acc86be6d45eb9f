//! Captured root-module outputs, one JSON file per workspace.
//!
//! After a successful `apply` the tool's `output -json` is reduced to
//! `{name: value}` and stored at `<state_dir>/outputs/<workspace>.json`. When
//! capture fails, the file holds `{"error": ..., "stderr": ...}` instead so
//! readers can tell a failed capture from a workspace with no outputs.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::io::atomic::write_atomic;

#[derive(Debug, Clone)]
pub struct OutputsStore {
    dir: PathBuf,
}

impl OutputsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, workspace: &str) -> PathBuf {
        self.dir.join(format!("{workspace}.json"))
    }

    pub fn read(&self, workspace: &str) -> Result<Option<Value>> {
        let path = self.path(workspace);
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let value = serde_json::from_str(&contents)
            .with_context(|| format!("parse outputs {}", path.display()))?;
        Ok(Some(value))
    }

    /// Parse raw `output -json` text and store the simplified map.
    pub fn write_simplified(&self, workspace: &str, raw: &str) -> Result<Value> {
        let parsed: Value = serde_json::from_str(raw.trim()).context("parse output -json")?;
        let simplified = simplify_outputs(&parsed);
        self.write(workspace, &simplified)?;
        Ok(simplified)
    }

    pub fn write_error(&self, workspace: &str, message: &str, stderr: &str) -> Result<()> {
        self.write(workspace, &json!({ "error": message, "stderr": stderr }))
    }

    /// Remove the workspace's outputs. Missing files are fine.
    pub fn clear(&self, workspace: &str) -> Result<()> {
        let path = self.path(workspace);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(workspace, "outputs cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }

    fn write(&self, workspace: &str, value: &Value) -> Result<()> {
        let path = self.path(workspace);
        let mut buf = serde_json::to_string_pretty(value).context("serialize outputs")?;
        buf.push('\n');
        write_atomic(&path, buf.as_bytes())
            .with_context(|| format!("write outputs {}", path.display()))?;
        debug!(workspace, path = %path.display(), "outputs written");
        Ok(())
    }
}

/// `{"name": {"value": v, "type": t, "sensitive": s}}` becomes `{"name": v}`.
/// Entries without a `value` key are kept as they are.
pub fn simplify_outputs(raw: &Value) -> Value {
    let Value::Object(entries) = raw else {
        return raw.clone();
    };
    let simplified: Map<String, Value> = entries
        .iter()
        .map(|(name, entry)| {
            let value = entry.get("value").cloned().unwrap_or_else(|| entry.clone());
            (name.clone(), value)
        })
        .collect();
    Value::Object(simplified)
}
