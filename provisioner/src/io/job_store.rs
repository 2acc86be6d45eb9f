//! Durable job records under `<state_dir>/jobs/`.
//!
//! Each finished job leaves `<id>.json` (its final [`JobSnapshot`]) and
//! `<id>.log` (captured output, one line per output event). Records are
//! written once, at the terminal transition; the in-memory table is the
//! source of truth while the process is alive.

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::{EventKind, JobEvent, JobId, JobSnapshot, OutputStream};
use crate::io::atomic::write_atomic;

#[derive(Debug, Clone)]
pub struct JobStore {
    dir: PathBuf,
}

impl JobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn record_path(&self, id: JobId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn log_path(&self, id: JobId) -> PathBuf {
        self.dir.join(format!("{id}.log"))
    }

    /// Atomically write the job record.
    pub fn persist(&self, snapshot: &JobSnapshot) -> Result<()> {
        let path = self.record_path(snapshot.id);
        let mut buf = serde_json::to_string_pretty(snapshot).context("serialize job record")?;
        buf.push('\n');
        write_atomic(&path, buf.as_bytes())
            .with_context(|| format!("write job record {}", path.display()))?;
        debug!(job_id = %snapshot.id, path = %path.display(), "job record persisted");
        Ok(())
    }

    /// Write the job's output lines as plain text. Stderr and notice lines are
    /// prefixed so the log stays readable on its own.
    pub fn write_log(&self, id: JobId, events: &[JobEvent]) -> Result<()> {
        let path = self.log_path(id);
        let text = format_log(events);
        write_atomic(&path, text.as_bytes())
            .with_context(|| format!("write job log {}", path.display()))?;
        Ok(())
    }

    /// Read a persisted output log, `None` when none was written.
    pub fn read_log(&self, id: JobId) -> Result<Option<String>> {
        let path = self.log_path(id);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read job log {}", path.display())),
        }
    }

    /// Load a persisted record, `None` when the job never finished here.
    pub fn load(&self, id: JobId) -> Result<Option<JobSnapshot>> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let snapshot = serde_json::from_str(&contents)
            .with_context(|| format!("parse job record {}", path.display()))?;
        Ok(Some(snapshot))
    }
}

/// Output lines as plain text, the format of `<id>.log`.
pub fn format_log(events: &[JobEvent]) -> String {
    let mut out = String::new();
    for event in events {
        let EventKind::Output { stream, line } = &event.kind else {
            continue;
        };
        let prefix = match stream {
            OutputStream::Stdout => "",
            OutputStream::Stderr => "[stderr] ",
            OutputStream::Notice => "[provisioner] ",
        };
        let _ = writeln!(out, "{prefix}{line}");
    }
    out
}
