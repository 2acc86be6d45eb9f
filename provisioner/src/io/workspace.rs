//! Workspace directories: one isolated working directory per environment id.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, info};

use crate::io::atomic::write_atomic;

/// Local state artifact written by the tool. Never parsed, only checked for presence.
pub const STATE_FILE: &str = "terraform.tfstate";
/// Directory created by `init`.
pub const INIT_DIR: &str = ".terraform";
/// Backend settings recorded by `init` under [`INIT_DIR`]. Present only when the
/// root module configures a backend, whose state may live outside the workspace.
pub const BACKEND_FILE: &str = "terraform.tfstate";

const PROBE_FILE: &str = ".provisioner-probe";
const MAX_ID_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("invalid workspace id {0:?}: expected 1-64 characters from [A-Za-z0-9_-]")]
    InvalidId(String),
    #[error("cannot initialize workspace {id} at {}: {source}", path.display())]
    Init {
        id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Workspace ids become directory names, so they must be a single safe path segment.
pub fn validate_workspace_id(id: &str) -> Result<(), WorkspaceError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(WorkspaceError::InvalidId(id.to_string()))
    }
}

/// Maps workspace ids to directories under `root`, creating them lazily.
///
/// Creation happens while holding the internal map lock, so concurrent
/// `resolve` calls for the same id observe exactly one initialization.
#[derive(Debug)]
pub struct WorkspaceStore {
    root: PathBuf,
    template_dir: Option<PathBuf>,
    input_file_name: String,
    initialized: Mutex<HashMap<String, PathBuf>>,
}

impl WorkspaceStore {
    pub fn new(
        root: impl Into<PathBuf>,
        template_dir: Option<PathBuf>,
        input_file_name: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            template_dir,
            input_file_name: input_file_name.into(),
            initialized: Mutex::new(HashMap::new()),
        }
    }

    /// Directory for `id` without creating it.
    pub fn dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn input_path(&self, id: &str) -> PathBuf {
        self.dir(id).join(&self.input_file_name)
    }

    /// Return the workspace directory, creating and seeding it on first use.
    pub fn resolve(&self, id: &str) -> Result<PathBuf, WorkspaceError> {
        validate_workspace_id(id)?;
        let mut initialized = self
            .initialized
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(dir) = initialized.get(id) {
            return Ok(dir.clone());
        }

        let dir = self.dir(id);
        self.initialize(&dir).map_err(|source| WorkspaceError::Init {
            id: id.to_string(),
            path: dir.clone(),
            source,
        })?;
        info!(workspace = id, dir = %dir.display(), "workspace ready");
        initialized.insert(id.to_string(), dir.clone());
        Ok(dir)
    }

    fn initialize(&self, dir: &Path) -> std::io::Result<()> {
        fs::create_dir_all(dir)?;
        // Creating a directory succeeds on read-only mounts when it already exists.
        let probe = dir.join(PROBE_FILE);
        fs::write(&probe, b"")?;
        fs::remove_file(&probe)?;
        if let Some(template) = &self.template_dir {
            seed_from_template(template, dir)?;
        }
        Ok(())
    }

    /// Atomically write the rendered input file into a resolved workspace.
    pub fn write_input(&self, id: &str, contents: &str) -> Result<PathBuf, WorkspaceError> {
        let path = self.input_path(id);
        write_atomic(&path, contents.as_bytes()).map_err(|source| WorkspaceError::Init {
            id: id.to_string(),
            path: path.clone(),
            source,
        })?;
        debug!(
            workspace = id,
            path = %path.display(),
            bytes = contents.len(),
            "input file written"
        );
        Ok(path)
    }

    /// True when the tool has left a non-empty local state file.
    pub fn has_state(&self, id: &str) -> bool {
        fs::metadata(self.dir(id).join(STATE_FILE))
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }

    /// True when `init` recorded a configured backend.
    pub fn has_backend(&self, id: &str) -> bool {
        fs::metadata(self.dir(id).join(INIT_DIR).join(BACKEND_FILE))
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }

    /// False only when nothing indicates managed infrastructure: no local
    /// state and no backend that could hold it remotely.
    pub fn may_have_state(&self, id: &str) -> bool {
        self.has_state(id) || self.has_backend(id)
    }

    pub fn is_initialized(&self, id: &str) -> bool {
        self.dir(id).join(INIT_DIR).is_dir()
    }
}

/// Copy top-level files of the template into `dir`, never overwriting.
fn seed_from_template(template: &Path, dir: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(template)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let target = dir.join(entry.file_name());
        if target.exists() {
            continue;
        }
        fs::copy(entry.path(), &target)?;
        debug!(file = %target.display(), "seeded from template");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store(root: &Path) -> WorkspaceStore {
        WorkspaceStore::new(root.join("workspaces"), None, "terraform.tfvars")
    }

    #[test]
    fn resolve_creates_directory_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());

        let first = store.resolve("w1").expect("resolve");
        assert!(first.is_dir());
        fs::write(first.join("marker"), "x").expect("marker");
        let second = store.resolve("w1").expect("resolve again");
        assert_eq!(first, second);
        assert!(second.join("marker").exists());
    }

    #[test]
    fn concurrent_resolve_yields_one_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(store(temp.path()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.resolve("shared").expect("resolve"))
            })
            .collect();
        let dirs: Vec<PathBuf> = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect();

        assert!(dirs.iter().all(|d| d == &dirs[0]));
        let count = fs::read_dir(temp.path().join("workspaces"))
            .expect("read dir")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn rejects_path_like_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        for id in ["", "../w1", "a/b", "a b", ".hidden"] {
            assert!(
                matches!(store.resolve(id), Err(WorkspaceError::InvalidId(_))),
                "{id:?} should be rejected"
            );
        }
        assert!(validate_workspace_id(&"x".repeat(65)).is_err());
        assert!(validate_workspace_id("prod_us-east-1").is_ok());
    }

    #[test]
    fn unwritable_root_is_an_init_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        // A regular file where the workspaces root should be.
        let blocker = temp.path().join("workspaces");
        fs::write(&blocker, "not a dir").expect("blocker");
        let store = store(temp.path());

        let err = store.resolve("w1").unwrap_err();
        assert!(matches!(err, WorkspaceError::Init { ref id, .. } if id == "w1"));
    }

    #[test]
    fn seeds_template_without_overwriting() {
        let temp = tempfile::tempdir().expect("tempdir");
        let template = temp.path().join("module");
        fs::create_dir_all(template.join("nested")).expect("template");
        fs::write(template.join("main.tf"), "resource {}").expect("main.tf");
        fs::write(template.join("variables.tf"), "variable {}").expect("variables.tf");

        let ws_root = temp.path().join("workspaces");
        fs::create_dir_all(ws_root.join("w1")).expect("ws");
        fs::write(ws_root.join("w1").join("main.tf"), "custom").expect("custom");

        let store = WorkspaceStore::new(&ws_root, Some(template), "terraform.tfvars");
        let dir = store.resolve("w1").expect("resolve");

        assert_eq!(fs::read_to_string(dir.join("main.tf")).expect("read"), "custom");
        assert!(dir.join("variables.tf").is_file());
        assert!(!dir.join("nested").exists());
    }

    #[test]
    fn state_and_init_detection() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let dir = store.resolve("w1").expect("resolve");
        assert!(!store.has_state("w1"));
        assert!(!store.is_initialized("w1"));

        fs::write(dir.join(STATE_FILE), "").expect("empty state");
        assert!(!store.has_state("w1"));
        fs::write(dir.join(STATE_FILE), "{}").expect("state");
        fs::create_dir(dir.join(INIT_DIR)).expect("init dir");
        assert!(store.has_state("w1"));
        assert!(store.is_initialized("w1"));
    }

    #[test]
    fn recorded_backend_counts_as_possible_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let dir = store.resolve("prod").expect("resolve");
        fs::create_dir(dir.join(INIT_DIR)).expect("init dir");
        assert!(!store.may_have_state("prod"));

        fs::write(
            dir.join(INIT_DIR).join(BACKEND_FILE),
            r#"{"version": 3, "backend": {"type": "s3", "config": {"bucket": "tf-state"}}}"#,
        )
        .expect("backend");
        assert!(!store.has_state("prod"));
        assert!(store.has_backend("prod"));
        assert!(store.may_have_state("prod"));
    }

    #[test]
    fn write_input_replaces_contents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.resolve("w1").expect("resolve");
        store.write_input("w1", "a = 1\n").expect("write");
        let path = store.write_input("w1", "a = 2\n").expect("rewrite");
        assert_eq!(fs::read_to_string(path).expect("read"), "a = 2\n");
    }
}
