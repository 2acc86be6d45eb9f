//! Temp-file-and-rename writes shared by every persisted artifact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Atomically replace `path` with `contents`.
///
/// The temp file lives next to the target so the final rename never crosses a
/// filesystem. On any failure the temp file is removed and the previous
/// contents of `path` stay untouched.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent)?;
    let tmp_path = tmp_path_for(parent, path);

    let result = (|| {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn tmp_path_for(parent: &Path, path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    parent.join(format!(".{name}.tmp-{}-{n}", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_existing_file_and_leaves_no_temp() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("terraform.tfvars");
        fs::write(&path, "old").expect("seed");

        write_atomic(&path, b"new\n").expect("write");

        assert_eq!(fs::read_to_string(&path).expect("read"), "new\n");
        let entries: Vec<_> = fs::read_dir(temp.path())
            .expect("read dir")
            .flatten()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn failed_write_keeps_previous_contents() {
        let temp = tempfile::tempdir().expect("tempdir");
        // Renaming a file over a directory fails, which exercises the cleanup path.
        let path = temp.path().join("occupied");
        fs::create_dir(&path).expect("dir");
        fs::write(path.join("keep"), "x").expect("seed");

        assert!(write_atomic(&path, b"data").is_err());
        assert!(path.is_dir());
        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .expect("read dir")
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
