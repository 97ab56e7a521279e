//! Snapshot directory layout and file plumbing.
//!
//! A snapshot generation lives under `raft_dir/snapshot/<index>/` and holds
//! a `db_snapshot/` directory with the store checkpoint plus a metadata
//! file written by the log storage. Saves are staged under a dot-directory
//! and renamed into place, so a half-written snapshot is never picked up.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Name of the checkpoint directory inside a snapshot generation.
pub const DB_SNAPSHOT_DIR: &str = "db_snapshot";

/// Handed to the state machine when a snapshot save starts. The state
/// machine checkpoints into `path()` and registers every written file.
pub struct SnapshotWriter {
    dir: PathBuf,
    files: Vec<String>,
}

impl SnapshotWriter {
    pub fn new(dir: PathBuf) -> io::Result<SnapshotWriter> {
        fs::create_dir_all(&dir)?;
        Ok(SnapshotWriter {
            dir,
            files: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Record a file, relative to the snapshot root, in the manifest.
    pub fn add_file(&mut self, relative: &str) {
        self.files.push(relative.to_string());
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn into_files(self) -> Vec<String> {
        self.files
    }
}

/// Read side of an installed or freshly loaded snapshot generation.
pub struct SnapshotReader {
    dir: PathBuf,
}

impl SnapshotReader {
    pub fn new(dir: PathBuf) -> SnapshotReader {
        SnapshotReader { dir }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn db_snapshot_path(&self) -> PathBuf {
        self.dir.join(DB_SNAPSHOT_DIR)
    }
}

/// Names of the regular files directly inside `dir`, sorted.
pub fn list_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Copy a directory tree, hard-linking regular files where the filesystem
/// permits and falling back to a byte copy.
pub fn copy_dir(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&from, &to)?;
        } else if fs::hard_link(&from, &to).is_err() {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writer_tracks_manifest() {
        let dir = TempDir::new().unwrap();
        let mut writer = SnapshotWriter::new(dir.path().join("snap")).unwrap();
        assert!(writer.path().exists());

        writer.add_file("db_snapshot/000001.sst");
        writer.add_file("db_snapshot/CURRENT");
        assert_eq!(writer.files().len(), 2);
    }

    #[test]
    fn test_copy_dir_replicates_contents() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.sst"), b"alpha").unwrap();
        fs::write(src.join("nested/b.sst"), b"beta").unwrap();

        let dst = dir.path().join("dst");
        copy_dir(&src, &dst).unwrap();

        assert_eq!(fs::read(dst.join("a.sst")).unwrap(), b"alpha");
        assert_eq!(fs::read(dst.join("nested/b.sst")).unwrap(), b"beta");
    }

    #[test]
    fn test_list_files_skips_directories() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b"), b"2").unwrap();
        fs::write(dir.path().join("a"), b"1").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        assert_eq!(list_files(dir.path()).unwrap(), vec!["a", "b"]);
    }
}
