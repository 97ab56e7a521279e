//! rocksdb facade for the durable state of a replica.
//!
//! The store can be closed and reopened at runtime: snapshot install swaps
//! the whole directory out underneath it, which requires every file handle
//! to be released first.

use parking_lot::RwLock;
use rocksdb::checkpoint::Checkpoint;
use rocksdb::{DBCompressionType, Direction, IteratorMode, Options, DB};
use std::path::{Path, PathBuf};

use crate::error::{Result, ServerError};

pub struct Store {
    state_dir: PathBuf,
    db: RwLock<Option<DB>>,
}

impl Store {
    fn db_options() -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(DBCompressionType::Lz4);
        opts
    }

    /// Open (or create) the store under `state_dir`.
    pub fn open<P: AsRef<Path>>(state_dir: P) -> Result<Store> {
        let state_dir = state_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&state_dir)?;
        let db = DB::open(&Store::db_options(), &state_dir)?;
        Ok(Store {
            state_dir,
            db: RwLock::new(Some(db)),
        })
    }

    /// Release every file handle so the directory can be deleted or
    /// replaced. Data operations fail until `reopen` is called.
    pub fn close(&self) {
        let mut guard = self.db.write();
        *guard = None;
    }

    /// Re-open the database at the same state directory, creating it if the
    /// directory was wiped.
    pub fn reopen(&self) -> Result<()> {
        let mut guard = self.db.write();
        std::fs::create_dir_all(&self.state_dir)?;
        *guard = Some(DB::open(&Store::db_options(), &self.state_dir)?);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.db.read().is_some()
    }

    pub fn state_dir_path(&self) -> &Path {
        &self.state_dir
    }

    pub fn insert(&self, key: &str, value: &[u8]) -> Result<()> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(ServerError::StoreClosed)?;
        db.put(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(ServerError::StoreClosed)?;
        Ok(db.get(key.as_bytes())?)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(ServerError::StoreClosed)?;
        db.delete(key.as_bytes())?;
        Ok(())
    }

    /// All `(key, value)` pairs whose key starts with `prefix`, in key
    /// order.
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(ServerError::StoreClosed)?;
        let mut out = Vec::new();
        let iter = db.iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            out.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
        }
        Ok(out)
    }

    /// Create a consistent checkpoint of the live database at `dst`.
    /// Checkpoints hard-link immutable files where the filesystem permits.
    /// The read guard keeps the database alive for the duration.
    pub fn create_checkpoint(&self, dst: &Path) -> Result<()> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(ServerError::StoreClosed)?;
        let checkpoint = Checkpoint::new(db)?;
        checkpoint.create_checkpoint(dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_insert_get_remove() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("state")).unwrap();

        store.insert("k1", b"v1").unwrap();
        assert_eq!(store.get("k1").unwrap(), Some(b"v1".to_vec()));

        store.remove("k1").unwrap();
        assert_eq!(store.get("k1").unwrap(), None);
    }

    #[test]
    fn test_scan_prefix_is_bounded() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("state")).unwrap();

        store.insert("a/1", b"1").unwrap();
        store.insert("a/2", b"2").unwrap();
        store.insert("b/1", b"3").unwrap();

        let hits = store.scan_prefix("a/").unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "a/1");
        assert_eq!(hits[1].0, "a/2");
    }

    #[test]
    fn test_close_releases_and_reopen_restores() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("state")).unwrap();
        store.insert("k", b"v").unwrap();

        store.close();
        assert!(!store.is_open());
        assert!(matches!(store.get("k"), Err(ServerError::StoreClosed)));

        store.reopen().unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_close_allows_directory_replacement() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state");
        let store = Store::open(&state).unwrap();
        store.insert("k", b"old").unwrap();
        store.close();

        std::fs::remove_dir_all(&state).unwrap();
        store.reopen().unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_checkpoint_captures_live_data() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("state")).unwrap();
        store.insert("doc/1", b"{\"id\":\"1\"}").unwrap();

        let cp = dir.path().join("cp");
        store.create_checkpoint(&cp).unwrap();

        let restored = Store::open(&cp).unwrap();
        assert_eq!(restored.get("doc/1").unwrap(), Some(b"{\"id\":\"1\"}".to_vec()));
    }
}
