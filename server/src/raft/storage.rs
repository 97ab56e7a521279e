//! Persistent raft storage: segment files for the log, a small meta file
//! for hard/conf state, and snapshot generations.
//!
//! `MemStorage` stays the hot copy the raft runtime reads from; everything
//! appended or installed is mirrored to disk so a restart rebuilds the same
//! state. Layout under the raft directory:
//!
//! ```text
//! log/segment_<first>.log     length-prefixed entry records
//! meta/raft_meta              hard state + conf state (bincode)
//! snapshot/<index>/           one generation: SNAPSHOT_META + db_snapshot/
//! ```

use log::{debug, warn};
use prost::bytes::Bytes;
use protobuf::Message;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::{storage::MemStorage, GetEntriesContext, RaftState, Storage, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, ServerError};
use crate::raft::segment::Segment;
use crate::raft::snapshot::{list_files, DB_SNAPSHOT_DIR};

const LOG_DIR: &str = "log";
const META_DIR: &str = "meta";
const SNAPSHOT_DIR: &str = "snapshot";
const META_FILE: &str = "raft_meta";
const SNAPSHOT_META_FILE: &str = "SNAPSHOT_META";
const STAGING_DIR: &str = ".staging";

/// Records per segment before rolling over to a new file.
const SEGMENT_SPAN: usize = 10_000;

/// Durable copy of the volatile raft state.
#[derive(Debug, Default, Serialize, Deserialize)]
struct MetaRecord {
    term: u64,
    vote: u64,
    commit: u64,
    voters: Vec<u64>,
    learners: Vec<u64>,
}

/// Metadata of one snapshot generation, stored next to the checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub index: u64,
    pub term: u64,
    pub voters: Vec<u64>,
    pub learners: Vec<u64>,
    /// Checkpoint files relative to the generation directory.
    pub files: Vec<String>,
}

/// Wire form of a snapshot shipped to a lagging or joining peer: the
/// metadata plus the checkpoint file contents.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotPayload {
    meta: SnapshotMeta,
    files: Vec<(String, Vec<u8>)>,
}

pub struct FileStorage {
    mem: MemStorage,
    segments: BTreeMap<u64, Segment>,
    base: PathBuf,
    snapshot_index: u64,
    snapshot_term: u64,
}

impl FileStorage {
    fn log_dir(base: &Path) -> PathBuf {
        base.join(LOG_DIR)
    }

    fn meta_path(base: &Path) -> PathBuf {
        base.join(META_DIR).join(META_FILE)
    }

    pub fn snapshot_root(base: &Path) -> PathBuf {
        base.join(SNAPSHOT_DIR)
    }

    /// Whether any completed snapshot generation exists under `base`.
    pub fn snapshot_exists(base: &Path) -> bool {
        FileStorage::latest_generation(base).is_some()
    }

    fn latest_generation(base: &Path) -> Option<(u64, PathBuf)> {
        let root = FileStorage::snapshot_root(base);
        let entries = fs::read_dir(&root).ok()?;
        let mut best: Option<(u64, PathBuf)> = None;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Ok(index) = name.parse::<u64>() {
                if entry.path().join(SNAPSHOT_META_FILE).is_file()
                    && best.as_ref().map(|(b, _)| index > *b).unwrap_or(true)
                {
                    best = Some((index, entry.path()));
                }
            }
        }
        best
    }

    fn read_snapshot_meta(dir: &Path) -> Result<SnapshotMeta> {
        let bytes = fs::read(dir.join(SNAPSHOT_META_FILE))?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Open the storage, replaying whatever survives on disk. On a fresh
    /// directory the configuration is bootstrapped from `initial_voters`,
    /// the same way on every member so any of them can campaign.
    pub fn new(base: &Path, initial_voters: &[u64]) -> Result<FileStorage> {
        fs::create_dir_all(FileStorage::log_dir(base))?;
        fs::create_dir_all(base.join(META_DIR))?;
        fs::create_dir_all(FileStorage::snapshot_root(base))?;

        let mem = MemStorage::new();
        let mut storage = FileStorage {
            mem,
            segments: BTreeMap::new(),
            base: base.to_path_buf(),
            snapshot_index: 0,
            snapshot_term: 0,
        };

        // Newest snapshot generation anchors the log; otherwise bootstrap
        // the initial configuration at a synthetic (1, 1) snapshot.
        let mut boot = Snapshot::default();
        if let Some((index, dir)) = FileStorage::latest_generation(base) {
            let meta = FileStorage::read_snapshot_meta(&dir)?;
            boot.mut_metadata().index = meta.index;
            boot.mut_metadata().term = meta.term;
            boot.mut_metadata().mut_conf_state().voters = meta.voters.clone();
            boot.mut_metadata().mut_conf_state().learners = meta.learners.clone();
            storage.snapshot_index = index;
            storage.snapshot_term = meta.term;
        } else {
            boot.mut_metadata().index = 1;
            boot.mut_metadata().term = 1;
            boot.mut_metadata().mut_conf_state().voters = initial_voters.to_vec();
            storage.snapshot_index = 1;
            storage.snapshot_term = 1;
        }
        storage
            .mem
            .wl()
            .apply_snapshot(boot)
            .map_err(|e| ServerError::NodeInit(format!("bad snapshot state: {}", e)))?;

        // Meta file overrides the conf state when conf changes happened
        // after the snapshot.
        if let Ok(bytes) = fs::read(FileStorage::meta_path(base)) {
            let meta: MetaRecord = bincode::deserialize(&bytes)?;
            let mut hs = HardState::default();
            hs.term = meta.term;
            hs.vote = meta.vote;
            // The commit index can never sit behind the snapshot.
            hs.commit = meta.commit.max(storage.snapshot_index);
            storage.mem.wl().set_hardstate(hs);
            let mut cs = ConfState::default();
            cs.voters = meta.voters;
            cs.learners = meta.learners;
            storage.mem.wl().set_conf_state(cs);
        }

        storage.load_segments()?;
        Ok(storage)
    }

    fn load_segments(&mut self) -> Result<()> {
        let mut firsts = Vec::new();
        for entry in fs::read_dir(FileStorage::log_dir(&self.base))?.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(first) = name
                .strip_prefix("segment_")
                .and_then(|s| s.strip_suffix(".log"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                firsts.push(first);
            }
        }
        firsts.sort_unstable();

        let mut entries = Vec::new();
        for first in firsts {
            let path = FileStorage::log_dir(&self.base).join(format!("segment_{}.log", first));
            let mut segment = Segment::open(&path, first)?;
            for index in segment.first_index()..=segment.last_index() {
                if index <= self.snapshot_index {
                    continue;
                }
                let bytes = segment.read(index)?;
                let mut entry = Entry::default();
                entry
                    .merge_from_bytes(&bytes)
                    .map_err(|e| ServerError::NodeInit(format!("corrupt log entry: {}", e)))?;
                entries.push(entry);
            }
            self.segments.insert(first, segment);
        }

        if !entries.is_empty() {
            self.mem
                .wl()
                .append(&entries)
                .map_err(|e| ServerError::NodeInit(format!("log replay failed: {}", e)))?;
        }
        Ok(())
    }

    fn persist_meta(&self) -> raft::Result<()> {
        let state = self.mem.initial_state()?;
        let record = MetaRecord {
            term: state.hard_state.term,
            vote: state.hard_state.vote,
            commit: state.hard_state.commit,
            voters: state.conf_state.voters.clone(),
            learners: state.conf_state.learners.clone(),
        };
        let bytes = bincode::serialize(&record)
            .map_err(|e| raft::Error::Store(StorageError::Other(Box::new(e))))?;
        let path = FileStorage::meta_path(&self.base);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes).map_err(store_io)?;
        fs::rename(&tmp, &path).map_err(store_io)?;
        Ok(())
    }

    /// Append freshly persisted entries, truncating any conflicting tail
    /// first. Mirrored into memory and segment files.
    pub fn append_entries(&mut self, entries: &[Entry]) -> raft::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.mem.wl().append(entries)?;

        self.truncate_log_from(entries[0].index).map_err(store_io)?;
        for entry in entries {
            let bytes = entry
                .write_to_bytes()
                .map_err(|e| raft::Error::Store(StorageError::Other(Box::new(e))))?;
            self.append_record(entry.index, &bytes).map_err(store_io)?;
        }
        Ok(())
    }

    fn append_record(&mut self, index: u64, bytes: &[u8]) -> std::io::Result<()> {
        let roll_over = match self.segments.values().next_back() {
            None => true,
            Some(seg) => seg.len() >= SEGMENT_SPAN || seg.next_index() != index,
        };
        if roll_over {
            let path = FileStorage::log_dir(&self.base).join(format!("segment_{}.log", index));
            let segment = Segment::open(&path, index)?;
            self.segments.insert(index, segment);
        }
        let segment = self
            .segments
            .values_mut()
            .next_back()
            .expect("segment just ensured");
        segment.append(index, bytes)
    }

    fn truncate_log_from(&mut self, index: u64) -> std::io::Result<()> {
        let doomed: Vec<u64> = self
            .segments
            .keys()
            .copied()
            .filter(|first| *first >= index)
            .collect();
        for first in doomed {
            if let Some(segment) = self.segments.remove(&first) {
                segment.delete()?;
            }
        }
        if let Some(segment) = self.segments.values_mut().next_back() {
            segment.truncate_from(index)?;
        }
        Ok(())
    }

    /// Drop segments fully covered by a snapshot at `index`.
    fn prune_segments(&mut self, index: u64) {
        let spent: Vec<u64> = self
            .segments
            .iter()
            .filter(|(_, seg)| seg.last_index() <= index)
            .map(|(first, _)| *first)
            .collect();
        for first in spent {
            if let Some(segment) = self.segments.remove(&first) {
                if let Err(e) = segment.delete() {
                    warn!("could not delete spent segment: {}", e);
                }
            }
        }
    }

    pub fn set_hardstate(&mut self, hs: HardState) -> raft::Result<()> {
        self.mem.wl().set_hardstate(hs);
        self.persist_meta()
    }

    pub fn set_conf_state(&mut self, cs: ConfState) -> raft::Result<()> {
        self.mem.wl().set_conf_state(cs);
        self.persist_meta()
    }

    pub fn set_commit(&mut self, commit: u64) -> raft::Result<()> {
        self.mem.wl().mut_hard_state().set_commit(commit);
        self.persist_meta()
    }

    /// Overwrite the configuration unconditionally. This is the unsafe
    /// half of a single-node address change; the caller rebuilds the raft
    /// instance afterwards.
    pub fn reset_conf_state(&mut self, voters: Vec<u64>) -> raft::Result<()> {
        let mut cs = ConfState::default();
        cs.voters = voters;
        self.mem.wl().set_conf_state(cs);
        self.persist_meta()
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn staging_dir(&self) -> PathBuf {
        FileStorage::snapshot_root(&self.base).join(STAGING_DIR)
    }

    pub fn latest_snapshot_dir(&self) -> Option<PathBuf> {
        FileStorage::latest_generation(&self.base).map(|(_, dir)| dir)
    }

    /// Promote the staged checkpoint to a completed generation: write its
    /// metadata, rename into place, drop older generations and compact the
    /// log behind it.
    pub fn finalize_snapshot(&mut self, meta: SnapshotMeta) -> Result<()> {
        let staging = self.staging_dir();
        let bytes = bincode::serialize(&meta)?;
        fs::write(staging.join(SNAPSHOT_META_FILE), &bytes)?;

        let final_dir = FileStorage::snapshot_root(&self.base).join(meta.index.to_string());
        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)?;
        }
        fs::rename(&staging, &final_dir)?;

        // Older generations are superseded.
        if let Ok(entries) = fs::read_dir(FileStorage::snapshot_root(&self.base)) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Ok(index) = name.parse::<u64>() {
                    if index < meta.index {
                        let _ = fs::remove_dir_all(entry.path());
                    }
                }
            }
        }

        if let Err(e) = self.mem.wl().compact(meta.index) {
            debug!("log already compacted to {}: {}", meta.index, e);
        }
        self.prune_segments(meta.index);
        self.snapshot_index = meta.index;
        self.snapshot_term = meta.term;
        self.persist_meta()
            .map_err(|e| ServerError::Snapshot(e.to_string()))?;
        Ok(())
    }

    /// Install a snapshot received from the leader: materialize the
    /// checkpoint files as a local generation and reset the log behind it.
    /// Returns the generation directory for the state machine to load.
    pub fn install_snapshot(&mut self, snapshot: &Snapshot) -> Result<PathBuf> {
        let payload: SnapshotPayload = bincode::deserialize(snapshot.get_data())?;
        let index = snapshot.get_metadata().index;
        let gen_dir = FileStorage::snapshot_root(&self.base).join(index.to_string());
        if gen_dir.exists() {
            fs::remove_dir_all(&gen_dir)?;
        }
        fs::create_dir_all(gen_dir.join(DB_SNAPSHOT_DIR))?;

        for (name, bytes) in &payload.files {
            let target = gen_dir.join(name);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, bytes)?;
        }
        let meta_bytes = bincode::serialize(&payload.meta)?;
        fs::write(gen_dir.join(SNAPSHOT_META_FILE), &meta_bytes)?;

        self.mem
            .wl()
            .apply_snapshot(snapshot.clone())
            .map_err(|e| ServerError::Snapshot(format!("apply failed: {}", e)))?;
        self.prune_segments(index);
        self.snapshot_index = index;
        self.snapshot_term = snapshot.get_metadata().term;
        self.persist_meta()
            .map_err(|e| ServerError::Snapshot(e.to_string()))?;
        Ok(gen_dir)
    }

    /// Build the wire snapshot from the newest completed generation.
    fn disk_snapshot(&self) -> Option<Snapshot> {
        let (_, dir) = FileStorage::latest_generation(&self.base)?;
        let meta = FileStorage::read_snapshot_meta(&dir).ok()?;

        let db_dir = dir.join(DB_SNAPSHOT_DIR);
        let mut files = Vec::new();
        for name in list_files(&db_dir).ok()? {
            let bytes = fs::read(db_dir.join(&name)).ok()?;
            files.push((format!("{}/{}", DB_SNAPSHOT_DIR, name), bytes));
        }

        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().index = meta.index;
        snapshot.mut_metadata().term = meta.term;
        snapshot.mut_metadata().mut_conf_state().voters = meta.voters.clone();
        snapshot.mut_metadata().mut_conf_state().learners = meta.learners.clone();
        let payload = SnapshotPayload { meta, files };
        snapshot.set_data(Bytes::from(bincode::serialize(&payload).ok()?));
        Some(snapshot)
    }

    pub fn commit(&self) -> u64 {
        self.mem.rl().hard_state().commit
    }
}

fn store_io(e: std::io::Error) -> raft::Error {
    raft::Error::Store(StorageError::Other(Box::new(e)))
}

impl Storage for FileStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.mem.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem.last_index()
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        match self.disk_snapshot() {
            Some(snapshot) if snapshot.get_metadata().index >= request_index => Ok(snapshot),
            _ => Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.data = data.to_vec().into();
        e
    }

    #[test]
    fn test_bootstrap_carries_initial_voters() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path(), &[1, 2, 3]).unwrap();
        let state = storage.initial_state().unwrap();
        assert_eq!(state.conf_state.voters, vec![1, 2, 3]);
        assert_eq!(storage.snapshot_index(), 1);
    }

    #[test]
    fn test_appended_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut storage = FileStorage::new(dir.path(), &[1]).unwrap();
            storage
                .append_entries(&[entry(2, 1, b"a"), entry(3, 1, b"b")])
                .unwrap();
            let mut hs = HardState::default();
            hs.term = 1;
            hs.commit = 3;
            storage.set_hardstate(hs).unwrap();
        }

        let storage = FileStorage::new(dir.path(), &[1]).unwrap();
        assert_eq!(storage.last_index().unwrap(), 3);
        assert_eq!(storage.commit(), 3);
        let got = storage
            .entries(2, 4, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].data.as_ref(), b"b");
    }

    #[test]
    fn test_conflicting_append_truncates_tail() {
        let dir = TempDir::new().unwrap();
        {
            let mut storage = FileStorage::new(dir.path(), &[1]).unwrap();
            storage
                .append_entries(&[entry(2, 1, b"a"), entry(3, 1, b"b"), entry(4, 1, b"c")])
                .unwrap();
            // A new leader overwrites the tail from index 3.
            storage
                .append_entries(&[entry(3, 2, b"x"), entry(4, 2, b"y")])
                .unwrap();
        }

        let storage = FileStorage::new(dir.path(), &[1]).unwrap();
        let got = storage
            .entries(3, 5, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(got[0].term, 2);
        assert_eq!(got[0].data.as_ref(), b"x");
        assert_eq!(got[1].data.as_ref(), b"y");
    }

    #[test]
    fn test_finalize_snapshot_compacts_and_is_found_on_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut storage = FileStorage::new(dir.path(), &[1]).unwrap();
            storage
                .append_entries(&[entry(2, 1, b"a"), entry(3, 1, b"b")])
                .unwrap();

            let staging = storage.staging_dir();
            fs::create_dir_all(staging.join(DB_SNAPSHOT_DIR)).unwrap();
            fs::write(staging.join(DB_SNAPSHOT_DIR).join("000001.sst"), b"kv").unwrap();

            storage
                .finalize_snapshot(SnapshotMeta {
                    index: 3,
                    term: 1,
                    voters: vec![1],
                    learners: vec![],
                    files: vec!["db_snapshot/000001.sst".to_string()],
                })
                .unwrap();
            assert_eq!(storage.snapshot_index(), 3);
        }

        assert!(FileStorage::snapshot_exists(dir.path()));
        let storage = FileStorage::new(dir.path(), &[1]).unwrap();
        assert_eq!(storage.snapshot_index(), 3);
        assert_eq!(storage.first_index().unwrap(), 4);

        let snapshot = storage.snapshot(3, 0).unwrap();
        assert_eq!(snapshot.get_metadata().index, 3);
        let payload: SnapshotPayload = bincode::deserialize(snapshot.get_data()).unwrap();
        assert_eq!(payload.files.len(), 1);
        assert_eq!(payload.files[0].0, "db_snapshot/000001.sst");
    }

    #[test]
    fn test_install_snapshot_materializes_generation() {
        let dir = TempDir::new().unwrap();
        let mut storage = FileStorage::new(dir.path(), &[1, 2]).unwrap();

        let meta = SnapshotMeta {
            index: 9,
            term: 2,
            voters: vec![1, 2],
            learners: vec![],
            files: vec!["db_snapshot/000007.sst".to_string()],
        };
        let payload = SnapshotPayload {
            meta: meta.clone(),
            files: vec![("db_snapshot/000007.sst".to_string(), b"data".to_vec())],
        };
        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().index = 9;
        snapshot.mut_metadata().term = 2;
        snapshot.mut_metadata().mut_conf_state().voters = vec![1, 2];
        snapshot.set_data(Bytes::from(bincode::serialize(&payload).unwrap()));

        let gen_dir = storage.install_snapshot(&snapshot).unwrap();
        assert!(gen_dir.ends_with("9"));
        assert_eq!(
            fs::read(gen_dir.join(DB_SNAPSHOT_DIR).join("000007.sst")).unwrap(),
            b"data"
        );
        assert_eq!(storage.snapshot_index(), 9);
        assert_eq!(storage.first_index().unwrap(), 10);
    }

    #[test]
    fn test_snapshot_unavailable_before_first_save() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path(), &[1]).unwrap();
        assert!(matches!(
            storage.snapshot(1, 0),
            Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable
            ))
        ));
    }
}
