//! The replicated write path: client mutations go in as log entries, come
//! back out committed in the same order on every replica, and are executed
//! by the HTTP worker against the store.
//!
//! Leader: `write` serializes the request and submits it with the term it
//! observed, so a leadership change between submit and apply fails the
//! caller instead of mutating state. Follower: `write` hands the request
//! to the forwarder. The apply loop rendezvouses with the HTTP worker per
//! entry, which keeps log order equal to store mutation order without
//! locking the store.

use log::{error, info, warn};
use parking_lot::RwLock;
use raft::eraftpb::Message;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::codec::{self, LogRecord, WireRequest};
use crate::collections::CollectionManager;
use crate::config::{ClusterConfig, NodeTriple};
use crate::error::{Result, ServerError};
use crate::forward::Forwarder;
use crate::http::{ApiResponse, Channel, MessageDispatcher, SharedRequest, SharedResponse};
use crate::raft::node::{Node, NodeHandle, NodeOptions, STATE_NONE};
use crate::raft::proposal::{Proposal, WriteCompletion};
use crate::raft::snapshot::{copy_dir, list_files, DB_SNAPSHOT_DIR};
use crate::raft::storage::FileStorage;
use crate::raft::{ApplyIter, ReplicaFsm, SnapshotDone, SnapshotReader, SnapshotWriter};
use crate::store::Store;

pub struct ReplicaState {
    store: Arc<Store>,
    collections: Arc<CollectionManager>,
    dispatcher: MessageDispatcher,
    forwarder: Forwarder,
    cluster: Arc<RwLock<ClusterConfig>>,
    local: RwLock<Option<NodeTriple>>,
    node: RwLock<Option<NodeHandle>>,
    /// Term under which this node currently leads; -1 otherwise.
    leader_term: AtomicI64,
    init_readiness_count: Arc<AtomicUsize>,
    create_init_db_snapshot: bool,
    init_snapshot_requested: AtomicBool,
    shut_down: Arc<AtomicBool>,
}

impl ReplicaState {
    pub fn new(
        store: Arc<Store>,
        collections: Arc<CollectionManager>,
        dispatcher: MessageDispatcher,
        forwarder: Forwarder,
        create_init_db_snapshot: bool,
        shut_down: Arc<AtomicBool>,
    ) -> ReplicaState {
        ReplicaState {
            store,
            collections,
            dispatcher,
            forwarder,
            cluster: Arc::new(RwLock::new(ClusterConfig::default())),
            local: RwLock::new(None),
            node: RwLock::new(None),
            leader_term: AtomicI64::new(-1),
            init_readiness_count: Arc::new(AtomicUsize::new(0)),
            create_init_db_snapshot,
            init_snapshot_requested: AtomicBool::new(false),
            shut_down,
        }
    }

    /// Start the peering node. Decides how the store is bootstrapped:
    /// an existing snapshot wins, otherwise the state directory is wiped
    /// and initialized fresh, unless this boot is meant to turn a
    /// pre-existing stand-alone database into the initial snapshot.
    pub fn start(
        self: &Arc<Self>,
        local: NodeTriple,
        election_timeout_ms: u64,
        snapshot_interval_s: u64,
        raft_dir: &Path,
        nodes: &str,
    ) -> Result<(Receiver<Message>, JoinHandle<()>)> {
        let cluster = ClusterConfig::parse(nodes, &local)?;
        let id = cluster.id_of(&local).ok_or_else(|| {
            ServerError::Config(format!(
                "local node {} is not part of the configuration `{}`",
                local, cluster
            ))
        })?;
        info!("starting peering node {} with members {}", id, cluster);

        let snapshot_exists = FileStorage::snapshot_exists(raft_dir);
        if snapshot_exists {
            // The boot-time snapshot load below will initialize the store.
        } else if !self.create_init_db_snapshot {
            info!("no snapshot present, wiping the state dir and starting fresh");
            self.reset_db();
            remove_dir_if_present(self.store.state_dir_path())?;
            self.init_db()?;
        }
        // Otherwise: leave the stand-alone database untouched; the leader
        // path proposes the init-snapshot record after election.

        let opts = NodeOptions {
            id,
            voters: cluster.node_ids(),
            raft_dir: raft_dir.to_path_buf(),
            election_timeout_ms,
            snapshot_interval_s,
        };
        let fsm: Arc<dyn ReplicaFsm> = self.clone();
        let (handle, runner, out_mailbox) = Node::prepare(opts, fsm, self.shut_down.clone())?;

        // Publish the handle before the loop runs so callbacks can reach
        // the node.
        *self.cluster.write() = cluster;
        *self.local.write() = Some(local);
        *self.node.write() = Some(handle);
        let join = runner.spawn();
        Ok((out_mailbox, join))
    }

    /// Submit a mutating request. Leader: replicate through the log and
    /// return immediately, the caller blocks on the response wait-point.
    /// Follower: proxy to the leader.
    pub fn write(&self, req: SharedRequest, res: SharedResponse) {
        let guard = self.node.read();
        let Some(handle) = &*guard else {
            return;
        };

        if !handle.is_leader() {
            return self.follower_write(handle, req, res);
        }

        let record = LogRecord::Write(WireRequest::from_request(&req));
        let data = match codec::encode(&record) {
            Ok(data) => data,
            Err(e) => {
                error!("could not serialize write: {}", e);
                WriteCompletion::new(req, res, self.dispatcher.clone())
                    .fail("Could not serialize write.");
                return;
            }
        };

        // Guard against the term moving between this read and the apply.
        let term = self.leader_term.load(Ordering::Acquire);
        let expected_term = if term >= 0 { term as u64 } else { handle.term() };

        let completion = WriteCompletion::new(req, res, self.dispatcher.clone());
        crate::metrics::WRITE_COUNTER_VEC
            .with_label_values(&["replicated"])
            .inc();
        handle.submit(Proposal::write(data, expected_term, Some(completion)));
    }

    fn follower_write(&self, handle: &NodeHandle, req: SharedRequest, res: SharedResponse) {
        let leader = self.cluster.read().get(handle.leader_id()).cloned();
        crate::metrics::WRITE_COUNTER_VEC
            .with_label_values(&["forwarded"])
            .inc();
        self.forwarder.forward(leader, req, res);
    }

    /// Re-parse a new nodes configuration and reconcile membership.
    pub fn refresh_nodes(&self, nodes: &str) -> Result<()> {
        let guard = self.node.read();
        let Some(handle) = &*guard else {
            warn!("node is not initialized: unable to refresh nodes");
            return Ok(());
        };
        let local = self
            .local
            .read()
            .clone()
            .ok_or_else(|| ServerError::Config("local endpoint unknown".into()))?;
        let new_cluster = ClusterConfig::parse(nodes, &local)?;

        match membership_action(handle.is_leader(), handle.leader_id() != 0, new_cluster.len()) {
            MembershipAction::ChangePeers => {
                info!("reconciling membership towards {}", new_cluster);
                let _outcome = handle.change_peers(new_cluster.node_ids());
                *self.cluster.write() = new_cluster;
            }
            MembershipAction::ResetPeers => {
                warn!("single node with no leader: resetting peers to {}", new_cluster);
                handle.reset_peers(new_cluster.node_ids());
                *self.cluster.write() = new_cluster;
            }
            MembershipAction::Refuse => {
                warn!("no leader and more than one node: refusing to change membership");
            }
        }
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.init_readiness_count.load(Ordering::Acquire) > 0
    }

    /// The node can serve: it is initialized, its store is loaded, and it
    /// either leads or knows a leader.
    pub fn is_alive(&self) -> bool {
        let guard = self.node.read();
        match &*guard {
            None => false,
            Some(handle) => {
                self.is_ready() && (handle.is_leader() || handle.leader_id() != 0)
            }
        }
    }

    /// Opaque consensus state code for the status endpoint; 0 when the
    /// node is not initialized.
    pub fn node_state(&self) -> u64 {
        let guard = self.node.read();
        match &*guard {
            None => STATE_NONE,
            Some(handle) => handle.state_code(),
        }
    }

    pub fn get_init_readiness_count(&self) -> usize {
        self.init_readiness_count.load(Ordering::Acquire)
    }

    /// Cluster view shared with the peering transport.
    pub fn cluster_handle(&self) -> Arc<RwLock<ClusterConfig>> {
        self.cluster.clone()
    }

    /// Mailbox the inbound transport feeds raft messages into.
    pub fn mailbox(&self) -> Option<std::sync::mpsc::Sender<Message>> {
        self.node.read().as_ref().map(|handle| handle.mailbox())
    }

    pub fn reset_db(&self) {
        self.store.close();
    }

    pub fn init_db(&self) -> Result<()> {
        init_db_with(&self.store, &self.collections, &self.init_readiness_count)
    }

    /// Operator-requested snapshot, as driven by the snapshot operations
    /// endpoint.
    pub fn trigger_snapshot(&self) {
        let guard = self.node.read();
        if let Some(handle) = &*guard {
            handle.trigger_snapshot(None);
        }
    }

    /// Ask the node for a snapshot whose completion re-initializes the
    /// store; used once to turn a stand-alone database into the initial
    /// snapshot.
    fn trigger_init_db_snapshot(&self) {
        let guard = self.node.read();
        let Some(handle) = &*guard else {
            return;
        };
        let store = self.store.clone();
        let collections = self.collections.clone();
        let readiness = self.init_readiness_count.clone();
        handle.trigger_snapshot(Some(Box::new(move |outcome| match outcome {
            Ok(()) => {
                info!("init snapshot succeeded");
                store.close();
                if let Err(e) = init_db_with(&store, &collections, &readiness) {
                    error!("could not re-initialize the store: {}", e);
                }
            }
            Err(e) => error!("init snapshot failed: {}", e),
        })));
    }
}

impl ReplicaFsm for ReplicaState {
    /// Runs on the node thread, never concurrently with itself. Each
    /// committed entry is handed to the HTTP worker and the loop waits for
    /// the mutation to finish before moving on.
    fn on_apply(&self, iter: &mut ApplyIter) {
        while iter.valid() {
            let pair = match iter.take_completion() {
                // Applied by the node that accepted the request: reuse the
                // original pair instead of re-parsing the log bytes.
                Some(completion) => Some(completion.into_pair()),
                None => match codec::decode(iter.data()) {
                    Ok(LogRecord::Write(wire)) => Some((wire.into_request(), ApiResponse::new())),
                    Ok(LogRecord::InitSnapshot) => {
                        info!("init snapshot record committed, snapshotting");
                        self.trigger_init_db_snapshot();
                        None
                    }
                    Err(e) => {
                        error!("unreadable log entry at {}: {}", iter.index(), e);
                        None
                    }
                },
            };

            if let Some((req, res)) = pair {
                res.auto_dispose.store(false, Ordering::Release);
                self.dispatcher
                    .send_message(Channel::Replication, req.clone(), res.clone());
                res.awaiter.wait();

                if res.is_final() {
                    drop((req, res));
                }
                // A non-final response stays owned by the HTTP layer.
            }

            if self.shut_down.load(Ordering::Acquire) {
                iter.set_error_and_rollback();
                return;
            }
            iter.next();
        }
    }

    /// Checkpoint the store into the staged snapshot directory off the
    /// node thread, then report the written files.
    fn on_snapshot_save(&self, writer: SnapshotWriter, done: SnapshotDone) {
        let store = self.store.clone();
        let worker = std::thread::Builder::new()
            .name("snapshot-save".to_string())
            .spawn(move || {
                let started = std::time::Instant::now();
                let result = (move || -> Result<SnapshotWriter> {
                    let mut writer = writer;
                    let db_dir = writer.path().join(DB_SNAPSHOT_DIR);
                    store.create_checkpoint(&db_dir)?;
                    for name in list_files(&db_dir)? {
                        writer.add_file(&format!("{}/{}", DB_SNAPSHOT_DIR, name));
                    }
                    Ok(writer)
                })();
                let label = if result.is_ok() { "ok" } else { "error" };
                crate::metrics::SNAPSHOT_HISTOGRAM_VEC
                    .with_label_values(&[label])
                    .observe(started.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    warn!("snapshot checkpoint failed: {}", e);
                }
                done(result);
            });
        if let Err(e) = worker {
            error!("could not spawn snapshot save task: {}", e);
        }
    }

    /// Swap the live store for the snapshot contents. Fatal on failure:
    /// a replica that cannot install a snapshot has no consistent state.
    fn on_snapshot_load(&self, reader: &SnapshotReader) -> Result<()> {
        {
            let guard = self.node.read();
            if let Some(handle) = &*guard {
                if handle.is_leader() {
                    debug_assert!(false, "leader must not install a snapshot");
                    return Err(ServerError::Consensus(
                        "leader must not install a snapshot".into(),
                    ));
                }
            }
        }

        info!("loading snapshot from {:?}", reader.path());
        self.reset_db();
        remove_dir_if_present(self.store.state_dir_path())?;
        copy_dir(&reader.db_snapshot_path(), self.store.state_dir_path())?;
        self.init_db()
    }

    fn on_leader_start(&self, term: u64) {
        info!("elected leader for term {}", term);
        self.leader_term.store(term as i64, Ordering::Release);

        // First leader boot of a migrated stand-alone database: replicate
        // the init-snapshot record exactly once.
        if self.create_init_db_snapshot
            && self.get_init_readiness_count() == 0
            && !self.init_snapshot_requested.swap(true, Ordering::AcqRel)
        {
            let guard = self.node.read();
            if let Some(handle) = &*guard {
                match codec::encode(&LogRecord::InitSnapshot) {
                    Ok(data) => handle.submit(Proposal::write(data, term, None)),
                    Err(e) => error!("could not encode init snapshot record: {}", e),
                }
            }
        }
    }

    fn on_leader_stop(&self) {
        info!("stepping down from leadership");
        self.leader_term.store(-1, Ordering::Release);
    }
}

fn init_db_with(
    store: &Store,
    collections: &CollectionManager,
    readiness: &AtomicUsize,
) -> Result<()> {
    std::fs::create_dir_all(store.state_dir_path())?;
    store.reopen()?;
    info!("store opened, loading collections from disk");
    let loaded = collections.load()?;
    info!("loaded {} collections from disk", loaded);
    readiness.fetch_add(1, Ordering::AcqRel);
    Ok(())
}

fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum MembershipAction {
    ChangePeers,
    ResetPeers,
    Refuse,
}

/// Decide how `refresh_nodes` reconciles membership. Resetting peers gives
/// up consensus safety and is only ever taken by a leaderless singleton.
fn membership_action(is_leader: bool, has_leader: bool, new_len: usize) -> MembershipAction {
    if is_leader {
        MembershipAction::ChangePeers
    } else if !has_leader && new_len == 1 {
        MembershipAction::ResetPeers
    } else {
        MembershipAction::Refuse
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leader_always_reconciles_through_consensus() {
        assert_eq!(membership_action(true, true, 3), MembershipAction::ChangePeers);
        assert_eq!(membership_action(true, true, 1), MembershipAction::ChangePeers);
    }

    #[test]
    fn test_leaderless_singleton_resets_peers() {
        assert_eq!(membership_action(false, false, 1), MembershipAction::ResetPeers);
    }

    #[test]
    fn test_leaderless_multi_node_refuses() {
        assert_eq!(membership_action(false, false, 3), MembershipAction::Refuse);
    }

    #[test]
    fn test_follower_with_leader_does_not_touch_membership() {
        assert_eq!(membership_action(false, true, 1), MembershipAction::Refuse);
        assert_eq!(membership_action(false, true, 3), MembershipAction::Refuse);
    }
}
