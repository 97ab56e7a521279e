//! The node loop driving the raft runtime.
//!
//! One dedicated thread per node ticks the raft instance, steps inbound
//! peer messages, drains submitted proposals and processes ready states.
//! Committed entries are handed to the replication state machine through
//! [`ApplyIter`]; the loop blocks while the state machine rendezvouses with
//! the HTTP worker per entry, which is what keeps apply order equal to
//! store mutation order.

use log::{error, info, warn};
use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfChange, ConfState, Entry, EntryType, Message, Snapshot};
use raft::{prelude::Config, RawNode, StateRole, Storage};
use slog::{o, Drain};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{Result, ServerError};
use crate::raft::proposal::{next_conf_change, Proposal, WriteCompletion, WriteProposal};
use crate::raft::snapshot::SnapshotReader;
use crate::raft::storage::{FileStorage, SnapshotMeta};
use crate::raft::{ApplyItem, ApplyIter, ReplicaFsm, SnapshotDone, SnapshotWriter};

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const POLL_INTERVAL: Duration = Duration::from_millis(1);
const LOGGER_CHANNEL_SIZE: usize = 4096;

/// Snapshot as soon as at least this many entries were applied past the
/// last snapshot. Kept at 1 so a freshly joining node installs a
/// checkpoint instead of replaying a long log.
const SNAPSHOT_MIN_INDEX_GAP: u64 = 1;

pub const STATE_NONE: u64 = 0;
pub const STATE_FOLLOWER: u64 = 1;
pub const STATE_CANDIDATE: u64 = 2;
pub const STATE_LEADER: u64 = 3;
pub const STATE_PRE_CANDIDATE: u64 = 4;

fn role_code(role: StateRole) -> u64 {
    match role {
        StateRole::Follower => STATE_FOLLOWER,
        StateRole::Candidate => STATE_CANDIDATE,
        StateRole::Leader => STATE_LEADER,
        StateRole::PreCandidate => STATE_PRE_CANDIDATE,
    }
}

pub struct NodeOptions {
    pub id: u64,
    pub voters: Vec<u64>,
    pub raft_dir: PathBuf,
    pub election_timeout_ms: u64,
    pub snapshot_interval_s: u64,
}

/// State the loop publishes for cheap cross-thread queries.
#[derive(Default)]
pub struct NodeShared {
    term: AtomicU64,
    leader_id: AtomicU64,
    role: AtomicU64,
}

/// Cheap handle to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    proposals: Sender<Proposal>,
    mailbox: Sender<Message>,
    shared: Arc<NodeShared>,
}

impl NodeHandle {
    /// Submit a proposal to the loop. A write whose channel is already
    /// gone fails its completion immediately.
    pub fn submit(&self, proposal: Proposal) {
        if let Err(mpsc::SendError(returned)) = self.proposals.send(proposal) {
            if let Proposal::Write(WriteProposal {
                completion: Some(completion),
                ..
            }) = returned
            {
                completion.fail("Server is shutting down.");
            }
        }
    }

    /// Sender peers deliver raft messages through.
    pub fn mailbox(&self) -> Sender<Message> {
        self.mailbox.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.shared.role.load(Ordering::Acquire) == STATE_LEADER
    }

    pub fn leader_id(&self) -> u64 {
        self.shared.leader_id.load(Ordering::Acquire)
    }

    pub fn term(&self) -> u64 {
        self.shared.term.load(Ordering::Acquire)
    }

    pub fn state_code(&self) -> u64 {
        self.shared.role.load(Ordering::Acquire)
    }

    pub fn change_peers(&self, voters: Vec<u64>) -> Receiver<bool> {
        let (proposal, rx) = Proposal::change_peers(voters);
        self.submit(proposal);
        rx
    }

    pub fn reset_peers(&self, voters: Vec<u64>) {
        self.submit(Proposal::reset_peers(voters));
    }

    pub fn trigger_snapshot(&self, on_done: Option<Box<dyn FnOnce(Result<()>) + Send + 'static>>) {
        self.submit(Proposal::trigger_snapshot(on_done));
    }
}

/// Outcome of a background snapshot save, reported back to the loop.
type SnapshotOutcome = Result<SnapshotWriter>;

pub struct Node {
    raft_group: RawNode<FileStorage>,
    fsm: Arc<dyn ReplicaFsm>,
    my_mailbox: Receiver<Message>,
    out_mailbox: Sender<Message>,
    proposals: Receiver<Proposal>,
    pending_writes: VecDeque<PendingWrite>,
    pending_membership: Option<PendingMembership>,
    conf_state: ConfState,
    shared: Arc<NodeShared>,
    shut_down: Arc<AtomicBool>,
    snapshot_interval: Duration,
    last_snapshot_at: Instant,
    snapshot_tx: Sender<SnapshotOutcome>,
    snapshot_rx: Receiver<SnapshotOutcome>,
    staged_snapshot: Option<SnapshotMeta>,
    snapshot_cb: Option<Box<dyn FnOnce(Result<()>) + Send + 'static>>,
    prev_role: StateRole,
    stopped: bool,
}

struct PendingWrite {
    index: u64,
    term: u64,
    completion: WriteCompletion,
}

/// An in-progress `change_peers` walk: one conf change at a time until the
/// voter set matches the target.
struct PendingMembership {
    target: Vec<u64>,
    done: Sender<bool>,
}

/// A prepared node that has not started its loop yet, so the caller can
/// publish the handle before the first callback fires.
pub struct NodeRunner {
    node: Node,
}

impl NodeRunner {
    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("peering-node".to_string())
            .spawn(move || {
                let mut node = self.node;
                node.run();
            })
            .expect("spawn peering node thread")
    }
}

impl Node {
    /// Build the node: open storage, run the boot-time snapshot load if a
    /// generation exists, and create the raft instance. Any error here is
    /// fatal to startup.
    pub fn prepare(
        opts: NodeOptions,
        fsm: Arc<dyn ReplicaFsm>,
        shut_down: Arc<AtomicBool>,
    ) -> Result<(NodeHandle, NodeRunner, Receiver<Message>)> {
        let storage = FileStorage::new(&opts.raft_dir, &opts.voters)?;

        // A node booting with an existing snapshot must restore the store
        // from it instead of initializing fresh.
        if let Some(dir) = storage.latest_snapshot_dir() {
            info!("found snapshot at {:?}, restoring store from it", dir);
            fsm.on_snapshot_load(&SnapshotReader::new(dir))?;
        }

        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain)
            .chan_size(LOGGER_CHANNEL_SIZE)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build()
            .fuse();
        let logger = slog::Logger::root(drain, o!("node" => opts.id));

        let election_tick = ((opts.election_timeout_ms / TICK_INTERVAL.as_millis() as u64) as usize)
            .max(10);
        let cfg = Config {
            id: opts.id,
            election_tick,
            heartbeat_tick: 3,
            ..Default::default()
        };

        let conf_state = storage
            .initial_state()
            .map_err(|e| ServerError::NodeInit(e.to_string()))?
            .conf_state;

        let raft_group = RawNode::new(&cfg, storage, &logger)
            .map_err(|e| ServerError::NodeInit(format!("raft init failed: {}", e)))?;

        let (proposal_tx, proposal_rx) = mpsc::channel();
        let (in_tx, in_rx) = mpsc::channel();
        let (out_tx, out_rx) = mpsc::channel();
        let (snapshot_tx, snapshot_rx) = mpsc::channel();
        let shared = Arc::new(NodeShared::default());

        let handle = NodeHandle {
            proposals: proposal_tx,
            mailbox: in_tx,
            shared: shared.clone(),
        };

        let node = Node {
            raft_group,
            fsm,
            my_mailbox: in_rx,
            out_mailbox: out_tx,
            proposals: proposal_rx,
            pending_writes: VecDeque::new(),
            pending_membership: None,
            conf_state,
            shared,
            shut_down,
            snapshot_interval: Duration::from_secs(opts.snapshot_interval_s.max(1)),
            last_snapshot_at: Instant::now(),
            snapshot_tx,
            snapshot_rx,
            staged_snapshot: None,
            snapshot_cb: None,
            prev_role: StateRole::Follower,
            stopped: false,
        };

        Ok((handle, NodeRunner { node }, out_rx))
    }

    fn run(&mut self) {
        let mut last_tick = Instant::now();

        loop {
            if self.stopped || self.shut_down.load(Ordering::Acquire) {
                break;
            }

            match self.my_mailbox.recv_timeout(POLL_INTERVAL) {
                Ok(msg) => {
                    let _ = self.raft_group.step(msg);
                    while let Ok(msg) = self.my_mailbox.try_recv() {
                        let _ = self.raft_group.step(msg);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            while let Ok(proposal) = self.proposals.try_recv() {
                self.handle_proposal(proposal);
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.raft_group.tick();
                last_tick = Instant::now();
            }

            self.poll_snapshot_outcome();
            self.maybe_interval_snapshot();

            if let Err(e) = self.on_ready() {
                error!("peering node failed: {}", e);
                self.stopped = true;
            }

            self.publish_state();
        }

        self.drain_on_shutdown();
    }

    fn handle_proposal(&mut self, proposal: Proposal) {
        match proposal {
            Proposal::Write(write) => self.propose_write(write),
            Proposal::ChangePeers { voters, done } => self.begin_change_peers(voters, done),
            Proposal::ResetPeers { voters } => self.reset_peers(voters),
            Proposal::TriggerSnapshot { on_done } => self.start_snapshot(on_done, true),
        }
    }

    fn propose_write(&mut self, write: WriteProposal) {
        let fail = |completion: Option<WriteCompletion>, message: &str| {
            if let Some(completion) = completion {
                completion.fail(message);
            }
        };

        if self.raft_group.raft.state != StateRole::Leader {
            fail(write.completion, "Could not find a leader.");
            return;
        }
        // The term moved between submission and proposal; the caller's
        // view of the leadership is stale.
        if self.raft_group.raft.term != write.expected_term {
            fail(write.completion, "Rejecting write: leader term has changed.");
            return;
        }

        let index = self.raft_group.raft.raft_log.last_index() + 1;
        if self.raft_group.propose(vec![], write.data).is_err() {
            fail(write.completion, "Could not replicate write.");
            return;
        }
        if self.raft_group.raft.raft_log.last_index() + 1 == index {
            fail(write.completion, "Could not replicate write.");
            return;
        }

        if let Some(completion) = write.completion {
            self.pending_writes.push_back(PendingWrite {
                index,
                term: write.expected_term,
                completion,
            });
        }
    }

    fn begin_change_peers(&mut self, voters: Vec<u64>, done: Sender<bool>) {
        if self.raft_group.raft.state != StateRole::Leader {
            let _ = done.send(false);
            return;
        }
        if self.pending_membership.is_some() {
            warn!("membership change already in progress, refusing another");
            let _ = done.send(false);
            return;
        }
        self.pending_membership = Some(PendingMembership {
            target: voters,
            done,
        });
        self.advance_membership();
    }

    /// Propose the next single conf change towards the target, or finish.
    fn advance_membership(&mut self) {
        let Some(pending) = &self.pending_membership else {
            return;
        };
        match next_conf_change(&self.conf_state.voters, &pending.target) {
            Some(cc) => {
                if let Err(e) = self.raft_group.propose_conf_change(vec![], cc) {
                    warn!("conf change proposal failed: {}", e);
                    if let Some(pending) = self.pending_membership.take() {
                        let _ = pending.done.send(false);
                    }
                }
            }
            None => {
                if let Some(pending) = self.pending_membership.take() {
                    info!("membership now matches target {:?}", pending.target);
                    let _ = pending.done.send(true);
                }
            }
        }
    }

    /// Forcibly re-bootstrap the configuration and campaign. Consensus
    /// guarantees are knowingly abandoned; only sane for a single node
    /// whose address changed under it.
    fn reset_peers(&mut self, voters: Vec<u64>) {
        warn!(
            "resetting peers to {:?}; consistency guarantees are waived",
            voters
        );
        {
            let store = &mut self.raft_group.raft.raft_log.store;
            if let Err(e) = store.reset_conf_state(voters.clone()) {
                error!("could not persist reset configuration: {}", e);
                return;
            }
        }
        let mut cs = ConfState::default();
        cs.voters = voters;
        self.conf_state = cs;
        if let Err(e) = self.raft_group.campaign() {
            warn!("campaign after peer reset failed: {}", e);
        }
    }

    fn start_snapshot(
        &mut self,
        on_done: Option<Box<dyn FnOnce(Result<()>) + Send + 'static>>,
        forced: bool,
    ) {
        if self.staged_snapshot.is_some() {
            if let Some(cb) = on_done {
                cb(Err(ServerError::Snapshot("a snapshot save is in flight".into())));
            }
            return;
        }

        let applied = self.raft_group.raft.raft_log.applied();
        let store = &self.raft_group.raft.raft_log.store;
        if !forced && applied < store.snapshot_index() + SNAPSHOT_MIN_INDEX_GAP {
            return;
        }
        if applied <= store.snapshot_index() {
            if let Some(cb) = on_done {
                cb(Err(ServerError::Snapshot("nothing new to snapshot".into())));
            }
            return;
        }

        let term = self
            .raft_group
            .raft
            .raft_log
            .term(applied)
            .unwrap_or(self.raft_group.raft.term);
        let staging = store.staging_dir();
        let _ = std::fs::remove_dir_all(&staging);
        let writer = match SnapshotWriter::new(staging) {
            Ok(writer) => writer,
            Err(e) => {
                warn!("could not stage snapshot: {}", e);
                if let Some(cb) = on_done {
                    cb(Err(e.into()));
                }
                return;
            }
        };

        self.staged_snapshot = Some(SnapshotMeta {
            index: applied,
            term,
            voters: self.conf_state.voters.clone(),
            learners: self.conf_state.learners.clone(),
            files: Vec::new(),
        });
        self.snapshot_cb = on_done;

        info!("snapshot save starting at index {}", applied);
        let tx = self.snapshot_tx.clone();
        let done: SnapshotDone = Box::new(move |outcome| {
            let _ = tx.send(outcome);
        });
        self.fsm.on_snapshot_save(writer, done);
    }

    fn poll_snapshot_outcome(&mut self) {
        let outcome = match self.snapshot_rx.try_recv() {
            Ok(outcome) => outcome,
            Err(_) => return,
        };
        let Some(mut meta) = self.staged_snapshot.take() else {
            return;
        };
        let cb = self.snapshot_cb.take();

        let result = outcome.and_then(|writer| {
            meta.files = writer.into_files();
            let index = meta.index;
            let store = &mut self.raft_group.raft.raft_log.store;
            store.finalize_snapshot(meta)?;
            info!("snapshot saved at index {}", index);
            Ok(())
        });

        if let Err(e) = &result {
            warn!("snapshot save failed: {}", e);
        }
        self.last_snapshot_at = Instant::now();
        if let Some(cb) = cb {
            cb(result);
        }
    }

    fn maybe_interval_snapshot(&mut self) {
        if self.staged_snapshot.is_none() && self.last_snapshot_at.elapsed() >= self.snapshot_interval
        {
            self.start_snapshot(None, false);
            self.last_snapshot_at = Instant::now();
        }
    }

    fn on_ready(&mut self) -> Result<()> {
        if !self.raft_group.has_ready() {
            return Ok(());
        }

        let mut ready = self.raft_group.ready();

        if !ready.messages().is_empty() {
            self.send_messages(ready.take_messages());
        }

        if *ready.snapshot() != Snapshot::default() {
            let snapshot = ready.snapshot().clone();
            let dir = {
                let store = &mut self.raft_group.raft.raft_log.store;
                store.install_snapshot(&snapshot)?
            };
            self.conf_state = snapshot.get_metadata().get_conf_state().clone();
            // Install must fully replace the store before any further
            // entry applies; failure here is fatal.
            self.fsm.on_snapshot_load(&SnapshotReader::new(dir))?;
        }

        let committed = ready.take_committed_entries();
        self.handle_committed_entries(committed)?;

        {
            let store = &mut self.raft_group.raft.raft_log.store;
            store.append_entries(ready.entries()).map_err(node_err)?;
            if let Some(hs) = ready.hs() {
                store.set_hardstate(hs.clone()).map_err(node_err)?;
            }
        }
        if !ready.persisted_messages().is_empty() {
            self.send_messages(ready.take_persisted_messages());
        }

        let mut light_rd = self.raft_group.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            let store = &mut self.raft_group.raft.raft_log.store;
            store.set_commit(commit).map_err(node_err)?;
        }
        self.send_messages(light_rd.take_messages());
        let committed = light_rd.take_committed_entries();
        self.handle_committed_entries(committed)?;

        if !self.stopped {
            self.raft_group.advance_apply();
        }
        Ok(())
    }

    fn send_messages(&self, messages: Vec<Message>) {
        for msg in messages {
            if self.out_mailbox.send(msg).is_err() {
                warn!("outbound mailbox is gone, dropping raft message");
            }
        }
    }

    fn handle_committed_entries(&mut self, entries: Vec<Entry>) -> Result<()> {
        let mut batch: Vec<ApplyItem> = Vec::new();

        for entry in entries {
            if entry.data.is_empty() {
                // Leader election no-op.
                continue;
            }
            match entry.get_entry_type() {
                EntryType::EntryConfChange => {
                    // Entries queued before this conf change apply first.
                    self.run_apply(std::mem::take(&mut batch));
                    if self.stopped {
                        return Ok(());
                    }

                    let mut cc = ConfChange::default();
                    cc.merge_from_bytes(&entry.data)
                        .map_err(|e| ServerError::Consensus(format!("bad conf change: {}", e)))?;
                    let cs = self
                        .raft_group
                        .apply_conf_change(&cc)
                        .map_err(|e| ServerError::Consensus(format!("conf change failed: {}", e)))?;
                    {
                        let store = &mut self.raft_group.raft.raft_log.store;
                        store.set_conf_state(cs.clone()).map_err(node_err)?;
                    }
                    self.conf_state = cs;
                    self.advance_membership();
                }
                _ => {
                    let completion = self.match_pending(entry.index, entry.term);
                    batch.push(ApplyItem {
                        index: entry.index,
                        term: entry.term,
                        data: entry.data.to_vec(),
                        completion,
                    });
                }
            }
        }

        self.run_apply(batch);
        Ok(())
    }

    /// Pair a committed entry with the completion of the local proposal
    /// that produced it. An entry at the same index from a different term
    /// means the local proposal was superseded and its caller gets failed.
    fn match_pending(&mut self, index: u64, term: u64) -> Option<WriteCompletion> {
        while let Some(front) = self.pending_writes.front() {
            if front.index > index {
                return None;
            }
            let pending = self.pending_writes.pop_front().expect("front exists");
            if pending.index == index {
                if pending.term == term {
                    return Some(pending.completion);
                }
                pending.completion.fail("Rejecting write: leader term has changed.");
                return None;
            }
            // Entries below the applied index were superseded wholesale.
            pending.completion.fail("Rejecting write: leader term has changed.");
        }
        None
    }

    fn run_apply(&mut self, items: Vec<ApplyItem>) {
        if items.is_empty() {
            return;
        }
        let mut iter = ApplyIter::new(items);
        self.fsm.on_apply(&mut iter);
        if iter.rolled_back() {
            // Shutdown mid-batch: unapplied entries are replayed on the
            // next boot, their callers are unblocked now.
            for completion in iter.take_remaining_completions() {
                completion.fail("Server is shutting down.");
            }
            self.stopped = true;
        }
    }

    fn publish_state(&mut self) {
        let term = self.raft_group.raft.term;
        let leader_id = self.raft_group.raft.leader_id;
        let role = self.raft_group.raft.state;
        self.shared.term.store(term, Ordering::Release);
        self.shared.leader_id.store(leader_id, Ordering::Release);
        self.shared.role.store(role_code(role), Ordering::Release);

        if role != self.prev_role {
            match (self.prev_role, role) {
                (_, StateRole::Leader) => self.fsm.on_leader_start(term),
                (StateRole::Leader, _) => {
                    self.fsm.on_leader_stop();
                    self.fail_pending_writes("Rejecting write: leader term has changed.");
                    if let Some(pending) = self.pending_membership.take() {
                        let _ = pending.done.send(false);
                    }
                }
                _ => {}
            }
            self.prev_role = role;
        }
    }

    fn fail_pending_writes(&mut self, message: &str) {
        for pending in self.pending_writes.drain(..) {
            pending.completion.fail(message);
        }
    }

    fn drain_on_shutdown(&mut self) {
        self.fail_pending_writes("Server is shutting down.");
        while let Ok(proposal) = self.proposals.try_recv() {
            if let Proposal::Write(WriteProposal {
                completion: Some(completion),
                ..
            }) = proposal
            {
                completion.fail("Server is shutting down.");
            }
        }
        info!("peering node loop stopped");
    }
}

fn node_err(e: raft::Error) -> ServerError {
    ServerError::Consensus(e.to_string())
}
