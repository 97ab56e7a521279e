//! End-to-end tests for the replicated write path on a single node:
//! bootstrap, leader writes through the dispatcher worker, snapshot save
//! and snapshot install on restart.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use seekdb::collections::{doc_key, CollectionManager};
use seekdb::config::NodeTriple;
use seekdb::forward::Forwarder;
use seekdb::http::{ApiRequest, ApiResponse, DispatchMessage, MessageDispatcher, ROUTE_ALREADY_HANDLED};
use seekdb::raft::node::STATE_LEADER;
use seekdb::raft::storage::FileStorage;
use seekdb::replica::ReplicaState;
use seekdb::store::Store;

const ELECTION_TIMEOUT_MS: u64 = 300;
const SNAPSHOT_INTERVAL_S: u64 = 3600;

struct TestNode {
    store: Arc<Store>,
    collections: Arc<CollectionManager>,
    replica: Arc<ReplicaState>,
    shut_down: Arc<AtomicBool>,
    node_join: JoinHandle<()>,
    worker_join: JoinHandle<()>,
    _runtime: tokio::runtime::Runtime,
    _out_mailbox: Receiver<raft::eraftpb::Message>,
}

impl TestNode {
    /// Wire up a full single node: store, dispatcher worker, replica.
    fn start(raft_dir: &Path, state_dir: &Path, create_init_db_snapshot: bool) -> TestNode {
        let store = Arc::new(Store::open(state_dir).unwrap());
        let collections = Arc::new(CollectionManager::new(store.clone()));
        let (dispatcher, dispatch_rx) = MessageDispatcher::channel();

        let worker_collections = collections.clone();
        let worker_join = std::thread::spawn(move || {
            while let Ok(DispatchMessage { req, res, .. }) = dispatch_rx.recv() {
                if req.route_hash() == ROUTE_ALREADY_HANDLED {
                    continue;
                }
                let (status, body) = worker_collections.execute(&req);
                res.set_body(status, &body);
                res.set_final(true);
                res.awaiter.notify();
            }
        });

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let forwarder = Forwarder::new(dispatcher.clone(), runtime.handle().clone());
        let shut_down = Arc::new(AtomicBool::new(false));
        let replica = Arc::new(ReplicaState::new(
            store.clone(),
            collections.clone(),
            dispatcher,
            forwarder,
            create_init_db_snapshot,
            shut_down.clone(),
        ));

        let local = NodeTriple {
            host: "127.0.0.1".to_string(),
            peering_port: 8107,
            api_port: 8108,
        };
        let (out_mailbox, node_join) = replica
            .start(local, ELECTION_TIMEOUT_MS, SNAPSHOT_INTERVAL_S, raft_dir, "")
            .unwrap();

        TestNode {
            store,
            collections,
            replica,
            shut_down,
            node_join,
            worker_join,
            _runtime: runtime,
            _out_mailbox: out_mailbox,
        }
    }

    fn wait_for_leadership(&self) {
        wait_until(Duration::from_secs(15), || {
            self.replica.node_state() == STATE_LEADER
        });
    }

    /// Stop the node and release every store handle so the directories can
    /// be reused by a successor.
    fn stop(self) {
        self.shut_down.store(true, Ordering::Release);
        self.node_join.join().unwrap();
        drop(self.replica);
        drop(self._out_mailbox);
        self.worker_join.join().unwrap();
        drop(self.collections);
        drop(self.store);
    }
}

fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) {
    let start = Instant::now();
    while !condition() {
        if start.elapsed() > timeout {
            panic!("condition not reached within {:?}", timeout);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn dirs(root: &tempfile::TempDir) -> (PathBuf, PathBuf) {
    (root.path().join("raft"), root.path().join("state"))
}

#[test]
fn test_single_node_bootstrap_elects_and_serves_writes() {
    let root = tempfile::TempDir::new().unwrap();
    let (raft_dir, state_dir) = dirs(&root);
    let node = TestNode::start(&raft_dir, &state_dir, false);

    // Fresh boot initializes the store exactly once.
    assert_eq!(node.replica.get_init_readiness_count(), 1);
    assert!(!node.replica.is_alive());

    node.wait_for_leadership();
    assert!(node.replica.is_alive());

    // Create a collection through the log.
    let req = Arc::new(ApiRequest::new("POST", "/collections", "{\"name\": \"products\"}"));
    let res = ApiResponse::new();
    node.replica.write(req, res.clone());
    wait_until(Duration::from_secs(10), || res.status() == 201);
    assert!(res.is_final());
    assert!(node.collections.contains("products"));

    // Write a document; the apply loop hands it to the worker which
    // mutates the store.
    let req = Arc::new(ApiRequest::new(
        "POST",
        "/collections/products/documents",
        "{\"id\":\"1\",\"x\":1}",
    ));
    let res = ApiResponse::new();
    node.replica.write(req, res.clone());
    wait_until(Duration::from_secs(10), || res.status() == 201);
    assert_eq!(
        node.store.get(&doc_key("products", "1")).unwrap().unwrap(),
        b"{\"id\":\"1\",\"x\":1}".to_vec()
    );

    node.stop();
}

#[test]
fn test_snapshot_then_restart_restores_store_from_checkpoint() {
    let root = tempfile::TempDir::new().unwrap();
    let (raft_dir, state_dir) = dirs(&root);

    {
        let node = TestNode::start(&raft_dir, &state_dir, false);
        node.wait_for_leadership();

        let req = Arc::new(ApiRequest::new("POST", "/collections", "{\"name\": \"c\"}"));
        let res = ApiResponse::new();
        node.replica.write(req, res.clone());
        wait_until(Duration::from_secs(10), || res.status() == 201);

        let req = Arc::new(ApiRequest::new(
            "POST",
            "/collections/c/documents",
            "{\"id\":\"7\",\"v\":42}",
        ));
        let res = ApiResponse::new();
        node.replica.write(req, res.clone());
        wait_until(Duration::from_secs(10), || res.status() == 201);

        node.replica.trigger_snapshot();
        wait_until(Duration::from_secs(15), || {
            FileStorage::snapshot_exists(&raft_dir)
        });

        node.stop();
    }

    // Wipe the live store; only the snapshot can bring the data back.
    std::fs::remove_dir_all(&state_dir).unwrap();

    let node = TestNode::start(&raft_dir, &state_dir, false);
    // The boot-time snapshot load counts as the one initialization.
    assert_eq!(node.replica.get_init_readiness_count(), 1);
    assert_eq!(
        node.store.get(&doc_key("c", "7")).unwrap().unwrap(),
        b"{\"id\":\"7\",\"v\":42}".to_vec()
    );
    assert!(node.collections.contains("c"));

    node.wait_for_leadership();
    assert!(node.replica.is_alive());
    node.stop();
}

#[test]
fn test_first_leader_boot_produces_init_snapshot() {
    let root = tempfile::TempDir::new().unwrap();
    let (raft_dir, state_dir) = dirs(&root);
    let node = TestNode::start(&raft_dir, &state_dir, true);

    // The store is deliberately not initialized yet: the elected leader
    // replicates an init-snapshot record first.
    assert_eq!(node.replica.get_init_readiness_count(), 0);

    node.wait_for_leadership();
    wait_until(Duration::from_secs(15), || {
        FileStorage::snapshot_exists(&raft_dir)
    });
    wait_until(Duration::from_secs(15), || {
        node.replica.get_init_readiness_count() == 1
    });
    assert!(node.replica.is_alive());

    node.stop();
}
