//! Process wiring: store, dispatcher worker, replica state, peering
//! transport and the metrics endpoint.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use log::{error, info};
use prometheus::{Encoder, TextEncoder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::collections::CollectionManager;
use crate::config::RuntimeConfig;
use crate::error::{Result, ServerError};
use crate::forward::Forwarder;
use crate::http::{DispatchMessage, MessageDispatcher, ROUTE_ALREADY_HANDLED};
use crate::metrics;
use crate::peering_client::PeeringClient;
use crate::peering_service::pb::peering_service_server::PeeringServiceServer;
use crate::peering_service::PeeringServiceSVC;
use crate::replica::ReplicaState;
use crate::store::Store;

pub struct Server {
    replica: Arc<ReplicaState>,
    shut_down: Arc<AtomicBool>,
    node_join: Option<JoinHandle<()>>,
}

impl Server {
    /// Bring the whole write path up. Any error is fatal; the caller exits
    /// nonzero.
    pub async fn start(config: RuntimeConfig) -> Result<Server> {
        metrics::init_registry();

        let store = Arc::new(Store::open(&config.state_dir)?);
        let collections = Arc::new(CollectionManager::new(store.clone()));
        let (dispatcher, dispatch_rx) = MessageDispatcher::channel();
        let shut_down = Arc::new(AtomicBool::new(false));

        Server::start_http_worker(dispatch_rx, collections.clone());

        let forwarder = Forwarder::new(dispatcher.clone(), tokio::runtime::Handle::current());
        let replica = Arc::new(ReplicaState::new(
            store,
            collections,
            dispatcher,
            forwarder,
            config.create_init_db_snapshot,
            shut_down.clone(),
        ));

        let (out_mailbox, node_join) = replica.start(
            config.local_triple(),
            config.election_timeout_ms,
            config.snapshot_interval_s,
            &config.raft_dir,
            &config.nodes,
        )?;

        Server::start_peering_server(&config, &replica)?;
        Server::start_out_message_pump(out_mailbox, &replica);
        Server::start_metrics_server(&config)?;

        Ok(Server {
            replica,
            shut_down,
            node_join: Some(node_join),
        })
    }

    pub fn replica(&self) -> &Arc<ReplicaState> {
        &self.replica
    }

    pub fn stop(&mut self) {
        info!("server stopping");
        self.shut_down.store(true, Ordering::Release);
        if let Some(join) = self.node_join.take() {
            let _ = join.join();
        }
    }

    /// The store-mutating worker: executes committed requests handed over
    /// by the apply loop (or completions posted by the forwarder) and
    /// wakes the waiting thread.
    fn start_http_worker(rx: Receiver<DispatchMessage>, collections: Arc<CollectionManager>) {
        std::thread::Builder::new()
            .name("http-worker".to_string())
            .spawn(move || {
                while let Ok(DispatchMessage { req, res, .. }) = rx.recv() {
                    if req.route_hash() == ROUTE_ALREADY_HANDLED {
                        // The response is already populated; with a live
                        // front-end this would only flush the connection.
                        continue;
                    }
                    let (status, body) = collections.execute(&req);
                    res.set_body(status, &body);
                    res.set_final(true);
                    metrics::APPLIED_COUNTER_VEC
                        .with_label_values(&["write"])
                        .inc();
                    res.awaiter.notify();
                }
                info!("http worker stopped");
            })
            .expect("spawn http worker");
    }

    fn start_peering_server(config: &RuntimeConfig, replica: &Arc<ReplicaState>) -> Result<()> {
        let mailbox = replica
            .mailbox()
            .ok_or_else(|| ServerError::NodeInit("peering node has no mailbox".into()))?;
        let addr = format!("0.0.0.0:{}", config.peering_port)
            .parse()
            .map_err(|e| ServerError::Config(format!("bad peering address: {}", e)))?;

        let service = PeeringServiceSVC::new(mailbox);
        let server = tonic::transport::Server::builder()
            .add_service(PeeringServiceServer::new(service))
            .serve(addr);
        tokio::spawn(async move {
            if let Err(e) = server.await {
                error!("peering server failed: {}", e);
            }
        });
        info!("peering server started on {}", addr);
        Ok(())
    }

    /// Pump outbound raft messages on a dedicated thread with its own
    /// runtime, so a slow peer never blocks the node loop.
    fn start_out_message_pump(
        out_mailbox: Receiver<raft::eraftpb::Message>,
        replica: &Arc<ReplicaState>,
    ) {
        let cluster = replica.cluster_handle();
        std::thread::Builder::new()
            .name("peering-out".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Runtime::new() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("could not start outbound runtime: {}", e);
                        return;
                    }
                };
                rt.block_on(async {
                    let client = Arc::new(PeeringClient::new(cluster));
                    while let Ok(message) = out_mailbox.recv() {
                        let client = client.clone();
                        tokio::spawn(async move {
                            client.post_message(message).await;
                        });
                    }
                });
            })
            .expect("spawn outbound pump");
    }

    fn start_metrics_server(config: &RuntimeConfig) -> Result<()> {
        let addr = config
            .metrics_addr
            .parse()
            .map_err(|e| ServerError::Config(format!("bad metrics address: {}", e)))?;
        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                            error!("metrics encoding failed: {}", e);
                        }
                        Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                    }
                }))
            }
        });
        let server = hyper::Server::bind(&addr).serve(make_svc);
        tokio::spawn(async move {
            if let Err(e) = server.await {
                error!("metrics server failed: {}", e);
            }
        });
        info!("metrics server started on {}", addr);
        Ok(())
    }
}
