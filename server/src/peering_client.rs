//! Outbound peering transport: one streaming gRPC connection per peer,
//! rebuilt lazily after failures.

use parking_lot::RwLock as SyncRwLock;
use protobuf::Message as PbMessage;
use raft::eraftpb::Message as RaftMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Mutex;

use crate::config::ClusterConfig;
use crate::peering_service::pb::peering_service_client::PeeringServiceClient;
use crate::peering_service::pb::PeeringEnvelope;

const PEER_CHANNEL_SIZE: usize = 1000;

struct PeerClient {
    sender: Sender<PeeringEnvelope>,
    invalid: Arc<AtomicBool>,
}

impl PeerClient {
    async fn connect(addr: String) -> Result<PeerClient, tonic::transport::Error> {
        let client = PeeringServiceClient::connect(addr).await?;
        let (sender, receiver) = mpsc::channel(PEER_CHANNEL_SIZE);

        let invalid = Arc::new(AtomicBool::new(false));
        let invalid_flag = invalid.clone();
        let mut stream_client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = PeerClient::stream_messages(&mut stream_client, receiver).await {
                log::error!("peer stream failed: {}", e);
                invalid_flag.store(true, Ordering::SeqCst);
            }
        });

        Ok(PeerClient { sender, invalid })
    }

    async fn stream_messages(
        client: &mut PeeringServiceClient<tonic::transport::Channel>,
        receiver: Receiver<PeeringEnvelope>,
    ) -> Result<(), tonic::Status> {
        let stream = tokio_stream::wrappers::ReceiverStream::new(receiver);
        let _ = client.post_message(stream).await?;
        Ok(())
    }
}

pub struct PeeringClient {
    cluster: Arc<SyncRwLock<ClusterConfig>>,
    peers: Mutex<HashMap<u64, PeerClient>>,
}

impl PeeringClient {
    pub fn new(cluster: Arc<SyncRwLock<ClusterConfig>>) -> PeeringClient {
        PeeringClient {
            cluster,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Ship one raft message to its destination, connecting on first use.
    /// Failed peers are forgotten so the next message reconnects; raft
    /// retries on its own schedule.
    pub async fn post_message(&self, message: RaftMessage) {
        let peer_id = message.to;
        let mut peers = self.peers.lock().await;

        if let Some(peer) = peers.get(&peer_id) {
            if peer.invalid.load(Ordering::SeqCst) {
                peers.remove(&peer_id);
            }
        }

        if !peers.contains_key(&peer_id) {
            let addr = match self.cluster.read().get(peer_id) {
                Some(triple) => triple.peering_url(),
                None => {
                    log::warn!("no address for peer {}, dropping message", peer_id);
                    return;
                }
            };
            match PeerClient::connect(addr).await {
                Ok(peer) => {
                    peers.insert(peer_id, peer);
                }
                Err(e) => {
                    log::error!("could not connect to peer {}: {}", peer_id, e);
                    return;
                }
            }
        }

        let peer = peers.get(&peer_id).expect("peer just ensured");
        let envelope = PeeringEnvelope {
            data: match message.write_to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("could not encode raft message: {}", e);
                    return;
                }
            },
        };
        if peer.sender.try_send(envelope).is_err() {
            // Backpressure or a dead stream; raft will retry.
        }
    }
}
