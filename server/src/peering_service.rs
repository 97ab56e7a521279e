//! Inbound peering transport: a gRPC stream of raft messages from other
//! cluster members, fed into the node's mailbox.

use protobuf::Message as PbMessage;
use raft::eraftpb::Message as RaftMessage;
use std::sync::mpsc::Sender;
use tonic::Streaming;

use pb::peering_service_server::PeeringService;
use pb::{PeeringAck, PeeringEnvelope};

pub mod pb {
    tonic::include_proto!("peering");
}

pub struct PeeringServiceSVC {
    mailbox: Sender<RaftMessage>,
}

impl PeeringServiceSVC {
    pub fn new(mailbox: Sender<RaftMessage>) -> PeeringServiceSVC {
        PeeringServiceSVC { mailbox }
    }
}

#[tonic::async_trait]
impl PeeringService for PeeringServiceSVC {
    /// Drain a peer's message stream. Unparseable messages are logged and
    /// skipped; a dead mailbox means the node stopped, so the stream ends.
    async fn post_message(
        &self,
        request: tonic::Request<Streaming<PeeringEnvelope>>,
    ) -> Result<tonic::Response<PeeringAck>, tonic::Status> {
        let mut stream = request.into_inner();
        while let Some(envelope) = stream.message().await? {
            match RaftMessage::parse_from_bytes(envelope.data.as_slice()) {
                Ok(message) => {
                    if self.mailbox.send(message).is_err() {
                        log::warn!("peering mailbox closed, ending inbound stream");
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("dropping unparseable peering message: {}", e);
                    continue;
                }
            }
        }
        Ok(tonic::Response::new(PeeringAck::default()))
    }
}
