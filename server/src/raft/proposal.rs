//! Proposals submitted to the node loop, and the owned completion that is
//! invoked exactly once per submitted write.

use raft::eraftpb::ConfChange;
use std::sync::mpsc::{self, Receiver, Sender};

use crate::error::Result;
use crate::http::{
    Channel, MessageDispatcher, SharedRequest, SharedResponse, ROUTE_ALREADY_HANDLED,
};

/// Owned callback for a locally-submitted write. Exactly one of three
/// things happens to it: it travels back through the apply iterator on
/// commit, or `fail` unblocks the caller on leadership loss or shutdown.
pub struct WriteCompletion {
    req: SharedRequest,
    res: SharedResponse,
    dispatcher: MessageDispatcher,
}

impl WriteCompletion {
    pub fn new(
        req: SharedRequest,
        res: SharedResponse,
        dispatcher: MessageDispatcher,
    ) -> WriteCompletion {
        WriteCompletion {
            req,
            res,
            dispatcher,
        }
    }

    /// Recover the original pair on commit; the apply path takes over.
    pub fn into_pair(self) -> (SharedRequest, SharedResponse) {
        (self.req, self.res)
    }

    /// Terminal failure: answer the caller with a 500 and tell the HTTP
    /// layer to release the connection. A response that already started
    /// streaming cannot be rewritten, so only its producer is woken.
    pub fn fail(self, message: &str) {
        if self.req.live
            && self
                .res
                .proxied_stream
                .load(std::sync::atomic::Ordering::Acquire)
        {
            self.req.awaiter.notify();
            return;
        }
        self.res.set_500(message);
        self.req.set_route_hash(ROUTE_ALREADY_HANDLED);
        self.dispatcher
            .send_message(Channel::Replication, self.req, self.res);
    }
}

pub struct WriteProposal {
    pub data: Vec<u8>,
    /// Term observed at submission; a mismatch at propose or apply time
    /// fails the completion instead of mutating state.
    pub expected_term: u64,
    pub completion: Option<WriteCompletion>,
}

/// Commands accepted by the node loop.
pub enum Proposal {
    Write(WriteProposal),
    /// Reconcile membership towards the given voter set, one conf change
    /// at a time. The sender receives the overall outcome.
    ChangePeers {
        voters: Vec<u64>,
        done: Sender<bool>,
    },
    /// Forcibly re-bootstrap the configuration. Consensus safety is
    /// abandoned; only for a single node whose address changed.
    ResetPeers { voters: Vec<u64> },
    /// Ask the state machine to snapshot now, independent of the interval.
    TriggerSnapshot {
        on_done: Option<Box<dyn FnOnce(Result<()>) + Send + 'static>>,
    },
}

impl Proposal {
    pub fn write(data: Vec<u8>, expected_term: u64, completion: Option<WriteCompletion>) -> Proposal {
        Proposal::Write(WriteProposal {
            data,
            expected_term,
            completion,
        })
    }

    pub fn change_peers(voters: Vec<u64>) -> (Proposal, Receiver<bool>) {
        let (tx, rx) = mpsc::channel();
        (Proposal::ChangePeers { voters, done: tx }, rx)
    }

    pub fn reset_peers(voters: Vec<u64>) -> Proposal {
        Proposal::ResetPeers { voters }
    }

    pub fn trigger_snapshot(
        on_done: Option<Box<dyn FnOnce(Result<()>) + Send + 'static>>,
    ) -> Proposal {
        Proposal::TriggerSnapshot { on_done }
    }
}

/// A single pending conf change while walking towards a target voter set.
pub(crate) fn next_conf_change(current: &[u64], target: &[u64]) -> Option<ConfChange> {
    use raft::eraftpb::ConfChangeType;

    for id in target {
        if !current.contains(id) {
            let mut cc = ConfChange::default();
            cc.node_id = *id;
            cc.set_change_type(ConfChangeType::AddNode);
            return Some(cc);
        }
    }
    for id in current {
        if !target.contains(id) {
            let mut cc = ConfChange::default();
            cc.node_id = *id;
            cc.set_change_type(ConfChangeType::RemoveNode);
            return Some(cc);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{ApiRequest, ApiResponse};
    use raft::eraftpb::ConfChangeType;
    use std::sync::Arc;

    #[test]
    fn test_fail_answers_caller_and_releases_connection() {
        let (dispatcher, rx) = MessageDispatcher::channel();
        let req = Arc::new(ApiRequest::new("POST", "/collections", "{}"));
        let res = ApiResponse::new();
        let completion = WriteCompletion::new(req, res.clone(), dispatcher);

        completion.fail("Could not find a leader.");

        let msg = rx.recv().unwrap();
        assert_eq!(msg.req.route_hash(), ROUTE_ALREADY_HANDLED);
        assert_eq!(res.status(), 500);
        assert!(res.body().contains("Could not find a leader."));
    }

    #[test]
    fn test_conf_change_walk_adds_then_removes() {
        let cc = next_conf_change(&[1, 2], &[1, 2, 3]).unwrap();
        assert_eq!(cc.node_id, 3);
        assert_eq!(cc.get_change_type(), ConfChangeType::AddNode);

        let cc = next_conf_change(&[1, 2, 3], &[1, 3]).unwrap();
        assert_eq!(cc.node_id, 2);
        assert_eq!(cc.get_change_type(), ConfChangeType::RemoveNode);

        assert!(next_conf_change(&[1, 2], &[1, 2]).is_none());
    }
}
