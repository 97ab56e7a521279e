//! The seam between the replication core and the HTTP layer.
//!
//! The HTTP front-end itself lives elsewhere; the replication core only
//! needs the request/response pair, a one-shot rendezvous between the apply
//! thread and an HTTP worker, and the dispatcher used to hand work across.

use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// Sentinel route hash telling the HTTP layer to complete the connection
/// without invoking any handler.
pub const ROUTE_ALREADY_HANDLED: u64 = u64::MAX;

/// One-shot rendezvous between a waiter and a notifier on different
/// threads. A notify that arrives before the wait is not lost, and the
/// point can be reused for chunked hand-offs.
#[derive(Default)]
pub struct WaitPoint {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl WaitPoint {
    pub fn new() -> WaitPoint {
        WaitPoint::default()
    }

    pub fn notify(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.condvar.notify_one();
    }

    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.condvar.wait(&mut signaled);
        }
        *signaled = false;
    }
}

pub type SharedRequest = Arc<ApiRequest>;
pub type SharedResponse = Arc<ApiResponse>;

/// A parsed client request as the replication core sees it. `route_hash` is
/// assigned by the HTTP router and travels with the request through the log
/// so every replica dispatches to the same handler.
pub struct ApiRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub scheme: String,
    pub(crate) route_hash: AtomicU64,
    /// Whether a live client connection backs this request. Requests
    /// rebuilt from the log on followers have no connection.
    pub live: bool,
    /// Notified by the forwarder when a streaming request must be handed
    /// back to its producer.
    pub awaiter: WaitPoint,
}

impl ApiRequest {
    pub fn new(method: &str, path: &str, body: &str) -> ApiRequest {
        ApiRequest {
            method: method.to_string(),
            path: path.to_string(),
            query: String::new(),
            headers: BTreeMap::new(),
            body: body.to_string(),
            scheme: "http".to_string(),
            route_hash: AtomicU64::new(0),
            live: true,
            awaiter: WaitPoint::new(),
        }
    }

    pub fn route_hash(&self) -> u64 {
        self.route_hash.load(Ordering::Acquire)
    }

    pub fn set_route_hash(&self, hash: u64) {
        self.route_hash.store(hash, Ordering::Release);
    }

    /// Path plus query string, as it should appear in a forwarded URL.
    pub fn uri(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }
}

/// Response half of the pair. Mutated by exactly one worker at a time; the
/// wait-point orders that worker against the apply thread.
pub struct ApiResponse {
    status: AtomicU16,
    content_type: Mutex<String>,
    body: Mutex<String>,
    /// The response is complete; resources may be reclaimed by whoever
    /// waited on it.
    is_final: AtomicBool,
    /// When false, the HTTP layer must not free the pair after writing the
    /// response out; some other owner will.
    pub auto_dispose: AtomicBool,
    /// A proxied upstream response is being streamed into this response.
    pub proxied_stream: AtomicBool,
    pub awaiter: WaitPoint,
}

impl Default for ApiResponse {
    fn default() -> Self {
        ApiResponse {
            status: AtomicU16::new(0),
            content_type: Mutex::new("application/json".to_string()),
            body: Mutex::new(String::new()),
            is_final: AtomicBool::new(true),
            auto_dispose: AtomicBool::new(true),
            proxied_stream: AtomicBool::new(false),
            awaiter: WaitPoint::new(),
        }
    }
}

impl ApiResponse {
    pub fn new() -> SharedResponse {
        Arc::new(ApiResponse::default())
    }

    pub fn set_body(&self, status: u16, body: &str) {
        self.status.store(status, Ordering::Release);
        *self.body.lock() = body.to_string();
    }

    pub fn set_500(&self, message: &str) {
        self.set_body(500, &format!("{{\"message\": \"{}\"}}", message));
    }

    pub fn set_content_type(&self, content_type: &str) {
        *self.content_type.lock() = content_type.to_string();
    }

    pub fn append_chunk(&self, chunk: &str) {
        self.body.lock().push_str(chunk);
    }

    pub fn status(&self) -> u16 {
        self.status.load(Ordering::Acquire)
    }

    pub fn body(&self) -> String {
        self.body.lock().clone()
    }

    pub fn content_type(&self) -> String {
        self.content_type.lock().clone()
    }

    pub fn is_final(&self) -> bool {
        self.is_final.load(Ordering::Acquire)
    }

    pub fn set_final(&self, value: bool) {
        self.is_final.store(value, Ordering::Release);
    }
}

/// Channels understood by the dispatcher. The replication core only ever
/// posts to the replication channel; the HTTP layer owns the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Replication,
}

/// Work handed from the replication core to an HTTP worker: the request to
/// execute and the response to fill. A `ROUTE_ALREADY_HANDLED` route hash
/// means the response is already populated and only the connection needs
/// completing.
pub struct DispatchMessage {
    pub channel: Channel,
    pub req: SharedRequest,
    pub res: SharedResponse,
}

#[derive(Clone)]
pub struct MessageDispatcher {
    tx: Sender<DispatchMessage>,
}

impl MessageDispatcher {
    pub fn channel() -> (MessageDispatcher, Receiver<DispatchMessage>) {
        let (tx, rx) = mpsc::channel();
        (MessageDispatcher { tx }, rx)
    }

    pub fn send_message(&self, channel: Channel, req: SharedRequest, res: SharedResponse) {
        let msg = DispatchMessage { channel, req, res };
        if self.tx.send(msg).is_err() {
            log::warn!("message dispatcher receiver is gone, dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_point_rendezvous() {
        let point = Arc::new(WaitPoint::new());
        let notifier = point.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            notifier.notify();
        });
        point.wait();
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_point_notify_before_wait_is_not_lost() {
        let point = WaitPoint::new();
        point.notify();
        point.wait();
    }

    #[test]
    fn test_dispatcher_delivers_pair() {
        let (dispatcher, rx) = MessageDispatcher::channel();
        let req = Arc::new(ApiRequest::new("POST", "/collections", "{}"));
        let res = ApiResponse::new();
        req.set_route_hash(42);
        dispatcher.send_message(Channel::Replication, req, res);

        let msg = rx.recv().unwrap();
        assert_eq!(msg.channel, Channel::Replication);
        assert_eq!(msg.req.route_hash(), 42);
    }

    #[test]
    fn test_response_defaults() {
        let res = ApiResponse::new();
        assert!(res.is_final());
        assert!(res.auto_dispose.load(Ordering::Acquire));
        res.set_500("nope");
        assert_eq!(res.status(), 500);
        assert!(res.body().contains("nope"));
    }
}
