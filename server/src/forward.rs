//! Follower-side write forwarding.
//!
//! Followers do not accept mutations: the request is replayed against the
//! current leader's HTTP API and the leader's response is copied back to
//! the local client. Import uploads are streamed instead of buffered.

use futures_util::StreamExt;
use log::{error, info};
use std::time::Duration;

use crate::config::NodeTriple;
use crate::http::{
    Channel, MessageDispatcher, SharedRequest, SharedResponse, ROUTE_ALREADY_HANDLED,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Forwarder {
    client: reqwest::Client,
    dispatcher: MessageDispatcher,
    runtime: tokio::runtime::Handle,
}

impl Forwarder {
    pub fn new(dispatcher: MessageDispatcher, runtime: tokio::runtime::Handle) -> Forwarder {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Forwarder {
            client,
            dispatcher,
            runtime,
        }
    }

    /// Forward a mutating request to `leader`, or reject it when the
    /// cluster has no leader. Called on follower nodes only.
    pub fn forward(&self, leader: Option<NodeTriple>, req: SharedRequest, res: SharedResponse) {
        let leader = match leader {
            Some(leader) => leader,
            None => {
                error!("rejecting write: could not find a leader");
                if req.live && res.proxied_stream.load(std::sync::atomic::Ordering::Acquire) {
                    // The response already started streaming and cannot be
                    // restarted; hand control back to the producer.
                    req.awaiter.notify();
                    return;
                }
                res.set_500("Could not find a leader.");
                req.set_route_hash(ROUTE_ALREADY_HANDLED);
                self.dispatcher.send_message(Channel::Replication, req, res);
                return;
            }
        };

        if req.live && res.proxied_stream.load(std::sync::atomic::Ordering::Acquire) {
            // A later body chunk of a request that is already being
            // proxied; the in-flight proxy owns it.
            info!("in-flight proxied request, returning control to caller");
            req.awaiter.notify();
            return;
        }

        let url = format!("{}{}", leader.api_origin(&req.scheme), req.uri());
        info!("redirecting write to leader at {}", url);

        let client = self.client.clone();
        let dispatcher = self.dispatcher.clone();
        self.runtime.spawn(async move {
            let is_import = req
                .path
                .rsplit('/')
                .next()
                .map(|s| s.starts_with("import"))
                .unwrap_or(false);

            match req.method.as_str() {
                "POST" if is_import => {
                    res.proxied_stream
                        .store(true, std::sync::atomic::Ordering::Release);
                    res.auto_dispose
                        .store(false, std::sync::atomic::Ordering::Release);
                    let status = proxy_import(&client, &url, &req, &res).await;
                    info!("import forward finished with status {}", status);
                    if status != 500 {
                        // Lifecycle was transferred to the proxied stream.
                        return;
                    }
                    res.set_500("");
                }
                "POST" => {
                    forward_body(client.post(&url), &req, &res).await;
                }
                "PUT" => {
                    forward_body(client.put(&url), &req, &res).await;
                }
                "DELETE" => {
                    forward_body(client.delete(&url), &req, &res).await;
                }
                method => {
                    let message = format!("Forwarding for http method not implemented: {}", method);
                    error!("{}", message);
                    res.set_500(&message);
                }
            }

            req.set_route_hash(ROUTE_ALREADY_HANDLED);
            dispatcher.send_message(Channel::Replication, req, res);
        });
    }
}

/// Synchronous forward: replay the body, copy status, body and content
/// type onto the local response.
async fn forward_body(
    request: reqwest::RequestBuilder,
    req: &SharedRequest,
    res: &SharedResponse,
) {
    let mut request = request.body(req.body.clone());
    if let Some(content_type) = req.headers.get("content-type") {
        request = request.header("content-type", content_type);
    }
    match request.send().await {
        Ok(upstream) => {
            let status = upstream.status().as_u16();
            if let Some(content_type) = upstream
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
            {
                res.set_content_type(content_type);
            }
            let body = upstream.text().await.unwrap_or_default();
            res.set_body(status, &body);
        }
        Err(e) => {
            res.set_500(&format!("Forwarding failed: {}", e));
        }
    }
}

/// Stream an import response chunk by chunk into the local response,
/// notifying the wait-point per chunk so the HTTP layer can flush as data
/// arrives. Returns the upstream status.
async fn proxy_import(
    client: &reqwest::Client,
    url: &str,
    req: &SharedRequest,
    res: &SharedResponse,
) -> u16 {
    let mut request = client.post(url).body(req.body.clone());
    if let Some(content_type) = req.headers.get("content-type") {
        request = request.header("content-type", content_type);
    }

    let upstream = match request.send().await {
        Ok(upstream) => upstream,
        Err(e) => {
            error!("import forward failed: {}", e);
            return 500;
        }
    };

    let status = upstream.status().as_u16();
    if let Some(content_type) = upstream
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
    {
        res.set_content_type(content_type);
    }
    res.set_body(status, "");
    res.set_final(false);

    let mut stream = upstream.bytes_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                res.append_chunk(&String::from_utf8_lossy(&bytes));
                res.awaiter.notify();
            }
            Err(e) => {
                error!("import stream broke: {}", e);
                res.set_final(true);
                res.awaiter.notify();
                return 500;
            }
        }
    }

    res.set_final(true);
    res.awaiter.notify();
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{ApiRequest, ApiResponse};
    use std::sync::Arc;

    #[test]
    fn test_no_leader_rejects_with_500_and_releases_connection() {
        let (dispatcher, rx) = MessageDispatcher::channel();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let forwarder = Forwarder::new(dispatcher, runtime.handle().clone());

        let req = Arc::new(ApiRequest::new("POST", "/keys", "{\"id\":\"k\"}"));
        let res = ApiResponse::new();
        forwarder.forward(None, req, res.clone());

        let msg = rx.recv().unwrap();
        assert_eq!(msg.req.route_hash(), ROUTE_ALREADY_HANDLED);
        assert_eq!(res.status(), 500);
        assert!(res.body().contains("Could not find a leader."));
    }

    #[test]
    fn test_no_leader_streaming_response_is_only_notified() {
        let (dispatcher, rx) = MessageDispatcher::channel();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let forwarder = Forwarder::new(dispatcher, runtime.handle().clone());

        let req = Arc::new(ApiRequest::new("POST", "/collections/c/documents/import", ""));
        let res = ApiResponse::new();
        res.set_body(200, "partial");
        res.proxied_stream
            .store(true, std::sync::atomic::Ordering::Release);

        forwarder.forward(None, req.clone(), res.clone());
        // The wait-point was notified without rewriting the response.
        req.awaiter.wait();
        assert_eq!(res.status(), 200);
        assert!(rx.try_recv().is_err());
    }
}
