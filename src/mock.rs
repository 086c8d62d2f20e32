//! Mock transport for testing
//!
//! Scripted replies keyed by method and path, with every dispatched request
//! recorded for inspection.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::{Method, Url};
use tokio::sync::Notify;

use crate::api::{ApiRequest, ApiResponse, HttpTransport, TransportError};

/// One scripted reply
#[derive(Debug, Clone)]
pub enum MockReply {
    Response(ApiResponse),
    Fail(TransportError),
    /// Hold the request until the gate is notified, then answer with the inner reply
    Gated(Arc<Notify>, Box<MockReply>),
}

impl MockReply {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        MockReply::Response(ApiResponse {
            status,
            body: body.to_string().into_bytes(),
        })
    }

    pub fn raw(status: u16, body: Vec<u8>) -> Self {
        MockReply::Response(ApiResponse { status, body })
    }

    pub fn status(status: u16) -> Self {
        Self::raw(status, Vec::new())
    }

    pub fn fail(error: TransportError) -> Self {
        MockReply::Fail(error)
    }

    /// Wrap this reply so it is only delivered once `gate` is notified
    pub fn gated(self, gate: Arc<Notify>) -> Self {
        MockReply::Gated(gate, Box::new(self))
    }
}

type RouteKey = (Method, String);

/// In-memory [`HttpTransport`].
///
/// Replies queued for a route are consumed in order; the last one keeps
/// answering once the queue is down to a single entry. Unscripted routes
/// answer 404.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<RouteKey, VecDeque<MockReply>>>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for `method path`
    pub fn reply(&self, method: Method, path: &str, reply: MockReply) {
        self.routes
            .lock()
            .unwrap()
            .entry((method, path.to_string()))
            .or_default()
            .push_back(reply);
    }

    /// All requests dispatched so far
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Option<ApiRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next_reply(&self, key: &RouteKey) -> Option<MockReply> {
        let mut routes = self.routes.lock().unwrap();
        let queue = routes.get_mut(key)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let path = Url::parse(&request.url)
            .map(|url| url.path().to_string())
            .unwrap_or_else(|_| request.url.clone());
        let key = (request.method.clone(), path);

        self.requests.lock().unwrap().push(request);

        let mut reply = self
            .next_reply(&key)
            .unwrap_or_else(|| MockReply::json(404, serde_json::json!({"error": "Not found"})));

        loop {
            match reply {
                MockReply::Response(response) => return Ok(response),
                MockReply::Fail(error) => return Err(error),
                MockReply::Gated(gate, inner) => {
                    gate.notified().await;
                    reply = *inner;
                }
            }
        }
    }
}
