//! Scripted in-memory transport

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{Transport, TransportError, TransportRequest, TransportResponse};

/// One scripted outcome
#[derive(Debug, Clone)]
pub enum MockReply {
    Response(TransportResponse),
    Error(TransportError),
    /// Wait before producing the inner reply; honors cancellation
    Delayed(Duration, Box<MockReply>),
}

#[derive(Debug, Default)]
struct MockState {
    replies: VecDeque<MockReply>,
    fallback: Option<MockReply>,
    requests: Vec<TransportRequest>,
}

/// Transport that replays queued replies in order
///
/// Clones share the same script and call log.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    calls: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply
    pub fn push(&self, reply: MockReply) -> &Self {
        self.state.lock().replies.push_back(reply);
        self
    }

    /// Queue a response
    pub fn push_response(&self, response: TransportResponse) -> &Self {
        self.push(MockReply::Response(response))
    }

    /// Queue a transport error
    pub fn push_error(&self, error: TransportError) -> &Self {
        self.push(MockReply::Error(error))
    }

    /// Reply used once the queue is drained
    pub fn set_fallback(&self, reply: MockReply) -> &Self {
        self.state.lock().fallback = Some(reply);
        self
    }

    /// Number of `send` invocations so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received so far, oldest first
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.state.lock().requests.clone()
    }

    fn next_reply(&self, request: TransportRequest) -> Option<MockReply> {
        let mut state = self.state.lock();
        state.requests.push(request);
        if let Some(reply) = state.replies.pop_front() {
            return Some(reply);
        }
        state.fallback.clone()
    }
}

async fn play(
    reply: MockReply,
    cancel: &CancellationToken,
) -> std::result::Result<TransportResponse, TransportError> {
    let mut reply = reply;
    loop {
        match reply {
            MockReply::Response(response) => return Ok(response),
            MockReply::Error(error) => return Err(error),
            MockReply::Delayed(delay, inner) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                    _ = tokio::time::sleep(delay) => reply = *inner,
                }
            }
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        request: TransportRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_reply(request) {
            Some(reply) => play(reply, &cancel).await,
            None => Err(TransportError::Other("no scripted reply".to_string())),
        }
    }
}
