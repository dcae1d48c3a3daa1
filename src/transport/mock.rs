use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Request, Response, Transport};
use crate::error::TransportError;

type Reply = Result<Response, TransportError>;

/// Requests kept for inspection; older ones are forgotten
const HISTORY_LIMIT: usize = 256;

#[derive(Debug)]
struct MockState {
    queued: HashMap<String, VecDeque<Reply>>,
    per_url: HashMap<String, Reply>,
    default_reply: Reply,
    recent: VecDeque<Request>,
    sent: usize,
}

/// Scripted transport used for dry runs and testing.
///
/// Replies are picked per URL: queued one-shot replies first, then a
/// persistent per-URL reply, then the default. Clones share state so a test
/// can keep a handle after moving the transport into a distributor.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Answers every request with `200 {}`
    #[must_use]
    pub fn new() -> Self {
        Self::always(Ok(Response::new(200, "{}")))
    }

    #[must_use]
    pub fn always(reply: Reply) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                queued: HashMap::new(),
                per_url: HashMap::new(),
                default_reply: reply,
                recent: VecDeque::new(),
                sent: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a one-shot reply for `url`
    pub fn push(&self, url: &str, reply: Reply) {
        self.lock()
            .queued
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Reply to every request for `url` with `reply` once its queue is empty
    pub fn set_reply(&self, url: &str, reply: Reply) {
        self.lock().per_url.insert(url.to_string(), reply);
    }

    /// Requests sent over the transport's lifetime
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.lock().sent
    }

    /// The most recent requests, oldest first
    #[must_use]
    pub fn recent_calls(&self) -> Vec<Request> {
        self.lock().recent.iter().cloned().collect()
    }

    /// Requests for `url` among the recent ones
    #[must_use]
    pub fn calls_to(&self, url: &str) -> usize {
        self.lock().recent.iter().filter(|c| c.url == url).count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &Request) -> Result<Response, TransportError> {
        let mut state = self.lock();
        state.sent += 1;
        if state.recent.len() == HISTORY_LIMIT {
            state.recent.pop_front();
        }
        state.recent.push_back(request.clone());
        let queued = state
            .queued
            .get_mut(&request.url)
            .and_then(VecDeque::pop_front);
        match queued {
            Some(reply) => reply,
            None => state
                .per_url
                .get(&request.url)
                .unwrap_or(&state.default_reply)
                .clone(),
        }
    }
}
