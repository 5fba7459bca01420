// Response delivery keyed by notify id

use crate::events::OutboundResponse;
use anyhow::Result;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

/// Where the dispatcher delivers event responses
#[async_trait::async_trait]
pub trait ResponseChannel: Send + Sync {
    async fn send(&self, response: OutboundResponse) -> Result<()>;
}

/// How long an unclaimed response is kept
pub const DEFAULT_BUFFER_TTL: Duration = Duration::from_secs(300);

/// Unclaimed responses kept before the oldest are evicted
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

#[derive(Default)]
struct NotifyState {
    waiters: HashMap<String, oneshot::Sender<OutboundResponse>>,
    buffered: HashMap<String, (Instant, OutboundResponse)>,
}

impl NotifyState {
    /// A waiter whose receiver is still alive
    fn has_live_waiter(&self, notify_id: &str) -> bool {
        self.waiters
            .get(notify_id)
            .is_some_and(|tx| !tx.is_closed())
    }

    fn claim(&mut self, notify_id: &str, ttl: Duration) -> Option<OutboundResponse> {
        let (buffered_at, response) = self.buffered.remove(notify_id)?;
        (buffered_at.elapsed() < ttl).then_some(response)
    }

    fn evict(&mut self, ttl: Duration, capacity: usize) {
        let before = self.buffered.len();
        self.buffered
            .retain(|_, (buffered_at, _)| buffered_at.elapsed() < ttl);
        self.waiters.retain(|_, tx| !tx.is_closed());

        if self.buffered.len() > capacity {
            let mut by_age: Vec<(Instant, String)> = self
                .buffered
                .iter()
                .map(|(id, (buffered_at, _))| (*buffered_at, id.clone()))
                .collect();
            by_age.sort();
            let excess = self.buffered.len() - capacity;
            for (_, id) in by_age.into_iter().take(excess) {
                self.buffered.remove(&id);
            }
        }

        let dropped = before - self.buffered.len();
        if dropped > 0 {
            tracing::debug!("Dropped {} unclaimed response(s)", dropped);
        }
    }
}

/// In-process response channel. A response sent before anyone waits for it
/// is buffered until claimed, expired or evicted by newer responses.
pub struct NotifyHub {
    state: Mutex<NotifyState>,
    ttl: Duration,
    capacity: usize,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::with_limits(DEFAULT_BUFFER_TTL, DEFAULT_BUFFER_CAPACITY)
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(ttl: Duration, capacity: usize) -> Self {
        Self {
            state: Mutex::new(NotifyState::default()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Claim a response without waiting
    pub async fn take(&self, notify_id: &str) -> Option<OutboundResponse> {
        self.state.lock().await.claim(notify_id, self.ttl)
    }

    /// Wait up to `timeout` for the response to `notify_id`.
    ///
    /// Only one caller may wait on an id at a time; a second caller gets
    /// `None` right away and the first keeps its claim.
    pub async fn wait(&self, notify_id: &str, timeout: Duration) -> Option<OutboundResponse> {
        let rx = {
            let mut state = self.state.lock().await;
            if let Some(response) = state.claim(notify_id, self.ttl) {
                return Some(response);
            }
            if state.has_live_waiter(notify_id) {
                tracing::warn!("Response {} already has a waiter", notify_id);
                return None;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.insert(notify_id.to_string(), tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Some(response),
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::debug!("Timed out waiting for response {}", notify_id);
                let mut state = self.state.lock().await;
                // Our receiver is gone; leave a newer waiter in place
                if !state.has_live_waiter(notify_id) {
                    state.waiters.remove(notify_id);
                }
                // Delivered between the timeout firing and taking the lock
                state.claim(notify_id, self.ttl)
            }
        }
    }

    /// Responses nobody has claimed yet
    pub async fn buffered_count(&self) -> usize {
        self.state.lock().await.buffered.len()
    }
}

#[async_trait::async_trait]
impl ResponseChannel for NotifyHub {
    async fn send(&self, response: OutboundResponse) -> Result<()> {
        let mut state = self.state.lock().await;
        let notify_id = response.notify_id.clone();

        let response = match state.waiters.remove(&notify_id) {
            Some(waiter) => match waiter.send(response) {
                Ok(()) => return Ok(()),
                Err(unclaimed) => unclaimed,
            },
            None => response,
        };

        let entry = (Instant::now(), response);
        if state.buffered.insert(notify_id.clone(), entry).is_some() {
            tracing::warn!("Replaced unclaimed response for {}", notify_id);
        }
        state.evict(self.ttl, self.capacity);
        Ok(())
    }
}
