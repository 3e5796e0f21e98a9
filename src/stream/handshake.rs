//! Handshake Promises
//!
//! Single responsibility: Correlate a greet with the join that asked for it.
//!
//! Each connect attempt registers a one-shot promise under its join id and
//! waits on it with a timeout. The greet handler resolves the promise; a greet
//! nobody is waiting for (late, or for a join that already timed out) is
//! discarded and never revives a failed attempt.

use std::collections::HashMap;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};

use super::envelope::GreetEvent;

/// Pending handshakes, keyed by join envelope id.
#[derive(Default)]
pub struct HandshakeRegistry {
    pending: Mutex<HashMap<String, oneshot::Sender<GreetEvent>>>,
}

impl HandshakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a promise for `join_id`.
    pub async fn register(&self, join_id: &str) -> oneshot::Receiver<GreetEvent> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().await;
        if pending.insert(join_id.to_string(), tx).is_some() {
            debug!(join_id = %join_id, "Replaced an existing handshake promise");
        }
        rx
    }

    /// Resolve the promise a greet answers. Returns false if nobody was waiting.
    pub async fn complete(&self, greet: GreetEvent) -> bool {
        let join_id = greet.join_id().to_string();
        let waiter = self.pending.lock().await.remove(&join_id);

        match waiter {
            Some(tx) => {
                if tx.send(greet).is_err() {
                    // Receiver dropped between timeout and removal
                    info!(join_id = %join_id, "Greet arrived as handshake gave up, discarding");
                    return false;
                }
                true
            }
            None => {
                info!(join_id = %join_id, "Greet for unknown or expired join, discarding");
                false
            }
        }
    }

    /// Drop the promise for `join_id` without resolving it.
    pub async fn cancel(&self, join_id: &str) -> bool {
        self.pending.lock().await.remove(join_id).is_some()
    }

    /// Drop every pending promise; their waiters see a closed channel.
    pub async fn fail_all(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        pending.clear();
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
