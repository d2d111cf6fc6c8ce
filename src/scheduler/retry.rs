use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Delayed re-attempts keyed by message id. At most one retry per id is
/// outstanding at any time.
#[derive(Clone, Default)]
pub struct RetryQueue {
    pending: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        // A poisoned map is still structurally valid.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `task` after `delay`. Returns false without scheduling anything if a
    /// retry for `message_id` is already waiting.
    pub fn schedule(&self, message_id: u64, delay: Duration, task: BoxFuture<'static, ()>) -> bool {
        let mut pending = self.lock();
        if pending.get(&message_id).is_some_and(|h| !h.is_finished()) {
            warn!("Retry for message {} already scheduled; ignoring", message_id);
            return false;
        }

        let queue = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Leave the table before running so the task may schedule its successor.
            queue.lock().remove(&message_id);
            task.await;
        });
        pending.insert(message_id, handle);
        debug!("Retry for message {} scheduled in {:?}", message_id, delay);
        true
    }

    #[cfg(test)]
    pub fn is_pending(&self, message_id: u64) -> bool {
        self.lock()
            .get(&message_id)
            .is_some_and(|h| !h.is_finished())
    }

    pub fn len(&self) -> usize {
        self.lock().values().filter(|h| !h.is_finished()).count()
    }

    /// Wait until no retries are outstanding, including ones scheduled while waiting.
    #[cfg(test)]
    pub async fn drain(&self) {
        loop {
            let next = {
                let mut pending = self.lock();
                let id = pending.keys().next().copied();
                id.and_then(|id| pending.remove(&id))
            };
            match next {
                Some(handle) => {
                    if let Err(e) = handle.await {
                        warn!("Retry task ended abnormally: {}", e);
                    }
                }
                None => break,
            }
        }
    }

    /// Drop every outstanding retry. Their bytes are not persisted, so the
    /// messages are picked up again from the stored cursor after a restart.
    pub fn abort_all(&self) -> usize {
        let mut pending = self.lock();
        let count = pending.len();
        for (_, handle) in pending.drain() {
            handle.abort();
        }
        count
    }
}
