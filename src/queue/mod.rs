use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};

use nanoid::nanoid;
use tokio::{
    sync::{Mutex, Notify},
    time::Instant,
};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    NotExists,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotExists => write!(f, "queue doesn't exist"),
        }
    }
}

impl std::error::Error for QueueError {}

/// A message leased to a consumer. The receipt handle identifies this
/// particular delivery; acknowledging with a stale handle after the
/// visibility timeout lapsed is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub receipt_handle: String,
    pub body: String,
}

struct InflightMessage {
    body: String,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<String>,
    inflight: HashMap<String, InflightMessage>,
    deleted: bool,
}

struct Queue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Queue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }
}

/// At-least-once delivery queues with visibility timeouts. Messages stay
/// inflight until acknowledged; an unacknowledged message returns to the
/// ready list once its visibility deadline passes and is delivered again
/// under a fresh receipt handle.
pub struct QueueManager {
    queues: Mutex<HashMap<String, Arc<Queue>>>,
}

impl QueueManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
        })
    }

    /// Idempotent; creating a queue that exists keeps its messages.
    pub async fn create_queue(&self, name: &str) {
        let mut queues = self.queues.lock().await;
        queues.entry(name.to_string()).or_insert_with(Queue::new);
    }

    /// Idempotent; deleting an unknown queue is not an error. Blocked
    /// receivers wake and observe the deletion.
    pub async fn delete_queue(&self, name: &str) {
        let queue = {
            let mut queues = self.queues.lock().await;
            queues.remove(name)
        };
        if let Some(queue) = queue {
            let mut state = queue.state.lock().await;
            state.deleted = true;
            state.ready.clear();
            state.inflight.clear();
            queue.notify.notify_waiters();
        }
    }

    async fn get_queue(&self, name: &str) -> Result<Arc<Queue>, QueueError> {
        let queues = self.queues.lock().await;
        queues.get(name).cloned().ok_or(QueueError::NotExists)
    }

    pub async fn send(&self, name: &str, body: String) -> Result<(), QueueError> {
        let queue = self.get_queue(name).await?;
        let mut state = queue.state.lock().await;
        state.ready.push_back(body);
        queue.notify.notify_waiters();
        Ok(())
    }

    /// Deliver `body` after `delay`. The message is dropped if the queue
    /// goes away in the meantime.
    pub async fn send_delayed(
        self: &Arc<Self>,
        name: &str,
        body: String,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let queue = self.get_queue(name).await?;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = queue.state.lock().await;
            if state.deleted {
                debug!("dropping delayed message for a deleted queue");
                return;
            }
            state.ready.push_back(body);
            queue.notify.notify_waiters();
        });
        Ok(())
    }

    /// Long-poll receive. Returns up to `max` messages, waiting up to
    /// `wait` for the first one; an empty vec means the wait elapsed.
    /// Received messages become invisible for `visibility`.
    pub async fn receive(
        &self,
        name: &str,
        max: usize,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let queue = self.get_queue(name).await?;
        let deadline = Instant::now() + wait;
        loop {
            {
                let mut state = queue.state.lock().await;
                if state.deleted {
                    return Err(QueueError::NotExists);
                }
                Self::requeue_expired(&mut state);
                if !state.ready.is_empty() {
                    let mut messages = Vec::new();
                    while messages.len() < max {
                        let Some(body) = state.ready.pop_front() else {
                            break;
                        };
                        let receipt_handle = nanoid!();
                        state.inflight.insert(
                            receipt_handle.clone(),
                            InflightMessage {
                                body: body.clone(),
                                deadline: Instant::now() + visibility,
                            },
                        );
                        messages.push(QueueMessage {
                            receipt_handle,
                            body,
                        });
                    }
                    return Ok(messages);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            // Wake periodically so inflight messages whose visibility
            // lapsed get redelivered even without new sends.
            let wake = (deadline - now).min(Duration::from_millis(100));
            let _ = tokio::time::timeout(wake, queue.notify.notified()).await;
        }
    }

    /// Acknowledge a delivery. A receipt whose message was already
    /// redelivered no longer resolves; that is the at-least-once tradeoff
    /// and callers must dedup on message content.
    pub async fn delete_message(&self, name: &str, receipt_handle: &str) -> Result<(), QueueError> {
        let queue = self.get_queue(name).await?;
        let mut state = queue.state.lock().await;
        state.inflight.remove(receipt_handle);
        Ok(())
    }

    fn requeue_expired(state: &mut QueueState) {
        let now = Instant::now();
        let expired: Vec<String> = state
            .inflight
            .iter()
            .filter(|(_, msg)| msg.deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some(msg) = state.inflight.remove(&receipt) {
                state.ready.push_back(msg.body);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_receive_ack() {
        let queues = QueueManager::new();
        queues.create_queue("q1").await;
        queues.send("q1", "hello".to_string()).await.unwrap();

        let messages = queues
            .receive("q1", 10, Duration::from_secs(1), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "hello");

        queues
            .delete_message("q1", &messages[0].receipt_handle)
            .await
            .unwrap();

        let messages = queues
            .receive("q1", 10, Duration::from_millis(50), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_unacked_message_is_redelivered() {
        let queues = QueueManager::new();
        queues.create_queue("q1").await;
        queues.send("q1", "m1".to_string()).await.unwrap();

        let first = queues
            .receive("q1", 10, Duration::from_secs(1), Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = queues
            .receive("q1", 10, Duration::from_secs(2), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].body, "m1");
        assert_ne!(second[0].receipt_handle, first[0].receipt_handle);
    }

    #[tokio::test]
    async fn test_receive_unblocks_on_send() {
        let queues = QueueManager::new();
        queues.create_queue("q1").await;

        let receiver = {
            let queues = queues.clone();
            tokio::spawn(async move {
                queues
                    .receive("q1", 1, Duration::from_secs(5), Duration::from_secs(30))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queues.send("q1", "late".to_string()).await.unwrap();

        let messages = receiver.await.unwrap().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "late");
    }

    #[tokio::test]
    async fn test_deleted_queue_fails_receivers() {
        let queues = QueueManager::new();
        queues.create_queue("q1").await;

        let receiver = {
            let queues = queues.clone();
            tokio::spawn(async move {
                queues
                    .receive("q1", 1, Duration::from_secs(5), Duration::from_secs(30))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queues.delete_queue("q1").await;

        assert_eq!(receiver.await.unwrap(), Err(QueueError::NotExists));
        assert_eq!(
            queues.send("q1", "x".to_string()).await,
            Err(QueueError::NotExists)
        );
    }

    #[tokio::test]
    async fn test_create_and_delete_are_idempotent() {
        let queues = QueueManager::new();
        queues.create_queue("q1").await;
        queues.send("q1", "keep".to_string()).await.unwrap();
        queues.create_queue("q1").await;

        let messages = queues
            .receive("q1", 10, Duration::from_secs(1), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);

        queues.delete_queue("q1").await;
        queues.delete_queue("q1").await;
    }

    #[tokio::test]
    async fn test_delayed_send() {
        let queues = QueueManager::new();
        queues.create_queue("q1").await;
        queues
            .send_delayed("q1", "later".to_string(), Duration::from_millis(50))
            .await
            .unwrap();

        let messages = queues
            .receive("q1", 10, Duration::from_millis(10), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(messages.is_empty());

        let messages = queues
            .receive("q1", 10, Duration::from_secs(2), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "later");
    }
}
