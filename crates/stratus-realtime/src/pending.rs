// Request id -> single-shot completion cell, rejected on timeout.
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

struct PendingEntry {
    // Connection the request went out on.
    connection: u64,
    tx: oneshot::Sender<Result<Value>>,
    timer: JoinHandle<()>,
}

/// Correlates requests with their acknowledgements. Independent of the
/// envelope kind: anything with a request id can wait here.
///
/// Every entry leaves the map exactly once, through whichever of resolve,
/// reject, timeout, or the waiter being dropped comes first.
pub struct PendingRequests {
    entries: Mutex<HashMap<String, PendingEntry>>,
    timeout: Duration,
}

impl PendingRequests {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
        })
    }

    /// Track `request_id`, sent on `connection`, until it completes.
    pub fn register(self: &Arc<Self>, connection: u64, request_id: impl Into<String>) -> PendingAck {
        let request_id = request_id.into();
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock();
        // Spawned under the lock so an immediate expiry cannot run before the insert.
        let timer = {
            let broker = Arc::downgrade(self);
            let request_id = request_id.clone();
            let timeout = self.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(broker) = broker.upgrade() {
                    broker.expire(&request_id);
                }
            })
        };
        if let Some(previous) = entries.insert(
            request_id.clone(),
            PendingEntry {
                connection,
                tx,
                timer,
            },
        ) {
            previous.timer.abort();
        }
        drop(entries);
        PendingAck {
            request_id,
            rx,
            broker: Arc::downgrade(self),
        }
    }

    /// Complete `request_id` successfully. Unknown ids are a no-op.
    pub fn resolve(&self, request_id: &str, payload: Value) -> bool {
        self.complete(request_id, Ok(payload))
    }

    pub fn reject(&self, request_id: &str, error: Error) -> bool {
        self.complete(request_id, Err(error))
    }

    /// Reject every outstanding request and clear the broker.
    pub fn reject_all(&self, error: impl Fn(&str) -> Error) -> usize {
        let drained: Vec<(String, PendingEntry)> = self.entries.lock().drain().collect();
        Self::fail(drained, error)
    }

    /// Reject the requests sent on `connection`, leaving any others waiting.
    pub fn reject_connection(&self, connection: u64, error: impl Fn(&str) -> Error) -> usize {
        let drained: Vec<(String, PendingEntry)> = {
            let mut entries = self.entries.lock();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.connection == connection)
                .map(|(request_id, _)| request_id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|request_id| entries.remove_entry(&request_id))
                .collect()
        };
        Self::fail(drained, error)
    }

    fn fail(drained: Vec<(String, PendingEntry)>, error: impl Fn(&str) -> Error) -> usize {
        let count = drained.len();
        for (request_id, entry) in drained {
            entry.timer.abort();
            let _ = entry.tx.send(Err(error(&request_id)));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.lock().contains_key(request_id)
    }

    fn complete(&self, request_id: &str, outcome: Result<Value>) -> bool {
        let Some(entry) = self.entries.lock().remove(request_id) else {
            return false;
        };
        entry.timer.abort();
        let _ = entry.tx.send(outcome);
        true
    }

    fn expire(&self, request_id: &str) {
        let Some(entry) = self.entries.lock().remove(request_id) else {
            return;
        };
        t_counter!("stratus_ack_timeouts_total").increment(1);
        let _ = entry.tx.send(Err(Error::Timeout {
            request_id: request_id.to_string(),
        }));
    }

    fn discard(&self, request_id: &str) {
        if let Some(entry) = self.entries.lock().remove(request_id) {
            entry.timer.abort();
        }
    }
}

/// Waiter side of a registered request. Dropping it withdraws the request.
pub struct PendingAck {
    request_id: String,
    rx: oneshot::Receiver<Result<Value>>,
    broker: Weak<PendingRequests>,
}

impl PendingAck {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub async fn wait(mut self) -> Result<Value> {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }
}

impl Drop for PendingAck {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.discard(&self.request_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolve_completes_once() {
        let broker = PendingRequests::new(Duration::from_secs(10));
        let ack = broker.register(1, "r1");
        assert!(broker.resolve("r1", json!({"type": "published"})));
        assert!(!broker.resolve("r1", json!({})));
        assert!(!broker.reject("r1", Error::ConnectionClosed));
        assert_eq!(ack.wait().await.expect("ack")["type"], json!("published"));
        assert!(broker.is_empty());
    }

    #[tokio::test]
    async fn reject_carries_error() {
        let broker = PendingRequests::new(Duration::from_secs(10));
        let ack = broker.register(1, "r1");
        broker.reject(
            "r1",
            Error::Server {
                message: "denied".to_string(),
            },
        );
        match ack.wait().await {
            Err(Error::Server { message }) => assert_eq!(message, "denied"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(broker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_and_removes_entry() {
        let broker = PendingRequests::new(Duration::from_secs(10));
        let ack = broker.register(1, "r1");
        assert!(broker.contains("r1"));
        match ack.wait().await {
            Err(Error::Timeout { request_id }) => assert_eq!(request_id, "r1"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(broker.is_empty());
    }

    #[tokio::test]
    async fn reject_all_clears_broker() {
        let broker = PendingRequests::new(Duration::from_secs(10));
        let first = broker.register(1, "a");
        let second = broker.register(1, "b");
        assert_eq!(broker.reject_all(|_| Error::ConnectionClosed), 2);
        assert!(matches!(first.wait().await, Err(Error::ConnectionClosed)));
        assert!(matches!(second.wait().await, Err(Error::ConnectionClosed)));
        assert!(broker.is_empty());
    }

    #[tokio::test]
    async fn dropped_waiter_withdraws_request() {
        let broker = PendingRequests::new(Duration::from_secs(10));
        let ack = broker.register(1, "r1");
        drop(ack);
        assert!(broker.is_empty());
        assert!(!broker.resolve("r1", json!({})));
    }

    #[tokio::test]
    async fn reject_connection_spares_newer_connection() {
        let broker = PendingRequests::new(Duration::from_secs(10));
        let old = broker.register(1, "old");
        let new = broker.register(2, "new");
        assert_eq!(broker.reject_connection(1, |_| Error::ConnectionClosed), 1);
        assert!(matches!(old.wait().await, Err(Error::ConnectionClosed)));
        assert!(broker.contains("new"));
        assert!(broker.resolve("new", json!({"type": "pong"})));
        assert_eq!(new.wait().await.expect("ack")["type"], json!("pong"));
    }
}
