// Duplex pub/sub channel.
//
// Every client envelope carries a fresh request id and the server's reply
// carries it back; replies are matched through the pending-request broker.
// Topic messages arrive unsolicited and go straight to the registry.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use stratus_transport::SocketConnector;
use stratus_wire::{Incoming, Outgoing, decode_incoming};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::config::RealtimeConfig;
use crate::error::{Error, Result};
use crate::handle::UnsubscribeHandle;
use crate::lifecycle::{ConnectionState, DisconnectHook, DisconnectHooks, Lifecycle, Session};
use crate::pending::PendingRequests;
use crate::registry::{Callback, SubscriptionRegistry};

/// A topic message delivered to socket subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketMessage {
    pub id: String,
    pub topic: String,
    pub created: String,
    pub data: Value,
}

/// Realtime pub/sub over a duplex socket.
///
/// Subscription keys are bare topic names. Dropping the channel stops the
/// connection and fails any request still waiting for its ack.
pub struct SocketChannel {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    connector: Arc<dyn SocketConnector>,
    registry: SubscriptionRegistry<SocketMessage>,
    pending: Arc<PendingRequests>,
    lifecycle: Lifecycle,
    hooks: DisconnectHooks,
    backoff: Backoff,
    path: String,
    connect_timeout: Duration,
    writer: Mutex<Option<Writer>>,
    next_connection: AtomicU64,
}

// Outbound queue of the live connection, tagged with its connection number.
struct Writer {
    connection: u64,
    tx: mpsc::Sender<String>,
}

// Tears down what one connection owns when its read loop future goes away:
// the writer it installed (unless a newer connection replaced it) and the
// requests sent on it. Requests of other connections are untouched.
struct ConnectionGuard<'a> {
    inner: &'a SocketInner,
    connection: u64,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        {
            let mut writer = self.inner.writer.lock();
            if writer
                .as_ref()
                .is_some_and(|writer| writer.connection == self.connection)
            {
                *writer = None;
            }
        }
        self.inner
            .pending
            .reject_connection(self.connection, |_| Error::ConnectionClosed);
    }
}

impl SocketChannel {
    pub fn new(connector: Arc<dyn SocketConnector>, config: &RealtimeConfig) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                connector,
                registry: SubscriptionRegistry::new(),
                pending: PendingRequests::new(config.ack_timeout),
                lifecycle: Lifecycle::new("socket"),
                hooks: DisconnectHooks::default(),
                backoff: config.socket_backoff.clone(),
                path: config.socket_path.clone(),
                connect_timeout: config.connect_timeout,
                writer: Mutex::new(None),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Register `callback` for `topic`. The first callback for a topic on an
    /// established connection also sends a `subscribe` request and waits for
    /// its ack; a failed ack is logged and the local registration kept, since
    /// the next reconnect replays it.
    pub async fn subscribe(&self, topic: &str, callback: Callback<SocketMessage>) -> UnsubscribeHandle {
        let inner = &self.inner;
        let first = inner.registry.add(topic, Arc::clone(&callback));
        inner.lifecycle.start(inner);
        if first && inner.lifecycle.is_ready() {
            inner.send_subscribe(topic).await;
        }

        let weak = Arc::downgrade(inner);
        let key = topic.to_string();
        UnsubscribeHandle::new(key.clone(), move || {
            async move {
                if let Some(inner) = weak.upgrade() {
                    let removed = inner.registry.remove_callback(&key, &callback);
                    inner.after_removal(removed.emptied).await;
                }
            }
            .boxed()
        })
    }

    /// `None` drops every subscription and closes the socket. `Some(topic)`
    /// drops the topic and tells the server, closing the socket if nothing
    /// is left.
    pub async fn unsubscribe(&self, topic: Option<&str>) {
        match topic {
            None => {
                self.inner.registry.clear();
                self.inner.disconnect().await;
            }
            Some(topic) => {
                let removed = self.inner.registry.remove_topic(topic);
                self.inner.after_removal(removed.emptied).await;
            }
        }
    }

    pub async fn unsubscribe_by_topic_and_listener(
        &self,
        topic: &str,
        callback: &Callback<SocketMessage>,
    ) {
        let removed = self.inner.registry.remove_listener(topic, callback);
        self.inner.after_removal(removed.emptied).await;
    }

    /// Publish `data` to `topic` and wait for the server's ack. Connects
    /// first if needed, bounded by the connect timeout.
    pub async fn publish(&self, topic: &str, data: Value) -> Result<Value> {
        self.ensure_connected(self.inner.connect_timeout).await?;
        let topic = topic.to_string();
        self.inner
            .request(move |request_id| Outgoing::Publish {
                topic,
                data,
                request_id,
            })
            .await
    }

    /// Round-trip a `ping` on the established connection.
    pub async fn ping(&self) -> Result<Value> {
        self.inner
            .request(|request_id| Outgoing::Ping { request_id })
            .await
    }

    /// Close the socket and fail outstanding requests with `ConnectionClosed`.
    /// Subscriptions stay registered.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    pub async fn ensure_connected(&self, timeout: Duration) -> Result<()> {
        self.inner.lifecycle.start(&self.inner);
        self.inner.lifecycle.wait_ready(timeout).await
    }

    pub fn on_disconnect(&self, hook: DisconnectHook) {
        self.inner.hooks.add(hook);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lifecycle.state()
    }

    pub fn client_id(&self) -> Option<String> {
        self.inner.lifecycle.client_id()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lifecycle.is_ready()
    }

    pub fn active_subscriptions(&self) -> Vec<String> {
        self.inner.registry.keys()
    }

    /// Requests still waiting for an ack.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.inner.lifecycle.abort();
        self.inner.pending.reject_all(|_| Error::ConnectionClosed);
    }
}

impl SocketInner {
    async fn request(&self, build: impl FnOnce(String) -> Outgoing) -> Result<Value> {
        let envelope = build(Uuid::new_v4().to_string());
        let text = envelope.encode().map_err(Error::Encode)?;
        // Registered under the writer lock so a closing connection either
        // sees this request and rejects it or has already left no writer.
        let (tx, ack) = {
            let writer = self.writer.lock();
            let writer = writer.as_ref().ok_or(Error::NotConnected)?;
            let ack = self.pending.register(writer.connection, envelope.request_id());
            (writer.tx.clone(), ack)
        };
        tx.send(text)
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        ack.wait().await
    }

    async fn send_subscribe(&self, topic: &str) {
        let outcome = self
            .request(|request_id| Outgoing::Subscribe {
                topic: topic.to_string(),
                request_id,
            })
            .await;
        match outcome {
            Ok(_) => {}
            // Replayed on the next ready.
            Err(err) if err.is_connection_error() => {
                debug!(topic, error = %err, "subscribe interrupted by connection loss");
            }
            Err(err) => warn!(topic, error = %err, "subscribe was not acknowledged"),
        }
    }

    async fn after_removal(&self, emptied: Vec<String>) {
        if emptied.is_empty() {
            return;
        }
        if self.registry.is_empty() {
            self.disconnect().await;
            return;
        }
        if !self.lifecycle.is_ready() {
            return;
        }
        let requests = emptied.into_iter().map(|topic| async move {
            let outcome = self
                .request(|request_id| Outgoing::Unsubscribe {
                    topic: topic.clone(),
                    request_id,
                })
                .await;
            if let Err(err) = outcome {
                debug!(topic = %topic, error = %err, "unsubscribe was not acknowledged");
            }
        });
        join_all(requests).await;
    }

    async fn disconnect(&self) {
        // The connection guard rejects requests of the connection being closed.
        let previous = self.lifecycle.shutdown(|| {}).await;
        if previous == ConnectionState::Ready {
            self.hooks.fire(&self.registry.keys());
        }
    }

    async fn replay(&self, topics: Vec<String>) {
        let requests = topics.iter().map(|topic| self.send_subscribe(topic));
        join_all(requests).await;
    }

    fn dispatch(self: &Arc<Self>, text: &str, tasks: &mut JoinSet<()>) {
        t_counter!("stratus_frames_total", "channel" => "socket").increment(1);
        let (envelope, raw) = match decode_incoming(text) {
            Ok(decoded) => decoded,
            Err(err) => {
                t_counter!("stratus_frames_dropped_total", "channel" => "socket").increment(1);
                debug!(error = %err, "dropping malformed envelope");
                return;
            }
        };
        match envelope {
            Incoming::Ready { client_id } => {
                self.lifecycle.mark_ready(client_id);
                let topics = self.registry.keys();
                if !topics.is_empty() {
                    let inner = Arc::clone(self);
                    tasks.spawn(async move { inner.replay(topics).await });
                }
            }
            Incoming::Message {
                id,
                topic,
                created,
                data,
            } => {
                let message = SocketMessage {
                    id,
                    topic,
                    created,
                    data,
                };
                if self.registry.deliver(&message.topic, &message) == 0 {
                    debug!(topic = %message.topic, "no subscribers for message");
                }
            }
            Incoming::Error {
                request_id: Some(request_id),
                message,
            } => {
                self.pending.reject(&request_id, Error::Server { message });
            }
            Incoming::Error {
                request_id: None,
                message,
            } => {
                debug!(message = %message, "dropping unrouted error envelope");
            }
            Incoming::Unknown => {
                debug!("ignoring envelope of unknown type");
            }
            ack => {
                if let Some(request_id) = ack.request_id() {
                    self.pending.resolve(request_id, raw);
                }
            }
        }
    }
}

#[async_trait]
impl Session for SocketInner {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    fn has_subscriptions(&self) -> bool {
        !self.registry.is_empty()
    }

    async fn run_connection(self: Arc<Self>) -> anyhow::Result<()> {
        let mut connection =
            tokio::time::timeout(self.connect_timeout, self.connector.connect(&self.path))
                .await
                .context("socket connect timed out")??;
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        *self.writer.lock() = Some(Writer {
            connection: connection_id,
            tx: connection.sender(),
        });
        let _guard = ConnectionGuard {
            inner: self.as_ref(),
            connection: connection_id,
        };
        debug!(connection = connection_id, "socket opened");

        // Connection-scoped work; dropped with this future on cancel.
        let mut tasks = JoinSet::new();
        while let Some(frame) = connection.recv().await {
            self.dispatch(&frame?, &mut tasks);
            while tasks.try_join_next().is_some() {}
        }
        Ok(())
    }

    fn connection_lost(&self, was_ready: bool) {
        if was_ready {
            self.hooks.fire(&self.registry.keys());
        }
    }
}
