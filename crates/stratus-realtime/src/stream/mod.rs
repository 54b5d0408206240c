// Server-push channel.
//
// One long-lived GET delivers frames tagged with a topic key. The server
// learns which keys this client wants through a separate POST carrying the
// full key set, sent whenever the set changes and after every (re)connect.
mod frames;
mod key;

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use stratus_transport::{HttpRequest, HttpTransport};
use stratus_wire::{CONNECT_EVENT, StreamFrame};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::config::RealtimeConfig;
use crate::error::Result;
use crate::handle::UnsubscribeHandle;
use crate::lifecycle::{ConnectionState, DisconnectHook, DisconnectHooks, Lifecycle, Session};
use crate::registry::{Callback, SubscriptionRegistry};

pub use key::{SubscribeOptions, topic_key};

/// Realtime subscriptions over a server-push event stream.
///
/// The connection opens on the first subscribe and closes once the last
/// subscription is removed. Dropping the channel stops the connection.
pub struct StreamChannel {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    transport: Arc<dyn HttpTransport>,
    registry: SubscriptionRegistry<Value>,
    lifecycle: Lifecycle,
    hooks: DisconnectHooks,
    backoff: Backoff,
    path: String,
    connect_timeout: Duration,
    max_line_bytes: usize,
    last_event_id: Mutex<Option<String>>,
}

impl StreamChannel {
    pub fn new(transport: Arc<dyn HttpTransport>, config: &RealtimeConfig) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                transport,
                registry: SubscriptionRegistry::new(),
                lifecycle: Lifecycle::new("stream"),
                hooks: DisconnectHooks::default(),
                backoff: config.stream_backoff.clone(),
                path: config.stream_path.clone(),
                connect_timeout: config.connect_timeout,
                max_line_bytes: config.max_line_bytes,
                last_event_id: Mutex::new(None),
            }),
        }
    }

    pub async fn subscribe(&self, topic: &str, callback: Callback<Value>) -> Result<UnsubscribeHandle> {
        self.subscribe_with_options(topic, &SubscribeOptions::default(), callback)
            .await
    }

    /// Register `callback` under the key derived from `topic` and `options`
    /// and make sure the stream is connecting. When the key is new and the
    /// stream is already established, the updated key set is submitted
    /// before returning.
    pub async fn subscribe_with_options(
        &self,
        topic: &str,
        options: &SubscribeOptions,
        callback: Callback<Value>,
    ) -> Result<UnsubscribeHandle> {
        let key = topic_key(topic, options)?;
        let inner = &self.inner;
        let first = inner.registry.add(&key, Arc::clone(&callback));
        inner.lifecycle.start(inner);
        if first && let Some(client_id) = inner.lifecycle.client_id() {
            inner.submit(&client_id, inner.registry.keys()).await;
        }

        let weak = Arc::downgrade(inner);
        let handle_key = key.clone();
        Ok(UnsubscribeHandle::new(handle_key, move || {
            async move {
                if let Some(inner) = weak.upgrade() {
                    let removed = inner.registry.remove_callback(&key, &callback);
                    if !removed.emptied.is_empty() {
                        inner.after_removal().await;
                    }
                }
            }
            .boxed()
        }))
    }

    /// `None` drops every subscription and closes the stream. `Some(topic)`
    /// drops the topic's keys, with or without options.
    pub async fn unsubscribe(&self, topic: Option<&str>) {
        match topic {
            None => {
                self.inner.registry.clear();
                self.inner.disconnect().await;
            }
            Some(topic) => {
                if self.inner.registry.remove_topic(topic).changed {
                    self.inner.after_removal().await;
                }
            }
        }
    }

    /// Drop every key starting with `prefix`.
    pub async fn unsubscribe_by_prefix(&self, prefix: &str) {
        if self.inner.registry.remove_by_prefix(prefix).changed {
            self.inner.after_removal().await;
        }
    }

    /// Drop `callback` from every key of `topic`.
    pub async fn unsubscribe_by_topic_and_listener(&self, topic: &str, callback: &Callback<Value>) {
        let removed = self.inner.registry.remove_listener(topic, callback);
        if !removed.emptied.is_empty() {
            self.inner.after_removal().await;
        }
    }

    /// Close the stream. Subscriptions stay registered; the next subscribe or
    /// `ensure_connected` reconnects and replays them.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    /// Start connecting if needed and wait until the server confirms the
    /// stream, failing with `NotConnected` after `timeout`.
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
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.inner.lifecycle.abort();
    }
}

impl StreamInner {
    async fn submit(&self, client_id: &str, keys: Vec<String>) {
        let request = HttpRequest::post(
            self.path.as_str(),
            json!({ "clientId": client_id, "subscriptions": keys }),
        );
        if let Err(err) = self.transport.send(request).await {
            warn!(client_id, error = %format!("{err:#}"), "failed to submit stream subscriptions");
        }
    }

    async fn after_removal(self: &Arc<Self>) {
        if self.registry.is_empty() {
            self.disconnect().await;
        } else if let Some(client_id) = self.lifecycle.client_id() {
            self.submit(&client_id, self.registry.keys()).await;
        }
    }

    async fn disconnect(&self) {
        let previous = self
            .lifecycle
            .shutdown(|| *self.last_event_id.lock() = None)
            .await;
        if previous == ConnectionState::Ready {
            self.hooks.fire(&self.registry.keys());
        }
    }

    fn dispatch(self: &Arc<Self>, frame: StreamFrame, tasks: &mut JoinSet<()>) {
        t_counter!("stratus_frames_total", "channel" => "stream").increment(1);
        if !frame.id.is_empty() {
            *self.last_event_id.lock() = Some(frame.id.clone());
        }
        if frame.event == CONNECT_EVENT {
            let Some(client_id) = connect_client_id(&frame) else {
                t_counter!("stratus_frames_dropped_total", "channel" => "stream").increment(1);
                debug!("connect frame without client id");
                return;
            };
            self.lifecycle.mark_ready(client_id.clone());
            let keys = self.registry.keys();
            if !keys.is_empty() {
                let inner = Arc::clone(self);
                tasks.spawn(async move { inner.submit(&client_id, keys).await });
            }
            return;
        }
        let payload = decode_payload(&frame.data);
        if self.registry.deliver(&frame.event, &payload) == 0 {
            debug!(event = %frame.event, "no subscribers for frame");
        }
    }
}

#[async_trait]
impl Session for StreamInner {
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
        let mut request = HttpRequest::get(self.path.as_str())
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-store");
        let last_event_id = self.last_event_id.lock().clone();
        if let Some(id) = last_event_id {
            request = request.header("Last-Event-ID", id);
        }
        let body = tokio::time::timeout(self.connect_timeout, self.transport.open_stream(request))
            .await
            .context("stream connect timed out")??;
        debug!("stream opened");

        // Connection-scoped work; dropped with this future on cancel.
        let mut tasks = JoinSet::new();
        let mut frames = pin!(frames::frames(body, self.max_line_bytes));
        while let Some(frame) = frames.next().await {
            self.dispatch(frame?, &mut tasks);
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

fn connect_client_id(frame: &StreamFrame) -> Option<String> {
    let from_data = serde_json::from_str::<Value>(&frame.data)
        .ok()
        .and_then(|data| data.get("clientId")?.as_str().map(str::to_string))
        .filter(|id| !id.is_empty());
    from_data.or_else(|| (!frame.id.is_empty()).then(|| frame.id.clone()))
}

// Non-JSON data is wrapped as `{"data": <raw text>}`.
fn decode_payload(data: &str) -> Value {
    serde_json::from_str(data).unwrap_or_else(|_| json!({ "data": data }))
}
