// Duplex text socket and the tokio-tungstenite connector.
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::TransportConfig;
use crate::endpoint::socket_url;

const DEFAULT_QUEUE_DEPTH: usize = 256;

/// An established duplex connection carrying one text frame per message.
///
/// Writes go through a bounded queue drained by a single writer task, so
/// callers on any task can send without sharing the sink. Dropping the
/// connection stops the pump tasks and releases the socket.
pub struct SocketConnection {
    outgoing: mpsc::Sender<String>,
    incoming: mpsc::Receiver<Result<String>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SocketConnection {
    pub fn new(outgoing: mpsc::Sender<String>, incoming: mpsc::Receiver<Result<String>>) -> Self {
        Self {
            outgoing,
            incoming,
            tasks: Vec::new(),
        }
    }

    fn with_tasks(mut self, tasks: Vec<JoinHandle<()>>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn sender(&self) -> mpsc::Sender<String> {
        self.outgoing.clone()
    }

    /// Next inbound frame. `None` means the peer closed the connection.
    pub async fn recv(&mut self) -> Option<Result<String>> {
        self.incoming.recv().await
    }
}

impl Drop for SocketConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, path: &str) -> Result<SocketConnection>;
}

pub struct TungsteniteConnector {
    config: TransportConfig,
    queue_depth: usize,
}

impl TungsteniteConnector {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }
}

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(&self, path: &str) -> Result<SocketConnection> {
        let mut query = Vec::new();
        if let Some(token) = self.config.token.token() {
            query.push(("token".to_string(), token));
        }
        let url = socket_url(&self.config.base_url, path, &query)?;
        let (socket, _) = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .context("socket connect timed out")?
        .with_context(|| format!("socket connect: {path}"))?;
        let (mut sink, mut stream) = socket.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.queue_depth);
        let (in_tx, in_rx) = mpsc::channel::<Result<String>>(self.queue_depth);

        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(err) = sink.send(Message::Text(text.into())).await {
                    debug!(error = %err, "socket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            loop {
                let item = match stream.next().await {
                    Some(Ok(Message::Text(text))) => Ok(text.to_string()),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "socket closed by peer");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => Err(anyhow::Error::new(err).context("socket read")),
                    None => break,
                };
                let failed = item.is_err();
                if in_tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(SocketConnection::new(out_tx, in_rx).with_tasks(vec![writer, reader]))
    }
}
