// Tail realtime topics and print every delivered event as one JSON line.
mod observability;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde_json::{Value, json};
use stratus_realtime::{
    RealtimeConfig, SocketChannel, SocketMessage, StreamChannel, UnsubscribeHandle, callback,
};
use stratus_transport::{ReqwestTransport, StaticToken, TungsteniteConnector};
use tracing::{info, warn};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Channel {
    Stream,
    Socket,
}

#[derive(Parser, Debug)]
#[command(name = "stratus-tail")]
#[command(about = "Print realtime events for one or more topics")]
struct Args {
    /// Channel to subscribe through
    #[arg(long, value_enum, default_value = "stream")]
    channel: Channel,

    /// Base URL of the server (overrides config)
    #[arg(long, env = "STRATUS_BASE_URL")]
    base_url: Option<String>,

    /// Auth token sent with every request
    #[arg(long, env = "STRATUS_TOKEN")]
    token: Option<String>,

    /// Optional YAML config file
    #[arg(long)]
    config: Option<String>,

    /// Topics to subscribe to
    #[arg(required = true)]
    topics: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    observability::init_observability();
    let args = Args::parse();

    let mut config = RealtimeConfig::from_env_or_yaml(args.config.as_deref())?;
    if let Some(base_url) = args.base_url.clone() {
        config = config.with_base_url(base_url);
    }
    let transport = config
        .transport_config()
        .with_token(Arc::new(StaticToken::new(args.token.clone().unwrap_or_default())));
    info!(
        base_url = %config.base_url,
        channel = ?args.channel,
        topics = ?args.topics,
        "starting tail"
    );

    match args.channel {
        Channel::Stream => {
            let http = ReqwestTransport::new(transport).context("build http transport")?;
            let channel = StreamChannel::new(Arc::new(http), &config);
            channel.on_disconnect(Arc::new(|keys: &[String]| {
                warn!(subscriptions = keys.len(), "stream disconnected");
            }));
            let mut handles = Vec::with_capacity(args.topics.len());
            for topic in &args.topics {
                let key = topic.clone();
                let handle = channel
                    .subscribe(
                        topic,
                        callback(move |payload: &Value| print_event(&key, payload)),
                    )
                    .await?;
                handles.push(handle);
            }
            shutdown.await;
            release(handles).await;
            channel.disconnect().await;
        }
        Channel::Socket => {
            let connector =
                TungsteniteConnector::new(transport).with_queue_depth(config.socket_queue_depth);
            let channel = SocketChannel::new(Arc::new(connector), &config);
            channel.on_disconnect(Arc::new(|keys: &[String]| {
                warn!(subscriptions = keys.len(), "socket disconnected");
            }));
            let mut handles = Vec::with_capacity(args.topics.len());
            for topic in &args.topics {
                let handle = channel
                    .subscribe(
                        topic,
                        callback(|message: &SocketMessage| {
                            print_event(
                                &message.topic,
                                &json!({
                                    "id": message.id,
                                    "created": message.created,
                                    "data": message.data,
                                }),
                            )
                        }),
                    )
                    .await;
                handles.push(handle);
            }
            shutdown.await;
            release(handles).await;
            channel.disconnect().await;
        }
    }
    info!("tail stopped");
    Ok(())
}

async fn release(handles: Vec<UnsubscribeHandle>) {
    for handle in handles {
        handle.unsubscribe().await;
    }
}

fn print_event(topic: &str, payload: &Value) {
    println!("{}", json!({ "topic": topic, "payload": payload }));
}
