// Realtime channel configuration: defaults, env, then an optional YAML file.
use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use stratus_transport::TransportConfig;
use stratus_wire::DEFAULT_MAX_LINE_BYTES;

use crate::backoff::{Backoff, SOCKET_DELAYS_MS, STREAM_DELAYS_MS};

pub(crate) const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8090";
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_STREAM_PATH: &str = "/api/realtime";
pub(crate) const DEFAULT_SOCKET_PATH: &str = "/api/pubsub";
pub(crate) const DEFAULT_SOCKET_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub base_url: String,
    /// Bound on establishing a connection and on `ensure_connected` waits
    /// issued internally (publish).
    pub connect_timeout: Duration,
    /// How long a correlated socket request waits for its ack.
    pub ack_timeout: Duration,
    pub stream_path: String,
    pub socket_path: String,
    pub stream_backoff: Backoff,
    pub socket_backoff: Backoff,
    /// Longest single stream line buffered before the connection is dropped.
    pub max_line_bytes: usize,
    pub socket_queue_depth: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            stream_backoff: Backoff::from_millis(&STREAM_DELAYS_MS),
            socket_backoff: Backoff::from_millis(&SOCKET_DELAYS_MS),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            socket_queue_depth: DEFAULT_SOCKET_QUEUE_DEPTH,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct RealtimeConfigOverride {
    base_url: Option<String>,
    connect_timeout_ms: Option<u64>,
    ack_timeout_ms: Option<u64>,
    stream_path: Option<String>,
    socket_path: Option<String>,
    stream_backoff_ms: Option<Vec<u64>>,
    socket_backoff_ms: Option<Vec<u64>>,
    max_line_bytes: Option<usize>,
    socket_queue_depth: Option<usize>,
}

impl RealtimeConfig {
    /// Defaults, then `STRATUS_*` env vars, then the YAML file at
    /// `config_path` or `STRATUS_REALTIME_CONFIG`.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("STRATUS_REALTIME_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("read realtime config: {path}"))?;
            let override_cfg: RealtimeConfigOverride =
                serde_yaml::from_str(&contents).context("parse realtime config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_string_env("STRATUS_BASE_URL") {
            config.base_url = value;
        }
        if let Some(value) = read_u64_env("STRATUS_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("STRATUS_ACK_TIMEOUT_MS") {
            config.ack_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_delays_env("STRATUS_STREAM_BACKOFF_MS") {
            config.stream_backoff = Backoff::from_millis(&value);
        }
        if let Some(value) = read_delays_env("STRATUS_SOCKET_BACKOFF_MS") {
            config.socket_backoff = Backoff::from_millis(&value);
        }
        if let Some(value) = read_usize_env("STRATUS_MAX_LINE_BYTES") {
            config.max_line_bytes = value;
        }
        if let Some(value) = read_usize_env("STRATUS_SOCKET_QUEUE_DEPTH") {
            config.socket_queue_depth = value;
        }
        config
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Transport settings for the default HTTP and socket implementations.
    pub fn transport_config(&self) -> TransportConfig {
        let mut transport = TransportConfig::new(self.base_url.as_str());
        transport.connect_timeout = self.connect_timeout;
        transport
    }
}

impl RealtimeConfigOverride {
    fn apply(&self, config: &mut RealtimeConfig) {
        if let Some(value) = &self.base_url
            && !value.is_empty()
        {
            config.base_url = value.clone();
        }
        if let Some(value) = self.connect_timeout_ms
            && value > 0
        {
            config.connect_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.ack_timeout_ms
            && value > 0
        {
            config.ack_timeout = Duration::from_millis(value);
        }
        if let Some(value) = &self.stream_path
            && !value.is_empty()
        {
            config.stream_path = value.clone();
        }
        if let Some(value) = &self.socket_path
            && !value.is_empty()
        {
            config.socket_path = value.clone();
        }
        if let Some(value) = &self.stream_backoff_ms
            && !value.is_empty()
        {
            config.stream_backoff = Backoff::from_millis(value);
        }
        if let Some(value) = &self.socket_backoff_ms
            && !value.is_empty()
        {
            config.socket_backoff = Backoff::from_millis(value);
        }
        if let Some(value) = self.max_line_bytes
            && value > 0
        {
            config.max_line_bytes = value;
        }
        if let Some(value) = self.socket_queue_depth
            && value > 0
        {
            config.socket_queue_depth = value;
        }
    }
}

fn read_string_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

// Comma-separated millisecond list; any unparsable entry discards the whole list.
fn read_delays_env(key: &str) -> Option<Vec<u64>> {
    let raw = std::env::var(key).ok()?;
    let delays = raw
        .split(',')
        .map(|part| part.trim().parse::<u64>().ok())
        .collect::<Option<Vec<u64>>>()?;
    (!delays.is_empty()).then_some(delays)
}
