// Transport contract consumed by the realtime layer.
//
// The realtime channels only need three things from the outside world: a way
// to send a request, a way to open a long-lived response body, and a way to
// open a duplex text socket. Each is a trait here with a default
// implementation on reqwest or tokio-tungstenite.
pub mod auth;
pub mod endpoint;
pub mod http;
pub mod socket;

use std::sync::Arc;
use std::time::Duration;

pub use auth::{StaticToken, TokenSource};
pub use endpoint::{build_url, socket_url};
pub use http::{ByteStream, HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport};
pub use socket::{SocketConnection, SocketConnector, TungsteniteConnector};

/// Shared settings for both transports.
///
/// ```
/// use stratus_transport::TransportConfig;
///
/// let config = TransportConfig::new("http://127.0.0.1:8090");
/// assert_eq!(config.lang, "en-US");
/// assert!(config.token.token().is_none());
/// ```
#[derive(Clone)]
pub struct TransportConfig {
    pub base_url: String,
    pub lang: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub token: Arc<dyn TokenSource>,
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: Arc<dyn TokenSource>) -> Self {
        self.token = token;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8090".to_string(),
            lang: "en-US".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            token: Arc::new(StaticToken::none()),
        }
    }
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field("base_url", &self.base_url)
            .field("lang", &self.lang)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}
