// JSON envelopes exchanged over the duplex socket, one per text frame.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Client-to-server envelopes. Every variant carries a request id so the
/// server's reply can be matched back to the caller.
///
/// ```
/// use stratus_wire::Outgoing;
///
/// let envelope = Outgoing::Subscribe {
///     topic: "chat".to_string(),
///     request_id: "r1".to_string(),
/// };
/// let text = envelope.encode().expect("encode");
/// assert_eq!(text, r#"{"type":"subscribe","topic":"chat","requestId":"r1"}"#);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum Outgoing {
    Publish {
        topic: String,
        data: Value,
        request_id: String,
    },
    Subscribe {
        topic: String,
        request_id: String,
    },
    Unsubscribe {
        topic: String,
        request_id: String,
    },
    Ping {
        request_id: String,
    },
}

impl Outgoing {
    pub fn request_id(&self) -> &str {
        match self {
            Outgoing::Publish { request_id, .. }
            | Outgoing::Subscribe { request_id, .. }
            | Outgoing::Unsubscribe { request_id, .. }
            | Outgoing::Ping { request_id } => request_id,
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::Serialize)
    }
}

/// Server-to-client envelopes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum Incoming {
    Ready {
        client_id: String,
    },
    Message {
        #[serde(default)]
        id: String,
        topic: String,
        #[serde(default)]
        created: String,
        #[serde(default)]
        data: Value,
    },
    Published {
        #[serde(default)]
        request_id: Option<String>,
    },
    Subscribed {
        #[serde(default)]
        request_id: Option<String>,
    },
    Unsubscribed {
        #[serde(default)]
        request_id: Option<String>,
    },
    Pong {
        #[serde(default)]
        request_id: Option<String>,
    },
    Error {
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl Incoming {
    /// Correlation id for acknowledgement envelopes.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Incoming::Published { request_id }
            | Incoming::Subscribed { request_id }
            | Incoming::Unsubscribed { request_id }
            | Incoming::Pong { request_id }
            | Incoming::Error { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }
}

/// Decode one text frame. The raw JSON is returned alongside the typed view so
/// acknowledgements can hand the full server payload to the waiting caller.
pub fn decode_incoming(text: &str) -> Result<(Incoming, Value)> {
    let raw: Value = serde_json::from_str(text).map_err(Error::Deserialize)?;
    let envelope = Incoming::deserialize(&raw).map_err(Error::Deserialize)?;
    Ok((envelope, raw))
}
