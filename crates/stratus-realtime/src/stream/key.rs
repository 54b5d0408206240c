// Stream subscription keys.
use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Per-subscription query and header options. Non-empty options become part
/// of the topic key, so the same topic with different options is a separate
/// registry entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubscribeOptions {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.query.is_empty() && self.headers.is_empty()
    }
}

/// `topic`, or `topic?options=<urlencoded json>` when options are present.
///
/// ```
/// use stratus_realtime::{SubscribeOptions, topic_key};
///
/// assert_eq!(topic_key("posts", &SubscribeOptions::new()).expect("key"), "posts");
/// let key = topic_key("posts", &SubscribeOptions::new().query("filter", "a")).expect("key");
/// assert!(key.starts_with("posts?options="));
/// ```
pub fn topic_key(topic: &str, options: &SubscribeOptions) -> Result<String> {
    if options.is_empty() {
        return Ok(topic.to_string());
    }
    let serialized = serde_json::to_string(options)
        .map_err(stratus_wire::Error::Serialize)
        .map_err(Error::Encode)?;
    let encoded: String = url::form_urlencoded::byte_serialize(serialized.as_bytes()).collect();
    let separator = if topic.contains('?') { '&' } else { '?' };
    Ok(format!("{topic}{separator}options={encoded}"))
}
