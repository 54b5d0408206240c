// Request/response transport and the reqwest implementation.
use std::pin::Pin;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::TransportConfig;
use crate::endpoint::build_url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A single HTTP-shaped call. Paths are relative to the configured base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            body: Some(body),
            ..Self::get(path)
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).context("decode response body")
    }
}

/// Chunked response body of a long-lived request.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send a request and buffer the full response. Non-2xx statuses are errors.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;

    /// Send a request and hand back the response body as it arrives. No overall
    /// request timeout applies; the caller owns the stream's lifetime.
    async fn open_stream(&self, request: HttpRequest) -> Result<ByteStream>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    config: TransportConfig,
}

impl ReqwestTransport {
    pub fn new(config: TransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context("build http client")?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn prepare(&self, request: &HttpRequest) -> Result<reqwest::RequestBuilder> {
        let url = build_url(&self.config.base_url, &request.path, &request.query)?;
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };
        let mut builder = self
            .client
            .request(method, url)
            .header("Accept-Language", self.config.lang.as_str());
        if request.header_value("Authorization").is_none()
            && let Some(token) = self.config.token.token()
        {
            builder = builder.header("Authorization", token);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        Ok(builder)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self
            .prepare(&request)?
            .timeout(self.config.request_timeout)
            .send()
            .await
            .with_context(|| format!("send request: {}", request.path))?;
        let status = response.status();
        let body = response.bytes().await.context("read response body")?;
        if !status.is_success() {
            bail!(
                "request {} failed with status {}: {}",
                request.path,
                status.as_u16(),
                String::from_utf8_lossy(&body)
            );
        }
        Ok(HttpResponse {
            status: status.as_u16(),
            body,
        })
    }

    async fn open_stream(&self, request: HttpRequest) -> Result<ByteStream> {
        let response = self
            .prepare(&request)?
            .send()
            .await
            .with_context(|| format!("open stream: {}", request.path))?;
        let status = response.status();
        if !status.is_success() {
            bail!(
                "stream {} failed with status {}",
                request.path,
                status.as_u16()
            );
        }
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.context("read stream chunk"));
        Ok(Box::pin(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_builders_collect_parts() {
        let request = HttpRequest::post("/api/realtime", json!({"clientId": "c"}))
            .header("Authorization", "t")
            .query("expand", "x");
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.header_value("authorization"), Some("t"));
        assert_eq!(request.query, vec![("expand".to_string(), "x".to_string())]);
        assert_eq!(request.body, Some(json!({"clientId": "c"})));
    }

    #[test]
    fn response_json_decodes_body() {
        let response = HttpResponse {
            status: 200,
            body: Bytes::from_static(br#"{"ok":true}"#),
        };
        let value: Value = response.json().expect("json");
        assert_eq!(value, json!({"ok": true}));
    }
}
