// URL helpers.
use anyhow::{Context, Result, bail};
use url::Url;

/// Join `path` onto `base` (keeping any path prefix on the base) and append
/// `query` pairs in order.
///
/// ```
/// use stratus_transport::build_url;
///
/// let url = build_url("http://localhost:8090/pb/", "/api/realtime", &[]).expect("url");
/// assert_eq!(url.as_str(), "http://localhost:8090/pb/api/realtime");
/// ```
pub fn build_url(base: &str, path: &str, query: &[(String, String)]) -> Result<Url> {
    let base = base.trim_end_matches('/');
    let joined = if path.is_empty() {
        base.to_string()
    } else if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    };
    let mut url = Url::parse(&joined).with_context(|| format!("parse url: {joined}"))?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

/// Like [`build_url`] but with the scheme mapped to its websocket counterpart
/// (`http` to `ws`, `https` to `wss`).
pub fn socket_url(base: &str, path: &str, query: &[(String, String)]) -> Result<Url> {
    let mut url = build_url(base, path, query)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => bail!("unsupported scheme for socket url: {other}"),
    };
    if url.set_scheme(scheme).is_err() {
        bail!("failed to set socket scheme on {url}");
    }
    Ok(url)
}
