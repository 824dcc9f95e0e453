//! Remote attendance mirror.
//!
//! The remote side is an opaque, idempotent key-value "set": writing the
//! same record to the same path twice is harmless (last write wins).

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("remote write timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid remote url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    /// Transport failure. Built through [`RemoteError::http`] so the request
    /// URL, which carries the auth token, never reaches logs.
    #[error("http: {0}")]
    Http(#[source] reqwest::Error),
    #[error("remote rejected write ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl RemoteError {
    fn http(e: reqwest::Error) -> Self {
        Self::Http(e.without_url())
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Set `value` at `path`, replacing whatever was there.
    async fn put(&self, path: &str, value: &serde_json::Value) -> Result<(), RemoteError>;
}

/// `put` bounded by `timeout`. The abandoned request, if any, is dropped.
pub async fn put_with_timeout(
    remote: &dyn RemoteStore,
    path: &str,
    value: &serde_json::Value,
    timeout: Duration,
) -> Result<(), RemoteError> {
    match tokio::time::timeout(timeout, remote.put(path, value)).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout(timeout)),
    }
}

/// JSON-over-HTTP key-value store (`PUT {base}/{path}.json`), compatible
/// with realtime-database style REST endpoints.
pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: reqwest::Url,
    auth: Option<String>,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, auth: Option<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let invalid = |reason: String| RemoteError::InvalidUrl {
            url: base_url.to_string(),
            reason,
        };
        let base_url = reqwest::Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(invalid("not a hierarchical url".into()));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(RemoteError::http)?;
        Ok(Self {
            client,
            base_url,
            auth,
        })
    }

    /// Each `/`-separated segment of `path` is percent-encoded on its own,
    /// so an id can never spill into the query or fragment.
    fn url_for(&self, path: &str) -> reqwest::Url {
        let mut segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        if let Some(last) = segments.last_mut() {
            last.push_str(".json");
        }

        let mut url = self.base_url.clone();
        url.set_query(None);
        url.set_fragment(None);
        // `new` rejects cannot-be-a-base urls, so this always succeeds.
        if let Ok(mut out) = url.path_segments_mut() {
            out.pop_if_empty().extend(&segments);
        }
        url
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn put(&self, path: &str, value: &serde_json::Value) -> Result<(), RemoteError> {
        let mut request = self.client.put(self.url_for(path)).json(value);
        if let Some(token) = &self.auth {
            request = request.query(&[("auth", token)]);
        }

        let response = request.send().await.map_err(RemoteError::http)?;
        let status = response.status();
        if status.is_success() {
            tracing::debug!(path, status = status.as_u16(), "remote write acknowledged");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
