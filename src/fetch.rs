//! Byte sources: direct HTTP, the same-origin image relay, and an in-memory
//! route table.

use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use url::Url;

/// A fetched resource body.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl Fetched {
    pub fn new(bytes: impl Into<Vec<u8>>, content_type: &str) -> Self {
        Fetched {
            bytes: bytes.into(),
            content_type: content_type.to_string(),
        }
    }

    pub fn is_image(&self) -> bool {
        self.content_type.trim().to_ascii_lowercase().starts_with("image/")
    }
}

/// Anything that can turn a URL into bytes.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Fetched>;
}

#[async_trait]
impl<T: Fetch + ?Sized> Fetch for Arc<T> {
    async fn fetch(&self, url: &str) -> Result<Fetched> {
        (**self).fetch(url).await
    }
}

/// Plain HTTP GET through reqwest.
#[cfg(feature = "relay")]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout_ms: u64,
}

#[cfg(feature = "relay")]
impl HttpFetcher {
    pub fn new(config: &crate::CaptureConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::InitializationError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            timeout_ms: config.timeout_ms,
        })
    }
}

#[cfg(feature = "relay")]
#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Fetched> {
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(self.timeout_ms)
            } else {
                e.into()
            }
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::NetworkError(format!("GET {} returned {}", url, status)));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = resp.bytes().await?.to_vec();
        Ok(Fetched { bytes, content_type })
    }
}

/// Routes every request through a same-origin relay endpoint that takes the
/// upstream URL as its `url` query parameter.
pub struct RelayFetcher<F> {
    endpoint: Url,
    inner: F,
}

impl<F: Fetch> RelayFetcher<F> {
    pub fn new(endpoint: &str, inner: F) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::ConfigError(format!("invalid relay endpoint {:?}: {}", endpoint, e)))?;
        Ok(Self { endpoint, inner })
    }

    /// Relay endpoint on the document's own origin.
    pub fn same_origin(origin: &Url, path: &str, inner: F) -> Result<Self> {
        let endpoint = origin
            .join(path)
            .map_err(|e| Error::ConfigError(format!("invalid relay path {:?}: {}", path, e)))?;
        Ok(Self { endpoint, inner })
    }

    pub fn relay_url(&self, upstream: &str) -> String {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().clear().append_pair("url", upstream);
        url.to_string()
    }
}

#[async_trait]
impl<F: Fetch> Fetch for RelayFetcher<F> {
    async fn fetch(&self, url: &str) -> Result<Fetched> {
        let relayed = self.relay_url(url);
        self.inner
            .fetch(&relayed)
            .await
            .map_err(|e| Error::RelayError(format!("relay for {} failed: {}", url, e)))
    }
}

/// In-memory route table with per-URL hit counters.
#[derive(Default)]
pub struct StaticFetcher {
    routes: Mutex<HashMap<String, Fetched>>,
    hits: Mutex<HashMap<String, usize>>,
    latency: Duration,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every answer, so concurrent requests overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn route(self, url: &str, body: Fetched) -> Self {
        self.insert(url, body);
        self
    }

    pub fn insert(&self, url: &str, body: Fetched) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string(), body);
    }

    pub fn hits(&self, url: &str) -> usize {
        self.hits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.hits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }
}

#[async_trait]
impl Fetch for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<Fetched> {
        *self
            .hits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(url.to_string())
            .or_insert(0) += 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let found = self
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned();
        found.ok_or_else(|| Error::NetworkError(format!("GET {} returned 404 Not Found", url)))
    }
}
