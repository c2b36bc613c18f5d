//! Upstream HTTP boundary
//!
//! The resolver and the endpoint pool talk to upstream APIs through the
//! [`Transport`] trait so the fallback logic can be exercised without a network.

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument};
use url::Url;

/// Raw upstream response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body into a typed upstream shape
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| Error::InvalidResponse(e.to_string()))
    }
}

/// GET-only transport used for every upstream call
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a GET request. Any HTTP status is a successful transport result.
    async fn get(&self, url: &Url) -> Result<HttpResponse>;

    /// GET with extra request headers (media requests carry the provider's Referer)
    async fn get_with_headers(
        &self,
        url: &Url,
        _headers: &BTreeMap<String, String>,
    ) -> Result<HttpResponse> {
        self.get(url).await
    }
}

/// GET with a deadline; elapsed deadlines become [`Error::Timeout`]
pub async fn get_with_timeout(
    transport: &dyn Transport,
    url: &Url,
    timeout: Duration,
) -> Result<HttpResponse> {
    tokio::time::timeout(timeout, transport.get(url))
        .await
        .map_err(|_| Error::Timeout {
            url: url.to_string(),
        })?
}

/// reqwest-backed transport
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("anistream/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &Url) -> Result<HttpResponse> {
        self.get_with_headers(url, &BTreeMap::new()).await
    }

    #[instrument(skip(self, headers), fields(url = %url))]
    async fn get_with_headers(
        &self,
        url: &Url,
        headers: &BTreeMap<String, String>,
    ) -> Result<HttpResponse> {
        let mut request = self.client.get(url.clone());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout {
                    url: url.to_string(),
                }
            } else {
                Error::Network(e)
            }
        })?;

        let status = response.status().as_u16();
        let body = response.bytes().await?;

        debug!(status, bytes = body.len(), "Upstream response");

        Ok(HttpResponse { status, body })
    }
}

/// Caching directive chosen per content volatility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Never cache
    NoStore,
    /// Reuse a successful body for this long
    MaxAge(Duration),
}

/// In-memory cache of successful upstream bodies keyed by URL
#[derive(Default)]
pub struct ResponseCache {
    entries: Mutex<HashMap<String, CachedBody>>,
}

struct CachedBody {
    body: Bytes,
    expires_at: Instant,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh body for a URL, evicting it if expired
    pub fn get(&self, url: &Url) -> Option<Bytes> {
        let mut entries = self.entries.lock();
        let key = url.as_str();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.body.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a body under the given policy
    pub fn put(&self, url: &Url, body: Bytes, policy: CachePolicy) {
        if let CachePolicy::MaxAge(ttl) = policy {
            if ttl.is_zero() {
                return;
            }
            self.entries.lock().insert(
                url.to_string(),
                CachedBody {
                    body,
                    expires_at: Instant::now() + ttl,
                },
            );
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowTransport;

    #[async_trait]
    impl Transport for SlowTransport {
        async fn get(&self, _url: &Url) -> Result<HttpResponse> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(HttpResponse::new(200, "late"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_maps_to_error() {
        let url = Url::parse("https://api.example.com/slow").unwrap();
        let result = get_with_timeout(&SlowTransport, &url, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires() {
        let cache = ResponseCache::new();
        let url = Url::parse("https://api.example.com/anime/zoro/info?id=x").unwrap();
        cache.put(&url, Bytes::from_static(b"{}"), CachePolicy::MaxAge(Duration::from_secs(60)));
        assert!(cache.get(&url).is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get(&url).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_no_store_is_not_cached() {
        let cache = ResponseCache::new();
        let url = Url::parse("https://api.example.com/x").unwrap();
        cache.put(&url, Bytes::from_static(b"{}"), CachePolicy::NoStore);
        assert!(cache.get(&url).is_none());
    }

    #[test]
    fn test_json_shape_mismatch_is_invalid_response() {
        let response = HttpResponse::new(200, "not json");
        let decoded: Result<serde_json::Value> = response.json();
        assert!(matches!(decoded, Err(Error::InvalidResponse(_))));
    }
}
