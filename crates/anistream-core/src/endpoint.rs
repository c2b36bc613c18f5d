//! Endpoint pool
//!
//! Holds the candidate API base addresses, probes them concurrently and caches
//! the fastest reachable one for a fixed TTL. After expiry the next selection
//! probes every candidate again from scratch.

use crate::{
    config::UpstreamConfig,
    transport::{get_with_timeout, Transport},
    Error, Result,
};
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Path used for liveness probes: a cheap search on the secondary provider
pub const DEFAULT_PROBE_PATH: &str = "anime/gogoanime/one%20piece?page=1";

/// Candidate base address and its last probe outcome
#[derive(Debug, Clone)]
pub struct EndpointCandidate {
    pub address: Url,
    /// Last measured latency, None when unreachable or never probed
    pub last_latency: Option<Duration>,
    pub last_checked_at: Option<Instant>,
    pub last_error: Option<String>,
}

impl EndpointCandidate {
    pub fn new(address: Url) -> Self {
        Self {
            address,
            last_latency: None,
            last_checked_at: None,
            last_error: None,
        }
    }

    pub fn latency_ms(&self) -> Option<u64> {
        self.last_latency.map(|d| d.as_millis() as u64)
    }

    pub fn is_reachable(&self) -> bool {
        self.last_latency.is_some()
    }
}

#[derive(Debug, Clone)]
struct BestEndpoint {
    address: Url,
    expires_at: Instant,
}

/// Pool of interchangeable API endpoints
pub struct EndpointPool {
    transport: Arc<dyn Transport>,
    candidates: RwLock<Vec<EndpointCandidate>>,
    /// Single writer; held across a probe round so concurrent callers share its result
    best: Mutex<Option<BestEndpoint>>,
    ttl: Duration,
    probe_timeout: Duration,
    probe_path: String,
}

impl EndpointPool {
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoints: Vec<Url>,
        ttl: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            candidates: RwLock::new(endpoints.into_iter().map(EndpointCandidate::new).collect()),
            best: Mutex::new(None),
            ttl,
            probe_timeout,
            probe_path: DEFAULT_PROBE_PATH.to_string(),
        }
    }

    /// Build from upstream configuration
    pub fn from_config(transport: Arc<dyn Transport>, config: &UpstreamConfig) -> Self {
        Self::new(
            transport,
            config.endpoints.clone(),
            config.endpoint_ttl(),
            config.probe_timeout(),
        )
    }

    /// Override the probe path
    pub fn with_probe_path(mut self, path: impl Into<String>) -> Self {
        self.probe_path = path.into();
        self
    }

    /// Snapshot of every candidate with its last probe result
    pub fn candidates(&self) -> Vec<EndpointCandidate> {
        self.candidates.read().clone()
    }

    /// Currently cached best endpoint, if unexpired
    pub async fn cached(&self) -> Option<Url> {
        self.best
            .lock()
            .await
            .as_ref()
            .filter(|b| Instant::now() < b.expires_at)
            .map(|b| b.address.clone())
    }

    /// Return the best endpoint, probing every candidate when the cache is empty or expired
    #[instrument(skip(self))]
    pub async fn select_endpoint(&self) -> Result<Url> {
        let mut best = self.best.lock().await;

        if let Some(cached) = best.as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.address.clone());
            }
            debug!(endpoint = %cached.address, "Best endpoint expired");
        }
        *best = None;

        let candidates = self.probe_all().await;

        let winner = candidates
            .iter()
            .filter_map(|c| c.last_latency.map(|latency| (latency, c)))
            .min_by_key(|(latency, _)| *latency)
            .map(|(latency, c)| (latency, c.address.clone()));

        match winner {
            Some((latency, address)) => {
                info!(
                    endpoint = %address,
                    latency_ms = latency.as_millis() as u64,
                    "Selected best endpoint"
                );
                *best = Some(BestEndpoint {
                    address: address.clone(),
                    expires_at: Instant::now() + self.ttl,
                });
                Ok(address)
            }
            None => {
                let attempts = candidates
                    .iter()
                    .map(|c| {
                        format!(
                            "{} ({})",
                            c.address,
                            c.last_error.as_deref().unwrap_or("unreachable")
                        )
                    })
                    .collect();
                warn!("Every endpoint candidate is unreachable");
                Err(Error::AllEndpointsUnreachable { attempts })
            }
        }
    }

    /// Endpoints to try for a request: `primary` first, then the rest by last
    /// known latency, unreachable candidates last in configured order.
    pub fn failover_order(&self, primary: &Url) -> Vec<Url> {
        let mut rest: Vec<EndpointCandidate> = self
            .candidates
            .read()
            .iter()
            .filter(|c| &c.address != primary)
            .cloned()
            .collect();
        rest.sort_by_key(|c| c.last_latency.unwrap_or(Duration::MAX));

        std::iter::once(primary.clone())
            .chain(rest.into_iter().map(|c| c.address))
            .collect()
    }

    /// Drop the cached best endpoint if it is `address`, so the next selection re-probes
    pub async fn invalidate(&self, address: &Url) {
        let mut best = self.best.lock().await;
        if best.as_ref().is_some_and(|b| &b.address == address) {
            debug!(endpoint = %address, "Invalidating best endpoint");
            *best = None;
        }
    }

    /// Forget the cached best endpoint unconditionally
    pub async fn reset(&self) {
        *self.best.lock().await = None;
    }

    /// Probe every candidate concurrently and record the results
    async fn probe_all(&self) -> Vec<EndpointCandidate> {
        let addresses: Vec<Url> = self.candidates.read().iter().map(|c| c.address.clone()).collect();

        let results = join_all(addresses.iter().map(|address| self.probe(address))).await;

        let checked_at = Instant::now();
        let mut candidates = self.candidates.write();
        for (candidate, (latency, error)) in candidates.iter_mut().zip(results) {
            debug!(
                endpoint = %candidate.address,
                latency_ms = latency.map(|l| l.as_millis() as u64),
                error = error.as_deref(),
                "Probe finished"
            );
            candidate.last_latency = latency;
            candidate.last_error = error;
            candidate.last_checked_at = Some(checked_at);
        }
        candidates.clone()
    }

    /// Any HTTP response counts as alive; transport failures and timeouts do not
    async fn probe(&self, address: &Url) -> (Option<Duration>, Option<String>) {
        let url = match endpoint_url(address, &self.probe_path) {
            Ok(url) => url,
            Err(e) => return (None, Some(e.to_string())),
        };

        let start = Instant::now();
        match get_with_timeout(self.transport.as_ref(), &url, self.probe_timeout).await {
            Ok(_) => (Some(start.elapsed()), None),
            Err(e) => (None, Some(e.to_string())),
        }
    }
}

/// Append a path (and query) to a base address, keeping any base path
pub fn endpoint_url(base: &Url, path: &str) -> Result<Url> {
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Ok(Url::parse(&joined)?)
}
