//! Stale-request cancellation around the resolver
//!
//! Only the most recent load may complete. Starting a new load cancels the
//! previous one, which then returns [`Error::Cancelled`] instead of a
//! descriptor for an episode the viewer already left.

use crate::{
    resolver::SourceResolver,
    types::{ResolutionRequest, StreamDescriptor},
    Error, Result,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Catalog key for the skip-time service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipTimesKey {
    pub catalog_id: u64,
    pub episode_number: u32,
}

struct ActiveLoad {
    generation: u64,
    token: CancellationToken,
}

/// Resolver front that supersedes in-flight loads
pub struct SourceLoader {
    resolver: Arc<SourceResolver>,
    current: Mutex<Option<ActiveLoad>>,
    generation: AtomicU64,
}

impl SourceLoader {
    pub fn new(resolver: Arc<SourceResolver>) -> Self {
        Self {
            resolver,
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn resolver(&self) -> &Arc<SourceResolver> {
        &self.resolver
    }

    /// Resolve a descriptor and, when a catalog key is known, merge skip times
    /// from the skip-time service ahead of provider-supplied segments.
    #[instrument(skip(self))]
    pub async fn load(
        &self,
        request: &ResolutionRequest,
        skip_key: Option<SkipTimesKey>,
    ) -> Result<StreamDescriptor> {
        let (generation, token) = self.begin();

        let work = async {
            let resolve = self.resolver.resolve(
                &request.episode_id,
                request.provider,
                request.server.as_deref(),
            );
            let skip_times = async {
                match skip_key {
                    Some(key) => {
                        self.resolver
                            .skip_times(key.catalog_id, key.episode_number)
                            .await
                    }
                    None => Vec::new(),
                }
            };

            let (descriptor, external) = tokio::join!(resolve, skip_times);
            let mut descriptor = descriptor?;
            if !external.is_empty() {
                let provided = std::mem::replace(&mut descriptor.skip_segments, external);
                descriptor.merge_skip_segments(provided);
            }
            Ok::<_, Error>(descriptor)
        };

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            result = work => result,
        };

        // A load finishing in the same poll as its replacement started still loses
        if token.is_cancelled() {
            debug!(episode_id = %request.episode_id, "Dropping superseded load");
            return Err(Error::Cancelled);
        }
        self.finish(generation);
        result
    }

    /// Cancel whatever load is in flight
    pub fn cancel(&self) {
        if let Some(active) = self.current.lock().take() {
            active.token.cancel();
        }
    }

    /// True while a load is in flight
    pub fn is_loading(&self) -> bool {
        self.current.lock().is_some()
    }

    fn begin(&self) -> (u64, CancellationToken) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let previous = self.current.lock().replace(ActiveLoad {
            generation,
            token: token.clone(),
        });
        if let Some(previous) = previous {
            debug!(generation = previous.generation, "Cancelling previous load");
            previous.token.cancel();
        }
        (generation, token)
    }

    fn finish(&self, generation: u64) {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|a| a.generation == generation) {
            *current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use crate::segment::SegmentKind;
    use crate::transport::{HttpResponse, Transport};
    use crate::types::Provider;
    use async_trait::async_trait;
    use std::time::Duration;
    use url::Url;

    /// Serves sources after a per-episode delay; skip times for catalog id 1
    struct DelayedTransport;

    #[async_trait]
    impl Transport for DelayedTransport {
        async fn get(&self, url: &Url) -> Result<HttpResponse> {
            let query = url.query().unwrap_or_default().to_string();
            if url.path().contains("/skip-times/1/") {
                return Ok(HttpResponse::new(
                    200,
                    r#"{"found": true, "results": [
                        {"interval": {"startTime": 20, "endTime": 100}, "skipType": "mixed-op"}
                    ]}"#,
                ));
            }
            if url.path().ends_with("/watch") {
                if query.contains("slow") {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
                return Ok(HttpResponse::new(
                    200,
                    r#"{"sources": [{"url": "https://cdn.test/a.m3u8", "quality": "1080p", "isM3U8": true}],
                        "intro": {"start": 25, "end": 110}, "outro": {"start": 1300, "end": 1390}}"#,
                ));
            }
            Ok(HttpResponse::new(200, "{}"))
        }
    }

    fn loader() -> Arc<SourceLoader> {
        let config = UpstreamConfig {
            endpoints: vec![Url::parse("https://a.test").unwrap()],
            ..UpstreamConfig::default()
        };
        let resolver = SourceResolver::from_config(Arc::new(DelayedTransport), config);
        Arc::new(SourceLoader::new(Arc::new(resolver)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_load_cancels_previous() {
        let loader = loader();

        let stale = {
            let loader = loader.clone();
            tokio::spawn(async move {
                loader
                    .load(&ResolutionRequest::new("slow-ep", Provider::Zoro, None), None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let fresh = loader
            .load(&ResolutionRequest::new("fast-ep", Provider::Zoro, None), None)
            .await;
        assert!(fresh.is_ok());
        assert!(matches!(stale.await.unwrap(), Err(Error::Cancelled)));
        assert!(!loader.is_loading());
    }

    #[tokio::test]
    async fn test_external_skip_times_take_precedence() {
        let loader = loader();
        let key = SkipTimesKey {
            catalog_id: 1,
            episode_number: 1,
        };
        let descriptor = loader
            .load(&ResolutionRequest::new("ep", Provider::Zoro, None), Some(key))
            .await
            .unwrap();
        let kinds: Vec<_> = descriptor.skip_segments.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![SegmentKind::MixedOpening, SegmentKind::Ending]);
    }
}
