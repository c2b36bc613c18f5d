//! Source resolver
//!
//! Fetches stream descriptors and catalog data from the upstream API. Within one
//! provider a failed request moves to the next endpoint; a provider that yields
//! no usable descriptor hands over to the next provider in the chain. Every
//! failed attempt is kept so the final error names all of them.

use crate::{
    config::UpstreamConfig,
    endpoint::EndpointPool,
    fallback::FallbackChain,
    segment::Segment,
    transport::{get_with_timeout, CachePolicy, HttpResponse, ResponseCache, Transport},
    types::{EpisodeSelection, AnimeInfo, Provider, SearchResult, StreamDescriptor},
    upstream::{server_names, RawAnimeInfo, RawSearch, RawServer, RawSkipTimes, RawSources},
    Error, Result,
};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Path and query of an upstream API call, relative to an endpoint base
#[derive(Debug, Clone)]
struct ApiPath {
    segments: Vec<String>,
    query: Vec<(&'static str, String)>,
}

impl ApiPath {
    fn new(provider: Provider, action: &str) -> Self {
        Self {
            segments: vec!["anime".to_string(), provider.as_str().to_string(), action.to_string()],
            query: Vec::new(),
        }
    }

    fn query(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.query.push((key, value.into()));
        self
    }

    /// Resolve against a base address; segments and query values are percent-encoded
    fn on(&self, base: &Url) -> Result<Url> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidConfig(format!("endpoint {} cannot be a base URL", base)))?
            .pop_if_empty()
            .extend(&self.segments);
        if !self.query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(self.query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }
}

/// Resolves episodes to playable stream descriptors
pub struct SourceResolver {
    pool: Arc<EndpointPool>,
    transport: Arc<dyn Transport>,
    cache: ResponseCache,
    config: UpstreamConfig,
}

impl SourceResolver {
    pub fn new(pool: Arc<EndpointPool>, transport: Arc<dyn Transport>, config: UpstreamConfig) -> Self {
        Self {
            pool,
            transport,
            cache: ResponseCache::new(),
            config,
        }
    }

    /// Pool and resolver sharing one transport, built from configuration
    pub fn from_config(transport: Arc<dyn Transport>, config: UpstreamConfig) -> Self {
        let pool = Arc::new(EndpointPool::from_config(transport.clone(), &config));
        Self::new(pool, transport, config)
    }

    pub fn pool(&self) -> &Arc<EndpointPool> {
        &self.pool
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Drop every cached upstream body
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Resolve a stream descriptor, walking the provider chain starting at `provider`.
    ///
    /// `server` is an opaque query parameter for the requested provider only; the
    /// server chain belongs to the caller. Fails with [`Error::SourceUnavailable`]
    /// once every provider is exhausted, or [`Error::AllEndpointsUnreachable`] when
    /// no endpoint answers at all.
    #[instrument(skip(self))]
    pub async fn resolve(
        &self,
        episode_id: &str,
        provider: Provider,
        server: Option<&str>,
    ) -> Result<StreamDescriptor> {
        let mut chain = FallbackChain::starting_at(provider, &self.config.providers);

        while let Some(current) = chain.current().copied() {
            let server = if chain.is_first() { server } else { None };

            match self.fetch_sources(episode_id, current, server).await {
                Ok(mut descriptor) => {
                    if !chain.is_first() {
                        warn!(requested = %provider, provider = %current, "Resolved on fallback provider");
                    }
                    descriptor.server = server.map(str::to_string);
                    descriptor.servers = self.servers(episode_id, current).await;
                    info!(
                        provider = %current,
                        sources = descriptor.sources.len(),
                        subtitles = descriptor.subtitles.len(),
                        "Resolved stream descriptor"
                    );
                    return Ok(descriptor);
                }
                Err(e @ Error::AllEndpointsUnreachable { .. }) => return Err(e),
                Err(e) => {
                    warn!(provider = %current, error = %e, "Provider failed");
                    chain.fail(e);
                }
            }
        }

        Err(Error::SourceUnavailable {
            errors: chain.into_errors(),
        })
    }

    async fn fetch_sources(
        &self,
        episode_id: &str,
        provider: Provider,
        server: Option<&str>,
    ) -> Result<StreamDescriptor> {
        let mut path = ApiPath::new(provider, "watch").query("episodeId", episode_id);
        if let Some(server) = server {
            path = path.query("server", server);
        }

        let policy = CachePolicy::MaxAge(Duration::from_secs(self.config.sources_cache_secs));
        let response = self.fetch_api(provider, &path, policy).await?;
        let raw: RawSources = response
            .json()
            .map_err(|e| Error::provider(provider, e.to_string()))?;
        raw.into_descriptor(provider, episode_id)
    }

    /// Anime details and episode list from one provider
    #[instrument(skip(self))]
    pub async fn anime_info(&self, anime_id: &str, provider: Provider) -> Result<AnimeInfo> {
        let path = ApiPath::new(provider, "info").query("id", anime_id);
        let policy = CachePolicy::MaxAge(Duration::from_secs(self.config.search_cache_secs));
        let response = self.fetch_api(provider, &path, policy).await?;
        let raw: RawAnimeInfo = response.json()?;
        Ok(raw.into_info(provider))
    }

    /// Find an episode by number, falling back to its position in the list
    #[instrument(skip(self))]
    pub async fn resolve_episode(
        &self,
        anime_id: &str,
        episode_number: u32,
        provider: Provider,
    ) -> Result<EpisodeSelection> {
        let anime = self.anime_info(anime_id, provider).await?;
        let episode = anime
            .find_episode(episode_number)
            .cloned()
            .ok_or_else(|| Error::ProviderNotFound {
                provider: provider.to_string(),
                episode_id: format!("{} #{}", anime_id, episode_number),
            })?;
        debug!(episode_id = %episode.id, "Resolved episode");
        Ok(EpisodeSelection { anime, episode })
    }

    /// CDN servers offered for an episode; the configured defaults when unknown
    #[instrument(skip(self))]
    pub async fn servers(&self, episode_id: &str, provider: Provider) -> Vec<String> {
        let path = ApiPath::new(provider, "servers").query("episodeId", episode_id);
        let policy = CachePolicy::MaxAge(Duration::from_secs(self.config.search_cache_secs));

        let names = match self.fetch_api(provider, &path, policy).await {
            Ok(response) => match response.json::<Vec<RawServer>>() {
                Ok(raw) => server_names(raw),
                Err(e) => {
                    debug!(error = %e, "Unexpected server list shape");
                    Vec::new()
                }
            },
            Err(e) => {
                debug!(error = %e, "Server list unavailable");
                Vec::new()
            }
        };

        if names.is_empty() {
            self.config.default_servers.clone()
        } else {
            names
        }
    }

    /// Skip segments from the skip-time service. Best effort: never fails.
    #[instrument(skip(self))]
    pub async fn skip_times(&self, catalog_id: u64, episode_number: u32) -> Vec<Segment> {
        match self.fetch_skip_times(catalog_id, episode_number).await {
            Ok(segments) => segments,
            Err(e) => {
                warn!(error = %e, "Skip times unavailable");
                Vec::new()
            }
        }
    }

    async fn fetch_skip_times(&self, catalog_id: u64, episode_number: u32) -> Result<Vec<Segment>> {
        let mut url = self.config.aniskip_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidConfig("skip-time URL cannot be a base URL".into()))?
            .pop_if_empty()
            .extend(["skip-times", &catalog_id.to_string(), &episode_number.to_string()]);
        url.query_pairs_mut()
            .append_pair("types[]", "op")
            .append_pair("types[]", "ed")
            .append_pair("types[]", "recap");

        let body = match self.cache.get(&url) {
            Some(body) => body,
            None => {
                let response =
                    get_with_timeout(self.transport.as_ref(), &url, self.config.request_timeout()).await?;
                if !response.is_success() {
                    // The service answers 404 for titles it doesn't know
                    debug!(status = response.status, "No skip times");
                    return Ok(Vec::new());
                }
                self.cache.put(
                    &url,
                    response.body.clone(),
                    CachePolicy::MaxAge(Duration::from_secs(self.config.skip_times_cache_secs)),
                );
                response.body
            }
        };

        let raw: RawSkipTimes = HttpResponse::new(200, body).json()?;
        Ok(raw.into_segments())
    }

    /// Search every configured provider concurrently; results are merged in
    /// provider order and de-duplicated by case-insensitive title.
    #[instrument(skip(self))]
    pub async fn search(&self, query: &str, page: u32) -> Result<Vec<SearchResult>> {
        let policy = CachePolicy::MaxAge(Duration::from_secs(self.config.search_cache_secs));

        let lookups = self.config.providers.iter().map(|provider| {
            let path = ApiPath {
                segments: vec!["anime".to_string(), provider.as_str().to_string(), query.to_string()],
                query: vec![("page", page.to_string())],
            };
            async move {
                let response = self.fetch_api(*provider, &path, policy).await?;
                let raw: RawSearch = response.json()?;
                Ok::<_, Error>(raw.into_results(*provider))
            }
        });

        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        let mut failures = Vec::new();

        for result in join_all(lookups).await {
            match result {
                Ok(hits) => {
                    for hit in hits {
                        if seen.insert(hit.title.to_lowercase()) {
                            merged.push(hit);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Search failed on provider");
                    failures.push(e);
                }
            }
        }

        if failures.len() == self.config.providers.len() {
            if let Some(first) = failures.into_iter().next() {
                return Err(first);
            }
        }
        Ok(merged)
    }

    /// GET an API path against the best endpoint, then the remaining endpoints in
    /// failover order. Successful bodies are cached under `policy`.
    async fn fetch_api(&self, provider: Provider, path: &ApiPath, policy: CachePolicy) -> Result<HttpResponse> {
        let primary = self.pool.select_endpoint().await?;

        let mut attempts = Vec::new();
        let mut all_not_found = true;

        for endpoint in self.pool.failover_order(&primary) {
            let url = path.on(&endpoint)?;

            if let Some(body) = self.cache.get(&url) {
                debug!(url = %url, "Cache hit");
                return Ok(HttpResponse::new(200, body));
            }

            match get_with_timeout(self.transport.as_ref(), &url, self.config.request_timeout()).await {
                Ok(response) if response.is_success() => {
                    self.cache.put(&url, response.body.clone(), policy);
                    return Ok(response);
                }
                Ok(response) => {
                    debug!(endpoint = %endpoint, status = response.status, "Non-success response");
                    all_not_found &= response.status == 404;
                    attempts.push(format!("{}: HTTP {}", endpoint, response.status));
                }
                Err(e) => {
                    let unreachable = Error::EndpointUnreachable {
                        address: endpoint.to_string(),
                        reason: e.to_string(),
                    };
                    debug!(error = %unreachable, "Request failed");
                    all_not_found = false;
                    attempts.push(unreachable.to_string());
                    if endpoint == primary {
                        self.pool.invalidate(&endpoint).await;
                    }
                }
            }
        }

        if all_not_found && !attempts.is_empty() {
            return Err(Error::ProviderNotFound {
                provider: provider.to_string(),
                episode_id: path.query.first().map(|(_, v)| v.clone()).unwrap_or_default(),
            });
        }
        Err(Error::provider(provider, attempts.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentKind;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    type Handler = Box<dyn Fn(&Url) -> Result<HttpResponse> + Send + Sync>;

    /// Routes requests through a closure and logs every URL
    struct ScriptedTransport {
        handler: Handler,
        log: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(handler: impl Fn(&Url) -> Result<HttpResponse> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                handler: Box::new(handler),
                log: Mutex::new(Vec::new()),
            })
        }

        fn count(&self, needle: &str) -> usize {
            self.log.lock().iter().filter(|u| u.contains(needle)).count()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn get(&self, url: &Url) -> Result<HttpResponse> {
            self.log.lock().push(url.to_string());
            (self.handler)(url)
        }
    }

    const SOURCES: &str = r#"{"sources": [
        {"url": "https://cdn.test/720.m3u8", "quality": "720p", "isM3U8": true},
        {"url": "https://cdn.test/1080.m3u8", "quality": "1080p", "isM3U8": true},
        {"url": "https://cdn.test/480.m3u8", "quality": "480p", "isM3U8": true}
    ]}"#;

    fn resolver(transport: Arc<ScriptedTransport>, hosts: &[&str]) -> SourceResolver {
        let config = UpstreamConfig {
            endpoints: hosts
                .iter()
                .map(|h| Url::parse(&format!("https://{h}")).unwrap())
                .collect(),
            ..UpstreamConfig::default()
        };
        SourceResolver::from_config(transport, config)
    }

    fn is_probe(url: &Url) -> bool {
        url.path().starts_with("/anime/gogoanime/one")
    }

    #[tokio::test]
    async fn test_resolve_sorts_sources() {
        let transport = ScriptedTransport::new(|url| {
            if url.path().ends_with("/servers") {
                return Ok(HttpResponse::new(200, r#"[{"name": "VidCloud"}, {"name": "StreamSB"}]"#));
            }
            Ok(HttpResponse::new(200, if is_probe(url) { "{}" } else { SOURCES }))
        });
        let resolver = resolver(transport, &["a.test"]);

        let descriptor = resolver.resolve("ep-1", Provider::Zoro, None).await.unwrap();
        let order: Vec<_> = descriptor.sources.iter().map(|s| s.quality.as_str()).collect();
        assert_eq!(order, vec!["1080p", "720p", "480p"]);
        assert_eq!(descriptor.provider, Some(Provider::Zoro));
        assert_eq!(descriptor.servers, vec!["vidcloud", "streamsb"]);
    }

    #[tokio::test]
    async fn test_bad_endpoint_is_not_a_bad_provider() {
        let transport = ScriptedTransport::new(|url| {
            if is_probe(url) {
                return Ok(HttpResponse::new(200, "{}"));
            }
            match url.host_str() {
                Some("a.test") => Ok(HttpResponse::new(502, "bad gateway")),
                _ => Ok(HttpResponse::new(200, SOURCES)),
            }
        });
        let resolver = resolver(transport.clone(), &["a.test", "b.test"]);

        let descriptor = resolver.resolve("ep-1", Provider::Zoro, None).await.unwrap();
        assert_eq!(descriptor.provider, Some(Provider::Zoro));
        assert_eq!(transport.count("gogoanime/watch"), 0);
    }

    #[tokio::test]
    async fn test_falls_back_to_next_provider_without_server() {
        let transport = ScriptedTransport::new(|url| {
            if is_probe(url) {
                return Ok(HttpResponse::new(200, "{}"));
            }
            if url.path().starts_with("/anime/zoro/watch") {
                return Ok(HttpResponse::new(404, r#"{"message": "not found"}"#));
            }
            Ok(HttpResponse::new(200, SOURCES))
        });
        let resolver = resolver(transport.clone(), &["a.test"]);

        let descriptor = resolver
            .resolve("ep-1", Provider::Zoro, Some("streamsb"))
            .await
            .unwrap();
        assert_eq!(descriptor.provider, Some(Provider::Gogoanime));
        assert_eq!(descriptor.server, None);
        assert!(transport.log.lock().iter().any(|u| u.contains("zoro/watch") && u.contains("server=streamsb")));
        assert!(!transport.log.lock().iter().any(|u| u.contains("gogoanime/watch") && u.contains("server=")));
    }

    #[tokio::test]
    async fn test_all_providers_fail_names_each() {
        let transport = ScriptedTransport::new(|url| {
            if is_probe(url) {
                return Ok(HttpResponse::new(200, "{}"));
            }
            if url.path().contains("zoro") {
                return Ok(HttpResponse::new(500, "boom"));
            }
            Ok(HttpResponse::new(200, r#"{"sources": []}"#))
        });
        let resolver = resolver(transport, &["a.test"]);

        match resolver.resolve("ep-1", Provider::Zoro, None).await {
            Err(Error::SourceUnavailable { errors }) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].starts_with("[zoro]"));
                assert!(errors[1].starts_with("[gogoanime]"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shape_mismatch_falls_back() {
        let transport = ScriptedTransport::new(|url| {
            if is_probe(url) {
                return Ok(HttpResponse::new(200, "{}"));
            }
            if url.path().contains("zoro") {
                return Ok(HttpResponse::new(200, "<html>captcha</html>"));
            }
            Ok(HttpResponse::new(200, SOURCES))
        });
        let resolver = resolver(transport, &["a.test"]);
        let descriptor = resolver.resolve("ep-1", Provider::Zoro, None).await.unwrap();
        assert_eq!(descriptor.provider, Some(Provider::Gogoanime));
    }

    #[tokio::test]
    async fn test_no_endpoint_aborts_resolution() {
        let transport = ScriptedTransport::new(|url| {
            Err(Error::EndpointUnreachable {
                address: url.to_string(),
                reason: "refused".into(),
            })
        });
        let resolver = resolver(transport, &["a.test", "b.test"]);
        assert!(matches!(
            resolver.resolve("ep-1", Provider::Zoro, None).await,
            Err(Error::AllEndpointsUnreachable { .. })
        ));
    }

    #[tokio::test]
    async fn test_sources_are_cached() {
        let transport = ScriptedTransport::new(|url| {
            Ok(HttpResponse::new(200, if is_probe(url) { "{}" } else { SOURCES }))
        });
        let resolver = resolver(transport.clone(), &["a.test"]);
        resolver.resolve("ep-1", Provider::Zoro, None).await.unwrap();
        resolver.resolve("ep-1", Provider::Zoro, None).await.unwrap();
        assert_eq!(transport.count("zoro/watch"), 1);
    }

    #[tokio::test]
    async fn test_servers_default_when_unknown() {
        let transport = ScriptedTransport::new(|url| {
            if is_probe(url) {
                return Ok(HttpResponse::new(200, "{}"));
            }
            Ok(HttpResponse::new(500, "boom"))
        });
        let resolver = resolver(transport, &["a.test"]);
        let servers = resolver.servers("ep-1", Provider::Zoro).await;
        assert_eq!(servers, vec!["vidcloud", "streamsb", "vidstreaming", "mega"]);
    }

    #[tokio::test]
    async fn test_skip_times_best_effort() {
        let transport = ScriptedTransport::new(|url| {
            if url.path().ends_with("/52991/1") {
                return Ok(HttpResponse::new(
                    200,
                    r#"{"found": true, "results": [
                        {"interval": {"startTime": 30, "endTime": 120}, "skipType": "op"}
                    ]}"#,
                ));
            }
            if url.path().ends_with("/52991/2") {
                return Ok(HttpResponse::new(200, r#"{"found": false, "results": []}"#));
            }
            Err(Error::Timeout { url: url.to_string() })
        });
        let resolver = resolver(transport.clone(), &["a.test"]);

        let segments = resolver.skip_times(52991, 1).await;
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].kind, SegmentKind::Opening);
        assert!(transport.log.lock()[0].contains("types%5B%5D=op"));

        assert!(resolver.skip_times(52991, 2).await.is_empty());
        assert!(resolver.skip_times(52991, 3).await.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_episode_by_number() {
        let transport = ScriptedTransport::new(|url| {
            if url.path().ends_with("/info") {
                return Ok(HttpResponse::new(
                    200,
                    r#"{"id": "frieren", "title": "Frieren", "malId": 52991, "totalEpisodes": 2,
                        "episodes": [{"id": "frieren$ep=1", "number": 1}, {"id": "frieren$ep=2", "number": 2}]}"#,
                ));
            }
            Ok(HttpResponse::new(200, "{}"))
        });
        let resolver = resolver(transport, &["a.test"]);
        let selection = resolver.resolve_episode("frieren", 2, Provider::Zoro).await.unwrap();
        assert_eq!(selection.episode.id, "frieren$ep=2");
        assert_eq!(selection.anime.mal_id, Some(52991));

        assert!(matches!(
            resolver.resolve_episode("frieren", 5, Provider::Zoro).await,
            Err(Error::ProviderNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_search_merges_without_duplicates() {
        let transport = ScriptedTransport::new(|url| {
            let body = if url.path().starts_with("/anime/zoro/") {
                r#"{"results": [{"id": "z1", "title": "Frieren"}, {"id": "z2", "title": "Dungeon Meshi"}]}"#
            } else {
                r#"{"results": [{"id": "g1", "title": "FRIEREN"}, {"id": "g2", "title": "Mushishi"}]}"#
            };
            Ok(HttpResponse::new(200, body))
        });
        let resolver = resolver(transport, &["a.test"]);
        let results = resolver.search("frieren", 1).await.unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["z1", "z2", "g2"]);
    }

    #[test]
    fn test_api_path_encoding() {
        let base = Url::parse("https://api.test/").unwrap();
        let url = ApiPath::new(Provider::Zoro, "watch")
            .query("episodeId", "frieren$episode$1 a")
            .on(&base)
            .unwrap();
        assert_eq!(url.path(), "/anime/zoro/watch");
        assert_eq!(
            url.query_pairs().next().map(|(_, v)| v.into_owned()),
            Some("frieren$episode$1 a".to_string())
        );
    }
}
