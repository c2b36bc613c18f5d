//! Integration tests for Anistream Core

use anistream_core::{
    engine::{EngineEventSender, EngineErrorKind},
    ControllerRequest, EngineEvent, EngineEventKind, EngineFactory, EngineId, Error,
    HttpResponse, Intent, MediaEngine, MediaSink, Navigation, PlaybackConfig,
    PlaybackController, PlayerState, ProgressStore, Provider, QualityLevel, Result, Segment,
    SegmentKind, SessionContext, SettingsPatch, SkipAffordance, SourceResolver,
    StreamDescriptor, Transport, UpstreamConfig, VideoSource,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use url::Url;

// =============================================================================
// Fixtures
// =============================================================================

type Handler = Box<dyn Fn(&Url) -> Result<HttpResponse> + Send + Sync>;

/// Upstream stand-in: answers through a closure and logs every URL
struct Upstream {
    handler: Handler,
    log: Mutex<Vec<Url>>,
}

impl Upstream {
    fn new(handler: impl Fn(&Url) -> Result<HttpResponse> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            log: Mutex::new(Vec::new()),
        })
    }

    fn probes(&self) -> usize {
        self.log.lock().iter().filter(|u| is_probe(u)).count()
    }
}

#[async_trait]
impl Transport for Upstream {
    async fn get(&self, url: &Url) -> Result<HttpResponse> {
        self.log.lock().push(url.clone());
        (self.handler)(url)
    }
}

fn is_probe(url: &Url) -> bool {
    url.path().contains("one%20piece")
}

fn unreachable(url: &Url) -> Result<HttpResponse> {
    Err(Error::Timeout {
        url: url.to_string(),
    })
}

const SOURCES: &str = r#"{"sources": [
    {"url": "https://cdn.test/720.m3u8", "quality": "720p", "isM3U8": true},
    {"url": "https://cdn.test/1080.m3u8", "quality": "1080p", "isM3U8": true},
    {"url": "https://cdn.test/480.m3u8", "quality": "480p", "isM3U8": true}
]}"#;

fn resolver(transport: Arc<Upstream>, hosts: &[String]) -> SourceResolver {
    let config = UpstreamConfig {
        endpoints: hosts
            .iter()
            .map(|h| Url::parse(&format!("https://{h}")).unwrap())
            .collect(),
        ..UpstreamConfig::default()
    };
    SourceResolver::from_config(transport, config)
}

#[derive(Default)]
struct Engines {
    live: Mutex<Vec<EngineId>>,
    seeks: Mutex<Vec<(EngineId, f64)>>,
    senders: Mutex<BTreeMap<EngineId, EngineEventSender>>,
}

impl Engines {
    fn emit(&self, id: EngineId, kind: EngineEventKind) {
        if let Some(tx) = self.senders.lock().get(&id) {
            tx.send(EngineEvent::new(id, kind)).unwrap();
        }
    }
}

/// Engine that only records what it's told and echoes play/pause
struct ScriptedEngine {
    id: EngineId,
    engines: Arc<Engines>,
    events: EngineEventSender,
}

impl MediaEngine for ScriptedEngine {
    fn id(&self) -> EngineId {
        self.id
    }
    fn load_source(&mut self, _source: &VideoSource, _headers: &BTreeMap<String, String>) {}
    fn set_level(&mut self, _level: Option<usize>) {}
    fn start_load(&mut self) {}
    fn recover_media_error(&mut self) {}
    fn play(&mut self) {
        let _ = self.events.send(EngineEvent::new(self.id, EngineEventKind::Play));
    }
    fn pause(&mut self) {
        let _ = self.events.send(EngineEvent::new(self.id, EngineEventKind::Pause));
    }
    fn seek(&mut self, position: f64) {
        self.engines.seeks.lock().push((self.id, position));
    }
    fn set_volume(&mut self, _volume: f64, _muted: bool) {}
    fn destroy(&mut self) {
        self.engines.live.lock().retain(|e| *e != self.id);
    }
}

struct ScriptedFactory(Arc<Engines>);

impl EngineFactory for ScriptedFactory {
    fn create(&self, id: EngineId, events: EngineEventSender) -> Box<dyn MediaEngine> {
        self.0.live.lock().push(id);
        self.0.senders.lock().insert(id, events.clone());
        Box::new(ScriptedEngine {
            id,
            engines: self.0.clone(),
            events,
        })
    }
}

fn controller(settings: SettingsPatch) -> (PlaybackController, Arc<Engines>, MediaSink, ProgressStore) {
    let engines = Arc::new(Engines::default());
    let sink = MediaSink::new();
    let store = ProgressStore::in_memory();
    store
        .update_settings(SettingsPatch {
            auto_skip_intro: Some(false),
            auto_skip_outro: Some(false),
            auto_play: Some(false),
            auto_next: Some(false),
            default_quality: Some("auto".to_string()),
            volume: None,
        })
        .unwrap();
    store.update_settings(settings).unwrap();
    let controller = PlaybackController::new(
        PlaybackConfig::default(),
        Arc::new(ScriptedFactory(engines.clone())),
        sink.clone(),
        store.clone(),
    );
    (controller, engines, sink, store)
}

fn descriptor(segments: Vec<Segment>) -> StreamDescriptor {
    StreamDescriptor {
        sources: vec![VideoSource {
            url: Url::parse("https://cdn.test/master.m3u8").unwrap(),
            quality: "auto".to_string(),
            is_m3u8: true,
        }],
        skip_segments: segments,
        ..Default::default()
    }
}

fn levels() -> Vec<QualityLevel> {
    vec![
        QualityLevel::new(0, 480, 1_400_000),
        QualityLevel::new(1, 720, 2_800_000),
        QualityLevel::new(2, 1080, 5_000_000),
    ]
}

/// Mount episode 5 of 12 and bring it to Playing
fn play(controller: &mut PlaybackController, engines: &Engines, segments: Vec<Segment>) -> EngineId {
    let context = SessionContext::new("mushishi", "mushishi$ep=5", 5).with_total_episodes(Some(12));
    controller.mount(descriptor(segments), context, Some(0.0)).unwrap();
    let id = controller.engine_id().unwrap();
    engines.emit(id, EngineEventKind::ManifestParsed { levels: levels() });
    engines.emit(id, EngineEventKind::DurationChanged { duration: 1440.0 });
    controller.drain_events();
    controller.apply(Intent::Play);
    controller.drain_events();
    id
}

fn at(controller: &mut PlaybackController, engines: &Engines, id: EngineId, position: f64) {
    engines.emit(id, EngineEventKind::TimeUpdate { position });
    controller.drain_events();
}

// =============================================================================
// Resolution Tests
// =============================================================================

#[tokio::test]
async fn test_single_reachable_endpoint_wins_wherever_it_is() {
    const N: usize = 4;
    for k in 0..N {
        let hosts: Vec<String> = (0..N).map(|i| format!("e{i}.test")).collect();
        let good = hosts[k].clone();
        let transport = Upstream::new(move |url| {
            if url.host_str() != Some(good.as_str()) {
                return unreachable(url);
            }
            if url.path().ends_with("/servers") {
                return Ok(HttpResponse::new(200, "[]"));
            }
            Ok(HttpResponse::new(200, if is_probe(url) { "{}" } else { SOURCES }))
        });
        let resolver = resolver(transport.clone(), &hosts);

        let descriptor = assert_ok!(resolver.resolve("ep-1", Provider::Zoro, None).await);
        assert_eq!(descriptor.sources.len(), 3);
        assert_eq!(
            resolver.pool().cached().await.and_then(|u| u.host_str().map(str::to_string)),
            Some(hosts[k].clone())
        );
        let probes = transport.probes();
        assert_eq!(probes, N);

        // Within the TTL the pool answers from its cache
        assert_ok!(resolver.resolve("ep-2", Provider::Zoro, None).await);
        assert_eq!(transport.probes(), probes);
    }
}

#[tokio::test]
async fn test_all_providers_failing_names_each() {
    let transport = Upstream::new(|url| {
        if is_probe(url) {
            return Ok(HttpResponse::new(200, "{}"));
        }
        Ok(HttpResponse::new(503, "maintenance"))
    });
    let resolver = resolver(transport, &["api.test".to_string()]);

    let err = assert_err!(resolver.resolve("ep-1", Provider::Zoro, Some("vidcloud")).await);
    let text = err.to_string();
    assert!(matches!(err, Error::SourceUnavailable { .. }));
    assert!(text.contains("zoro"));
    assert!(text.contains("gogoanime"));
}

#[tokio::test]
async fn test_sources_ordered_by_quality() {
    let transport = Upstream::new(|url| {
        if url.path().ends_with("/servers") {
            return Ok(HttpResponse::new(200, "[]"));
        }
        Ok(HttpResponse::new(200, if is_probe(url) { "{}" } else { SOURCES }))
    });
    let resolver = resolver(transport, &["api.test".to_string()]);

    let descriptor = assert_ok!(resolver.resolve("ep-1", Provider::Gogoanime, None).await);
    let order: Vec<_> = descriptor.sources.iter().map(|s| s.quality.as_str()).collect();
    assert_eq!(order, vec!["1080p", "720p", "480p"]);
    assert_eq!(descriptor.preferred_source().unwrap().quality, "1080p");
}

// =============================================================================
// Playback Controller Tests
// =============================================================================

#[tokio::test]
async fn test_remount_leaves_exactly_one_engine() {
    let (mut controller, engines, sink, _store) = controller(SettingsPatch::default());
    play(&mut controller, &engines, vec![]);
    play(&mut controller, &engines, vec![]);
    play(&mut controller, &engines, vec![]);

    let live = engines.live.lock().clone();
    assert_eq!(live.len(), 1);
    assert_eq!(sink.attached(), Some(live[0]));
    assert_eq!(controller.engine_id(), Some(live[0]));
}

#[tokio::test]
async fn test_ending_auto_skip_prefers_next_episode() {
    let ending = Segment::new(SegmentKind::Ending, 1320.0, 1410.0).unwrap();

    let (mut controller, engines, _sink, _store) = controller(SettingsPatch {
        auto_skip_outro: Some(true),
        auto_next: Some(true),
        ..Default::default()
    });
    let id = play(&mut controller, &engines, vec![ending]);
    at(&mut controller, &engines, id, 1325.0);
    at(&mut controller, &engines, id, 1326.0);

    assert_eq!(
        controller.take_requests(),
        vec![ControllerRequest::Navigate(Navigation::Next { episode: 6 })]
    );
    assert!(engines.seeks.lock().iter().all(|(_, p)| *p != 1410.0));
}

#[tokio::test]
async fn test_ending_auto_skip_without_advance_seeks() {
    let ending = Segment::new(SegmentKind::Ending, 1320.0, 1410.0).unwrap();

    let (mut controller, engines, _sink, _store) = controller(SettingsPatch {
        auto_skip_outro: Some(true),
        ..Default::default()
    });
    let id = play(&mut controller, &engines, vec![ending]);
    at(&mut controller, &engines, id, 1325.0);

    assert!(controller.take_requests().is_empty());
    assert_eq!(engines.seeks.lock().last(), Some(&(id, 1410.0)));
    assert_eq!(controller.notification(), Some("Ending skipped"));
}

#[tokio::test(start_paused = true)]
async fn test_checkpoints_during_twelve_seconds_of_play() {
    let (mut controller, engines, _sink, store) = controller(SettingsPatch::default());
    let id = play(&mut controller, &engines, vec![]);

    let mut written = Vec::new();
    for second in 1..=12 {
        tokio::time::advance(Duration::from_secs(1)).await;
        at(&mut controller, &engines, id, second as f64);
        let before = controller.checkpoint_count();
        controller.fire_due_timers();
        if controller.checkpoint_count() > before {
            written.push(store.get("mushishi").unwrap().progress);
        }
    }

    assert!((2..=3).contains(&written.len()), "checkpoints: {written:?}");
    assert!(written.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test(start_paused = true)]
async fn test_no_checkpoint_while_paused() {
    let (mut controller, engines, _sink, store) = controller(SettingsPatch::default());
    play(&mut controller, &engines, vec![]);
    controller.apply(Intent::Pause);
    controller.drain_events();
    assert_eq!(controller.state(), PlayerState::Paused);

    tokio::time::advance(Duration::from_secs(11)).await;
    controller.fire_due_timers();
    assert_eq!(controller.checkpoint_count(), 0);
    assert!(store.get("mushishi").is_none());
}

#[tokio::test]
async fn test_unknown_quality_is_a_no_op() {
    let (mut controller, engines, _sink, _store) = controller(SettingsPatch::default());
    play(&mut controller, &engines, vec![]);

    assert!(controller.request_quality_change("720p"));
    controller.apply(Intent::SelectQuality("2160p".to_string()));
    assert_eq!(controller.quality(), "720p");
    assert_eq!(controller.snapshot().qualities, vec!["auto", "480p", "720p", "1080p"]);
}

#[tokio::test]
async fn test_affordance_shown_iff_inside_segment() {
    let opening = Segment::new(SegmentKind::Opening, 30.0, 120.0).unwrap();
    let ending = Segment::new(SegmentKind::Ending, 1300.0, 1390.0).unwrap();
    let (mut controller, engines, _sink, _store) = controller(SettingsPatch::default());
    let id = play(&mut controller, &engines, vec![opening, ending]);

    let mut position = 0.0;
    while position < 1440.0 {
        at(&mut controller, &engines, id, position);
        let expected = if opening.contains(position) {
            SkipAffordance::Opening
        } else if ending.contains(position) {
            SkipAffordance::Ending
        } else {
            SkipAffordance::None
        };
        assert_eq!(controller.skip_affordance(), expected, "at {position}");
        position += 2.5;
    }
}

#[tokio::test]
async fn test_fatal_engine_error_suggests_server_switch() {
    let (mut controller, engines, _sink, _store) = controller(SettingsPatch::default());
    let id = play(&mut controller, &engines, vec![]);
    engines.emit(
        id,
        EngineEventKind::Error {
            kind: EngineErrorKind::Other,
            fatal: true,
            details: "keySystemNoAccess".to_string(),
        },
    );
    controller.drain_events();

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.state, PlayerState::Error);
    assert!(snapshot.error.unwrap().contains("Try another server"));
}

#[cfg(feature = "hls")]
mod hls_playback {
    use super::*;
    use anistream_core::HlsEngineFactory;

    const MASTER: &str = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360
360/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2800000,RESOLUTION=1280x720
720/index.m3u8
";

    const MEDIA: &str = "#EXTM3U
#EXT-X-TARGETDURATION:6
#EXTINF:6.0,
a.ts
#EXTINF:6.0,
b.ts
#EXT-X-ENDLIST
";

    #[tokio::test(start_paused = true)]
    async fn test_headless_session_plays_to_end() {
        let cdn = Upstream::new(|url| {
            let body = if url.path().ends_with("master.m3u8") { MASTER } else { MEDIA };
            Ok(HttpResponse::new(200, body))
        });
        let factory = HlsEngineFactory::new(cdn).with_tick(Duration::from_millis(500));
        let store = ProgressStore::in_memory();
        let mut controller = PlaybackController::new(
            PlaybackConfig::default(),
            Arc::new(factory),
            MediaSink::new(),
            store.clone(),
        );

        let context = SessionContext::new("mushishi", "mushishi$ep=12", 12).with_total_episodes(Some(12));
        controller.mount(descriptor(vec![]), context, None).unwrap();

        let mut steps = 0;
        while controller.state() != PlayerState::Ended {
            controller.process_next().await;
            steps += 1;
            assert!(steps < 1_000, "session never ended");
        }

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.duration, Some(12.0));
        assert_eq!(snapshot.qualities, vec!["auto", "360p", "720p"]);
        assert_eq!(store.get("mushishi").unwrap().episode, 12);
        assert!(controller.take_requests().is_empty());
    }
}
