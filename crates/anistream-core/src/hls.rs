//! Headless HLS engine
//!
//! Reference [`MediaEngine`] that parses the master playlist with `m3u8-rs`,
//! exposes its variants as quality levels, picks levels in auto mode with the
//! throughput ABR and advances a wall-clock playback position. No media is
//! decoded; the CLI uses it to drive real sessions end to end.

use crate::{
    abr::ThroughputAbr,
    engine::{EngineEvent, EngineEventKind, EngineErrorKind, EngineEventSender, EngineFactory, EngineId, MediaEngine},
    transport::Transport,
    types::{QualityLevel, VideoSource},
};
use m3u8_rs::{MasterPlaylist, MediaPlaylist, Playlist};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

/// Position ticker period
pub const DEFAULT_TICK: Duration = Duration::from_millis(250);

/// Creates [`HlsEngine`]s sharing one transport
pub struct HlsEngineFactory {
    transport: Arc<dyn Transport>,
    tick: Duration,
    request_timeout: Duration,
}

impl HlsEngineFactory {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            tick: DEFAULT_TICK,
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl EngineFactory for HlsEngineFactory {
    fn create(&self, id: EngineId, events: EngineEventSender) -> Box<dyn MediaEngine> {
        Box::new(HlsEngine::new(
            id,
            events,
            self.transport.clone(),
            self.tick,
            self.request_timeout,
        ))
    }
}

/// State shared between the engine handle and its tasks
struct Shared {
    id: EngineId,
    events: EngineEventSender,
    levels: Vec<QualityLevel>,
    current_level: Option<usize>,
    pinned: Option<usize>,
    abr: ThroughputAbr,
    position: f64,
    duration: Option<f64>,
    playing: bool,
    ended: bool,
    volume: f64,
    muted: bool,
    destroyed: bool,
}

impl Shared {
    /// Send an event unless the engine was destroyed
    fn emit(&self, kind: EngineEventKind) {
        if self.destroyed {
            return;
        }
        let _ = self.events.send(EngineEvent::new(self.id, kind));
    }

    fn switch_level(&mut self, index: usize) {
        if self.current_level != Some(index) {
            self.current_level = Some(index);
            self.emit(EngineEventKind::LevelSwitched { index });
        }
    }
}

/// Headless HLS engine
pub struct HlsEngine {
    id: EngineId,
    transport: Arc<dyn Transport>,
    tick: Duration,
    request_timeout: Duration,
    shared: Arc<Mutex<Shared>>,
    source: Option<(VideoSource, BTreeMap<String, String>)>,
    loader: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl HlsEngine {
    pub fn new(
        id: EngineId,
        events: EngineEventSender,
        transport: Arc<dyn Transport>,
        tick: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            id,
            transport,
            tick,
            request_timeout,
            shared: Arc::new(Mutex::new(Shared {
                id,
                events,
                levels: Vec::new(),
                current_level: None,
                pinned: None,
                abr: ThroughputAbr::new(),
                position: 0.0,
                duration: None,
                playing: false,
                ended: false,
                volume: 1.0,
                muted: false,
                destroyed: false,
            })),
            source: None,
            loader: None,
            ticker: None,
        }
    }

    /// Current playback position
    pub fn position(&self) -> f64 {
        self.shared.lock().position
    }

    pub fn volume(&self) -> (f64, bool) {
        let shared = self.shared.lock();
        (shared.volume, shared.muted)
    }

    fn spawn_load(&mut self, reload: bool) {
        let Some((source, headers)) = self.source.clone() else {
            return;
        };
        if let Some(previous) = self.loader.take() {
            previous.abort();
        }

        let job = LoadJob {
            transport: self.transport.clone(),
            shared: self.shared.clone(),
            source,
            headers,
            timeout: self.request_timeout,
            reload,
        };
        self.loader = Some(tokio::spawn(job.run()));
    }

    fn spawn_ticker(&mut self) {
        if self.ticker.is_some() {
            return;
        }
        let shared = self.shared.clone();
        let tick = self.tick;

        self.ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                interval.tick().await;
                let mut shared = shared.lock();
                if shared.destroyed {
                    break;
                }
                if !shared.playing {
                    continue;
                }

                shared.position += tick.as_secs_f64();
                match shared.duration {
                    Some(duration) if shared.position >= duration => {
                        shared.position = duration;
                        shared.playing = false;
                        shared.ended = true;
                        shared.emit(EngineEventKind::TimeUpdate { position: duration });
                        shared.emit(EngineEventKind::Ended);
                    }
                    _ => {
                        let position = shared.position;
                        shared.emit(EngineEventKind::TimeUpdate { position });
                    }
                }
            }
        }));
    }

    fn abort_tasks(&mut self) {
        if let Some(loader) = self.loader.take() {
            loader.abort();
        }
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

impl MediaEngine for HlsEngine {
    fn id(&self) -> EngineId {
        self.id
    }

    fn load_source(&mut self, source: &VideoSource, headers: &BTreeMap<String, String>) {
        info!(engine = %self.id, url = %source.url, quality = %source.quality, "Loading source");
        {
            let mut shared = self.shared.lock();
            shared.levels.clear();
            shared.current_level = None;
            shared.abr.reset_selection();
            shared.position = 0.0;
            shared.duration = None;
            shared.playing = false;
            shared.ended = false;
        }
        self.source = Some((source.clone(), headers.clone()));
        self.spawn_load(false);
        self.spawn_ticker();
    }

    fn set_level(&mut self, level: Option<usize>) {
        let mut shared = self.shared.lock();
        match level {
            Some(index) if index < shared.levels.len() => {
                shared.pinned = Some(index);
                shared.switch_level(index);
            }
            Some(index) => warn!(engine = %self.id, index, "Ignoring unknown level"),
            None => {
                shared.pinned = None;
                let levels = shared.levels.clone();
                if let Some(index) = shared.abr.select_level(&levels) {
                    shared.switch_level(index);
                }
            }
        }
    }

    fn start_load(&mut self) {
        debug!(engine = %self.id, "Restarting load");
        self.spawn_load(true);
    }

    fn recover_media_error(&mut self) {
        // Nothing is decoded, so recovery only signals readiness again
        self.shared.lock().emit(EngineEventKind::CanPlay);
    }

    fn play(&mut self) {
        let mut shared = self.shared.lock();
        if shared.ended {
            shared.position = 0.0;
            shared.ended = false;
        }
        if !shared.playing {
            shared.playing = true;
            shared.emit(EngineEventKind::Play);
        }
    }

    fn pause(&mut self) {
        let mut shared = self.shared.lock();
        if shared.playing {
            shared.playing = false;
            shared.emit(EngineEventKind::Pause);
        }
    }

    fn seek(&mut self, position: f64) {
        let mut shared = self.shared.lock();
        let upper = shared.duration.unwrap_or(f64::MAX);
        let position = position.clamp(0.0, upper);
        shared.position = position;
        if position < upper {
            shared.ended = false;
        }
        shared.emit(EngineEventKind::TimeUpdate { position });
    }

    fn set_volume(&mut self, volume: f64, muted: bool) {
        let mut shared = self.shared.lock();
        shared.volume = volume.clamp(0.0, 1.0);
        shared.muted = muted;
    }

    fn destroy(&mut self) {
        {
            let mut shared = self.shared.lock();
            shared.destroyed = true;
            shared.playing = false;
        }
        self.abort_tasks();
        debug!(engine = %self.id, "Engine destroyed");
    }
}

impl Drop for HlsEngine {
    fn drop(&mut self) {
        self.shared.lock().destroyed = true;
        self.abort_tasks();
    }
}

/// One manifest load
struct LoadJob {
    transport: Arc<dyn Transport>,
    shared: Arc<Mutex<Shared>>,
    source: VideoSource,
    headers: BTreeMap<String, String>,
    timeout: Duration,
    reload: bool,
}

/// Failure inside a load, mapped onto an engine error event
struct LoadFailure {
    kind: EngineErrorKind,
    details: String,
}

impl LoadFailure {
    fn network(details: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::Network,
            details: details.into(),
        }
    }

    fn parse(details: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::Other,
            details: details.into(),
        }
    }
}

impl LoadJob {
    async fn run(self) {
        let outcome = if self.source.is_m3u8 {
            self.load_playlists().await
        } else {
            // Progressive file: one level at best, duration unknown until played
            Ok((progressive_levels(&self.source), None))
        };

        let mut shared = self.shared.lock();
        match outcome {
            Ok((levels, duration)) => {
                if self.reload && !shared.levels.is_empty() {
                    shared.emit(EngineEventKind::CanPlay);
                    return;
                }

                debug!(levels = levels.len(), duration, "Manifest parsed");
                shared.levels = levels.clone();
                shared.duration = duration;
                shared.emit(EngineEventKind::ManifestParsed { levels: levels.clone() });

                let initial = match shared.pinned.filter(|i| *i < levels.len()) {
                    Some(pinned) => Some(pinned),
                    None => shared.abr.select_level(&levels),
                };
                if let Some(index) = initial {
                    shared.switch_level(index);
                }
                if let Some(duration) = duration {
                    shared.emit(EngineEventKind::DurationChanged { duration });
                }
            }
            Err(failure) => {
                warn!(kind = %failure.kind, details = %failure.details, "Manifest load failed");
                shared.emit(EngineEventKind::Error {
                    kind: failure.kind,
                    fatal: true,
                    details: failure.details,
                });
            }
        }
    }

    async fn fetch(&self, url: &Url) -> Result<bytes::Bytes, LoadFailure> {
        let start = Instant::now();
        let response = tokio::time::timeout(self.timeout, self.transport.get_with_headers(url, &self.headers))
            .await
            .map_err(|_| LoadFailure::network(format!("timed out loading {}", url)))?
            .map_err(|e| LoadFailure::network(e.to_string()))?;

        if !response.is_success() {
            return Err(LoadFailure::network(format!("HTTP {} loading {}", response.status, url)));
        }

        self.shared
            .lock()
            .abr
            .record_measurement(response.body.len(), start.elapsed());
        Ok(response.body)
    }

    async fn load_playlists(&self) -> Result<(Vec<QualityLevel>, Option<f64>), LoadFailure> {
        let body = self.fetch(&self.source.url).await?;

        match m3u8_rs::parse_playlist_res(&body) {
            Ok(Playlist::MasterPlaylist(master)) => {
                let levels = master_levels(&master, &self.source.url);
                if levels.is_empty() {
                    return Err(LoadFailure::parse("master playlist has no playable variants"));
                }

                let probe_level = {
                    let mut shared = self.shared.lock();
                    shared
                        .pinned
                        .filter(|i| *i < levels.len())
                        .or_else(|| shared.abr.select_level(&levels))
                        .unwrap_or(0)
                };
                let duration = match levels.get(probe_level).and_then(|l| l.uri.clone()) {
                    Some(uri) => {
                        let media = self.fetch(&uri).await?;
                        match m3u8_rs::parse_media_playlist_res(&media) {
                            Ok(playlist) => media_duration(&playlist),
                            Err(e) => return Err(LoadFailure::parse(format!("media playlist: {:?}", e))),
                        }
                    }
                    None => None,
                };
                Ok((levels, duration))
            }
            Ok(Playlist::MediaPlaylist(media)) => {
                Ok((progressive_levels(&self.source), media_duration(&media)))
            }
            Err(e) => Err(LoadFailure::parse(format!("manifest parsing error: {:?}", e))),
        }
    }
}

/// Variants with a known resolution, ascending by bandwidth, re-indexed
fn master_levels(master: &MasterPlaylist, base: &Url) -> Vec<QualityLevel> {
    let mut levels: Vec<QualityLevel> = master
        .variants
        .iter()
        .filter(|v| !v.is_i_frame)
        .filter_map(|variant| {
            let resolution = variant.resolution.as_ref()?;
            let mut level = QualityLevel::new(0, resolution.height as u32, variant.bandwidth);
            level.uri = base.join(&variant.uri).ok();
            Some(level)
        })
        .collect();

    levels.sort_by_key(|l| l.bandwidth);
    for (index, level) in levels.iter_mut().enumerate() {
        level.index = index;
    }
    levels
}

/// Single level labeled from the source quality, when it has a height
fn progressive_levels(source: &VideoSource) -> Vec<QualityLevel> {
    source
        .height()
        .map(|height| {
            let mut level = QualityLevel::new(0, height, 0);
            level.uri = Some(source.url.clone());
            vec![level]
        })
        .unwrap_or_default()
}

/// Total duration of a finished (VOD) media playlist
fn media_duration(media: &MediaPlaylist) -> Option<f64> {
    media
        .end_list
        .then(|| media.segments.iter().map(|s| s.duration as f64).sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HttpResponse;
    use crate::Result;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    const MASTER: &str = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=2800000,RESOLUTION=1280x720
720/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360
360/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080
1080/index.m3u8
";

    const MEDIA: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:10
#EXT-X-MEDIA-SEQUENCE:0
#EXTINF:10.0,
seg0.ts
#EXTINF:10.0,
seg1.ts
#EXTINF:4.0,
seg2.ts
#EXT-X-ENDLIST
";

    struct CdnTransport {
        fail: bool,
    }

    #[async_trait]
    impl Transport for CdnTransport {
        async fn get(&self, url: &Url) -> Result<HttpResponse> {
            if self.fail {
                return Err(crate::Error::Timeout { url: url.to_string() });
            }
            if url.path().ends_with("master.m3u8") {
                Ok(HttpResponse::new(200, MASTER))
            } else if url.path().ends_with("index.m3u8") {
                Ok(HttpResponse::new(200, MEDIA))
            } else {
                Ok(HttpResponse::new(404, ""))
            }
        }
    }

    fn source() -> VideoSource {
        VideoSource {
            url: Url::parse("https://cdn.test/ep1/master.m3u8").unwrap(),
            quality: "auto".to_string(),
            is_m3u8: true,
        }
    }

    fn engine(fail: bool) -> (HlsEngine, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = HlsEngine::new(
            EngineId(1),
            tx,
            Arc::new(CdnTransport { fail }),
            Duration::from_secs(1),
            Duration::from_secs(5),
        );
        (engine, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_manifest_levels_and_duration() {
        let (mut engine, mut rx) = engine(false);
        engine.load_source(&source(), &BTreeMap::new());

        let parsed = rx.recv().await.unwrap();
        match parsed.kind {
            EngineEventKind::ManifestParsed { levels } => {
                let labels: Vec<_> = levels.iter().map(|l| l.label()).collect();
                assert_eq!(labels, vec!["360p", "720p", "1080p"]);
                assert_eq!(levels[2].index, 2);
                assert_eq!(
                    levels[0].uri.as_ref().map(|u| u.as_str()),
                    Some("https://cdn.test/ep1/360/index.m3u8")
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(rx.recv().await.unwrap().kind, EngineEventKind::LevelSwitched { index: 0 });
        assert_eq!(rx.recv().await.unwrap().kind, EngineEventKind::DurationChanged { duration: 24.0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_plays_to_end() {
        let (mut engine, mut rx) = engine(false);
        engine.load_source(&source(), &BTreeMap::new());
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }

        engine.play();
        assert_eq!(rx.recv().await.unwrap().kind, EngineEventKind::Play);

        let mut last = 0.0;
        loop {
            match rx.recv().await.unwrap().kind {
                EngineEventKind::TimeUpdate { position } => {
                    assert!(position >= last);
                    last = position;
                }
                EngineEventKind::Ended => break,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(last, 24.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinned_level_and_seek_clamp() {
        let (mut engine, mut rx) = engine(false);
        engine.load_source(&source(), &BTreeMap::new());
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }

        engine.set_level(Some(2));
        assert_eq!(rx.recv().await.unwrap().kind, EngineEventKind::LevelSwitched { index: 2 });
        engine.set_level(Some(9));

        engine.seek(100.0);
        assert_eq!(rx.recv().await.unwrap().kind, EngineEventKind::TimeUpdate { position: 24.0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failure_is_fatal_network_error() {
        let (mut engine, mut rx) = engine(true);
        engine.load_source(&source(), &BTreeMap::new());
        match rx.recv().await.unwrap().kind {
            EngineEventKind::Error { kind, fatal, .. } => {
                assert_eq!(kind, EngineErrorKind::Network);
                assert!(fatal);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_silences_engine() {
        let (mut engine, mut rx) = engine(false);
        engine.load_source(&source(), &BTreeMap::new());
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        engine.play();
        engine.destroy();
        while rx.try_recv().is_ok() {}

        tokio::time::sleep(Duration::from_secs(5)).await;
        engine.play();
        assert!(rx.try_recv().is_err());
    }
}
