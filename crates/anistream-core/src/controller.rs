//! Playback Controller - state machine driving one engine per session
//!
//! Coordinates:
//! - Engine lifecycle (destroy before recreate, single sink attachment)
//! - State transitions mirrored from engine events
//! - Segment-skip evaluation and auto-skip
//! - Quality selection (auto or pinned by label)
//! - Progress checkpoints, notifications, controls auto-hide
//!
//! The controller is owned by one task. Engine callbacks arrive on an event
//! channel and timers live in a [`Scheduler`]; [`PlaybackController::process_next`]
//! handles exactly one of them at a time, so transitions never interleave.

use crate::{
    config::PlaybackConfig,
    engine::{
        EngineErrorKind, EngineEvent, EngineEventKind, EngineEventReceiver, EngineEventSender,
        EngineFactory, EngineId, MediaEngine, MediaSink,
    },
    scheduler::{Scheduler, TimerKind},
    segment::{self, Segment},
    store::ProgressStore,
    types::*,
    Error, Result,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Where the mounted stream sits in its series
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub anime_id: String,
    pub episode_id: String,
    pub episode_number: u32,
    /// None when the provider doesn't report a total
    pub total_episodes: Option<u32>,
}

impl SessionContext {
    pub fn new(anime_id: impl Into<String>, episode_id: impl Into<String>, episode_number: u32) -> Self {
        Self {
            anime_id: anime_id.into(),
            episode_id: episode_id.into(),
            episode_number,
            total_episodes: None,
        }
    }

    pub fn with_total_episodes(mut self, total: Option<u32>) -> Self {
        self.total_episodes = total;
        self
    }

    /// An unknown total never blocks advancing
    pub fn has_next(&self) -> bool {
        self.total_episodes
            .map_or(true, |total| self.episode_number < total)
    }

    pub fn has_previous(&self) -> bool {
        self.episode_number > 1
    }
}

/// State of one mounted stream
#[derive(Debug)]
struct PlaybackSession {
    id: SessionId,
    context: SessionContext,
    state: PlayerState,
    quality: QualityMode,
    /// Label of the level the engine is currently on
    active_level: Option<String>,
    position: f64,
    duration: Option<f64>,
    /// Seek target applied once the manifest is parsed
    initial_position: f64,
    network_recoveries: u32,
    media_recoveries: u32,
    /// A next-episode request has been issued for this session
    advance_requested: bool,
}

impl PlaybackSession {
    fn new(context: SessionContext, initial_position: f64) -> Self {
        Self {
            id: SessionId::new(),
            context,
            state: PlayerState::Idle,
            quality: QualityMode::Auto,
            active_level: None,
            position: 0.0,
            duration: None,
            initial_position,
            network_recoveries: 0,
            media_recoveries: 0,
            advance_requested: false,
        }
    }
}

/// Everything the UI renders, published after each handled event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerSnapshot {
    pub session_id: Option<SessionId>,
    pub anime_id: Option<String>,
    pub episode_number: Option<u32>,
    pub state: PlayerState,
    pub position: f64,
    pub duration: Option<f64>,
    pub buffering: bool,
    /// Selected quality label, "auto" when the engine decides
    pub quality: String,
    /// Label of the level being played
    pub active_level: Option<String>,
    /// "auto" followed by every level label
    pub qualities: Vec<String>,
    pub skip: SkipAffordance,
    /// Whole seconds left in the shown segment
    pub skip_countdown: Option<u32>,
    pub notification: Option<String>,
    pub error: Option<String>,
    pub controls_visible: bool,
    pub volume: f64,
    pub muted: bool,
    pub fullscreen: bool,
    pub subtitles: Vec<String>,
    pub subtitle: Option<String>,
    pub server: Option<String>,
    pub servers: Vec<String>,
    pub last_checkpoint: Option<f64>,
}

impl Default for PlayerSnapshot {
    fn default() -> Self {
        Self {
            session_id: None,
            anime_id: None,
            episode_number: None,
            state: PlayerState::Idle,
            position: 0.0,
            duration: None,
            buffering: false,
            quality: AUTO_QUALITY.to_string(),
            active_level: None,
            qualities: vec![AUTO_QUALITY.to_string()],
            skip: SkipAffordance::None,
            skip_countdown: None,
            notification: None,
            error: None,
            controls_visible: true,
            volume: 1.0,
            muted: false,
            fullscreen: false,
            subtitles: Vec::new(),
            subtitle: None,
            server: None,
            servers: Vec::new(),
            last_checkpoint: None,
        }
    }
}

/// Viewer intents, from keys or UI controls
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    TogglePlay,
    Play,
    Pause,
    SeekForward { large: bool },
    SeekBackward { large: bool },
    SeekTo(f64),
    /// Seek to this many tenths of the duration
    SeekToTenth(u8),
    VolumeUp,
    VolumeDown,
    ToggleMute,
    ToggleFullscreen,
    /// Skip the segment whose affordance is shown
    ConfirmSkip,
    NextEpisode,
    PrevEpisode,
    SelectQuality(String),
    SelectServer(String),
    SelectSubtitle(Option<String>),
    PointerActivity,
}

impl Intent {
    /// Map a key code (DOM style, or the bare character) to an intent
    pub fn from_key(key: &str, shift: bool) -> Option<Intent> {
        let intent = match key {
            "Space" | " " => Intent::TogglePlay,
            "ArrowLeft" => Intent::SeekBackward { large: shift },
            "ArrowRight" => Intent::SeekForward { large: shift },
            "ArrowUp" => Intent::VolumeUp,
            "ArrowDown" => Intent::VolumeDown,
            "KeyF" | "f" | "F" => Intent::ToggleFullscreen,
            "KeyM" | "m" | "M" => Intent::ToggleMute,
            "KeyS" | "s" | "S" => Intent::ConfirmSkip,
            "KeyN" | "n" | "N" => Intent::NextEpisode,
            "KeyP" | "p" | "P" => Intent::PrevEpisode,
            _ => {
                let digit = key.strip_prefix("Digit").unwrap_or(key);
                match digit.parse::<u8>() {
                    Ok(n @ 1..=9) => Intent::SeekToTenth(n),
                    _ => return None,
                }
            }
        };
        Some(intent)
    }
}

/// Requests the controller cannot satisfy itself; the owner resolves a new
/// descriptor and mounts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerRequest {
    Navigate(Navigation),
    ChangeServer(String),
}

/// Playback controller owning the single live engine
pub struct PlaybackController {
    /// Timing and recovery budgets
    config: PlaybackConfig,
    /// Builds engines for each mount
    factory: Arc<dyn EngineFactory>,
    /// Shared playback surface
    sink: MediaSink,
    /// Progress and preferences
    store: ProgressStore,
    /// Engine event channel; every engine gets a clone of the sender
    events_tx: EngineEventSender,
    events_rx: EngineEventReceiver,
    next_engine_id: u64,
    /// The one live engine
    engine: Option<Box<dyn MediaEngine>>,
    /// Current session, None while idle
    session: Option<PlaybackSession>,
    /// Descriptor backing the current session
    descriptor: Option<StreamDescriptor>,
    /// Levels from the last parsed manifest
    levels: Vec<QualityLevel>,
    /// Session-scoped timers
    scheduler: Scheduler,
    /// Snapshot broadcaster
    snapshot_tx: watch::Sender<PlayerSnapshot>,
    /// Outstanding requests for the owner
    requests: Vec<ControllerRequest>,
    settings: PlayerSettings,
    skip: SkipAffordance,
    skip_countdown: Option<u32>,
    notification: Option<String>,
    error: Option<String>,
    controls_visible: bool,
    volume: f64,
    muted: bool,
    fullscreen: bool,
    subtitle: Option<String>,
    last_checkpoint: Option<f64>,
    checkpoints: u64,
}

impl PlaybackController {
    pub fn new(
        config: PlaybackConfig,
        factory: Arc<dyn EngineFactory>,
        sink: MediaSink,
        store: ProgressStore,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(PlayerSnapshot::default());
        let settings = store.settings();
        let volume = store.volume();
        let muted = store.muted();

        Self {
            config,
            factory,
            sink,
            store,
            events_tx,
            events_rx,
            next_engine_id: 1,
            engine: None,
            session: None,
            descriptor: None,
            levels: Vec::new(),
            scheduler: Scheduler::new(),
            snapshot_tx,
            requests: Vec::new(),
            settings,
            skip: SkipAffordance::None,
            skip_countdown: None,
            notification: None,
            error: None,
            controls_visible: true,
            volume,
            muted,
            fullscreen: false,
            subtitle: None,
            last_checkpoint: None,
            checkpoints: 0,
        }
    }

    /// Current state, Idle when nothing is mounted
    pub fn state(&self) -> PlayerState {
        self.session.as_ref().map_or(PlayerState::Idle, |s| s.state)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn context(&self) -> Option<&SessionContext> {
        self.session.as_ref().map(|s| &s.context)
    }

    pub fn descriptor(&self) -> Option<&StreamDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn engine_id(&self) -> Option<EngineId> {
        self.engine.as_ref().map(|e| e.id())
    }

    pub fn position(&self) -> f64 {
        self.session.as_ref().map_or(0.0, |s| s.position)
    }

    /// Selected quality label
    pub fn quality(&self) -> String {
        self.session
            .as_ref()
            .map_or(AUTO_QUALITY, |s| s.quality.label())
            .to_string()
    }

    pub fn skip_affordance(&self) -> SkipAffordance {
        self.skip
    }

    pub fn notification(&self) -> Option<&str> {
        self.notification.as_deref()
    }

    /// Number of progress writes in this controller's lifetime
    pub fn checkpoint_count(&self) -> u64 {
        self.checkpoints
    }

    pub fn is_scheduled(&self, kind: TimerKind) -> bool {
        self.scheduler.is_scheduled(kind)
    }

    pub fn pending_timers(&self) -> usize {
        self.scheduler.len()
    }

    /// Subscribe to snapshot updates
    pub fn subscribe(&self) -> watch::Receiver<PlayerSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Drain requests raised since the last call
    pub fn take_requests(&mut self) -> Vec<ControllerRequest> {
        std::mem::take(&mut self.requests)
    }

    /// Mount a descriptor, replacing whatever was playing. The previous engine
    /// is destroyed and detached before the new one attaches.
    #[instrument(skip(self, descriptor, context), fields(anime = %context.anime_id, episode = context.episode_number))]
    pub fn mount(
        &mut self,
        descriptor: StreamDescriptor,
        context: SessionContext,
        initial_position: Option<f64>,
    ) -> Result<SessionId> {
        let source = descriptor
            .preferred_source()
            .cloned()
            .ok_or_else(|| Error::SourceUnavailable {
                errors: vec![format!("[{}] descriptor has no sources", context.episode_id)],
            })?;

        self.teardown();

        let id = EngineId(self.next_engine_id);
        self.next_engine_id += 1;
        let mut engine = self.factory.create(id, self.events_tx.clone());
        if let Err(e) = self.sink.attach(id) {
            engine.destroy();
            return Err(e);
        }

        self.settings = self.store.settings();
        let initial = initial_position
            .or_else(|| {
                self.store
                    .resume_position(&context.anime_id, context.episode_number)
            })
            .unwrap_or(0.0);

        let session = PlaybackSession::new(context, initial);
        let session_id = session.id;
        self.session = Some(session);
        self.subtitle = descriptor.subtitles.first().map(|t| t.label.clone());
        self.set_state(PlayerState::Loading)?;

        engine.set_volume(self.volume, self.muted);
        engine.load_source(&source, &descriptor.headers);
        self.engine = Some(engine);
        self.descriptor = Some(descriptor);

        self.scheduler
            .schedule_repeating(TimerKind::Checkpoint, self.config.checkpoint_interval());

        info!(
            session_id = %session_id,
            engine = %id,
            quality = %source.quality,
            initial_position = initial,
            "Session mounted"
        );
        self.publish();
        Ok(session_id)
    }

    /// Tear down the session: timers cleared, engine destroyed and detached
    pub fn close(&mut self) {
        self.save_if_watching();
        self.teardown();
        self.publish();
    }

    fn teardown(&mut self) {
        self.scheduler.clear();
        if let Some(mut engine) = self.engine.take() {
            let id = engine.id();
            engine.destroy();
            self.sink.detach(id);
            debug!(engine = %id, "Engine destroyed");
        }
        // Anything still queued belongs to the destroyed engine
        while self.events_rx.try_recv().is_ok() {}

        self.session = None;
        self.descriptor = None;
        self.levels.clear();
        self.skip = SkipAffordance::None;
        self.skip_countdown = None;
        self.notification = None;
        self.error = None;
        self.controls_visible = true;
        self.subtitle = None;
    }

    /// Wait for the next engine event or timer and handle it
    pub async fn process_next(&mut self) {
        let deadline = self.scheduler.next_deadline();
        tokio::select! {
            Some(event) = self.events_rx.recv() => self.handle_event(event),
            _ = sleep_until(deadline) => self.fire_due_timers(),
        }
    }

    /// Handle every event already queued, without waiting
    pub fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
        }
    }

    /// Fire every timer that is due now
    pub fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some(kind) = self.scheduler.pop_due(now) {
            self.on_timer(kind);
        }
        self.publish();
    }

    /// Apply one engine event. Events from any engine but the live one are dropped.
    pub fn handle_event(&mut self, event: EngineEvent) {
        if self.engine_id() != Some(event.engine) {
            debug!(engine = %event.engine, "Ignoring event from stale engine");
            return;
        }

        match event.kind {
            EngineEventKind::ManifestParsed { levels } => self.on_manifest_parsed(levels),
            EngineEventKind::LevelSwitched { index } => {
                let label = self.levels.iter().find(|l| l.index == index).map(|l| l.label());
                if let Some(session) = self.session.as_mut() {
                    debug!(level = ?label, "Level switched");
                    session.active_level = label;
                }
            }
            EngineEventKind::DurationChanged { duration } => {
                if let Some(session) = self.session.as_mut() {
                    session.duration = Some(duration);
                }
                self.clamp_segments(duration);
            }
            EngineEventKind::Play => {
                self.try_transition(PlayerState::Playing);
                self.schedule_controls_hide();
            }
            EngineEventKind::Pause => {
                self.try_transition(PlayerState::Paused);
                self.scheduler.cancel(TimerKind::ControlsHide);
                self.controls_visible = true;
            }
            EngineEventKind::Waiting => {
                if self.state() == PlayerState::Playing {
                    self.try_transition(PlayerState::Buffering);
                }
            }
            EngineEventKind::CanPlay => {
                if self.state() == PlayerState::Buffering {
                    self.try_transition(PlayerState::Playing);
                }
            }
            EngineEventKind::TimeUpdate { position } => {
                if let Some(session) = self.session.as_mut() {
                    session.position = position;
                }
                if self.state().evaluates_segments() {
                    self.evaluate_segments();
                }
            }
            EngineEventKind::Ended => self.on_ended(),
            EngineEventKind::Error { kind, fatal, details } => self.on_engine_error(kind, fatal, details),
        }

        self.publish();
    }

    fn on_manifest_parsed(&mut self, levels: Vec<QualityLevel>) {
        info!(levels = levels.len(), "Manifest parsed");
        self.levels = levels;

        if self.state() != PlayerState::Loading {
            // Reload after recovery; levels refreshed, nothing else to redo
            return;
        }

        let preferred = self.settings.default_quality.clone();
        if preferred != AUTO_QUALITY && self.levels.iter().any(|l| l.label() == preferred) {
            self.request_quality_change(&preferred);
        }

        if self.set_state(PlayerState::Ready).is_err() {
            return;
        }

        let initial = self.session.as_ref().map_or(0.0, |s| s.initial_position);
        if initial > 0.0 {
            self.seek_to(initial);
        }

        if self.settings.auto_play {
            if let Some(engine) = self.engine.as_mut() {
                engine.play();
            }
        }
    }

    /// Clip skip segments to the episode; segments starting past the end are dropped
    fn clamp_segments(&mut self, duration: f64) {
        let Some(descriptor) = self.descriptor.as_mut() else {
            return;
        };
        let before = descriptor.skip_segments.len();
        descriptor.skip_segments = descriptor
            .skip_segments
            .iter()
            .filter_map(|s| s.clamp_to(duration))
            .collect();
        let dropped = before - descriptor.skip_segments.len();
        if dropped > 0 {
            debug!(dropped, duration, "Dropped skip segments past the end");
        }
    }

    fn on_ended(&mut self) {
        self.try_transition(PlayerState::Ended);
        self.clear_skip();
        self.controls_visible = true;

        let has_next = self
            .session
            .as_ref()
            .is_some_and(|s| s.context.has_next() && !s.advance_requested);
        if self.settings.auto_next && has_next {
            debug!("Scheduling auto-advance");
            self.scheduler
                .schedule_once(TimerKind::AutoAdvance, self.config.auto_advance_delay());
        }
    }

    fn on_engine_error(&mut self, kind: EngineErrorKind, fatal: bool, details: String) {
        if !fatal {
            debug!(kind = %kind, details = %details, "Non-fatal engine error");
            return;
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };

        match kind {
            EngineErrorKind::Network if session.network_recoveries < self.config.max_network_recoveries => {
                session.network_recoveries += 1;
                warn!(
                    attempt = session.network_recoveries,
                    details = %details,
                    "Network error, reloading source"
                );
                if let Some(engine) = self.engine.as_mut() {
                    engine.start_load();
                }
                if self.state() == PlayerState::Playing {
                    self.try_transition(PlayerState::Buffering);
                }
            }
            EngineErrorKind::Media if session.media_recoveries < self.config.max_media_recoveries => {
                session.media_recoveries += 1;
                warn!(
                    attempt = session.media_recoveries,
                    details = %details,
                    "Media error, attempting recovery"
                );
                if let Some(engine) = self.engine.as_mut() {
                    engine.recover_media_error();
                }
            }
            _ => {
                let error = match kind {
                    EngineErrorKind::Network => Error::EngineNetwork(details),
                    EngineErrorKind::Media => Error::EngineMedia(details),
                    EngineErrorKind::Other => Error::EngineFatal(details),
                };
                warn!(error = %error, "Fatal playback error");
                self.error = Some(error.user_message());
                self.try_transition(PlayerState::Error);
                self.clear_skip();
                self.scheduler.cancel(TimerKind::ControlsHide);
                self.controls_visible = true;
            }
        }
    }

    /// Show the affordance for the segment under the playhead and auto-skip
    /// when the viewer asked for it.
    fn evaluate_segments(&mut self) {
        let position = self.position();
        let active = self
            .descriptor
            .as_ref()
            .and_then(|d| segment::active_at(&d.skip_segments, position))
            .copied();

        let Some(active) = active else {
            self.clear_skip();
            return;
        };

        let affordance = active.kind.affordance();
        let auto_skip = match affordance {
            SkipAffordance::Opening => self.settings.auto_skip_intro,
            SkipAffordance::Ending => self.settings.auto_skip_outro,
            SkipAffordance::None => false,
        };
        if auto_skip {
            let advance = self.settings.auto_next;
            self.skip_segment(&active, advance);
            return;
        }

        if self.skip != affordance {
            debug!(affordance = ?affordance, "Skip affordance shown");
            self.skip = affordance;
            self.scheduler
                .schedule_repeating(TimerKind::SkipCountdown, self.config.skip_countdown_tick());
        }
        self.skip_countdown = Some(active.remaining(position).ceil() as u32);
    }

    /// Leave a segment: openings seek to their end; endings advance to the
    /// next episode when allowed and one exists, otherwise seek.
    fn skip_segment(&mut self, active: &Segment, allow_advance: bool) {
        let advance = active.kind.is_ending_class()
            && allow_advance
            && self
                .session
                .as_ref()
                .is_some_and(|s| s.context.has_next());

        self.clear_skip();
        if advance {
            let already = self.session.as_ref().is_some_and(|s| s.advance_requested);
            if !already {
                info!("Ending skipped, requesting next episode");
                self.request_navigation(true);
                self.notify("Ending skipped, playing next episode");
            }
            return;
        }

        let target = self
            .session
            .as_ref()
            .and_then(|s| s.duration)
            .map_or(active.end_seconds, |d| active.end_seconds.min(d));
        if target <= self.position() {
            return;
        }

        self.seek_to(target);
        if active.kind.is_opening_class() {
            info!(to = active.end_seconds, "Opening skipped");
            self.notify("Opening skipped");
        } else {
            info!(to = active.end_seconds, "Ending skipped");
            self.notify("Ending skipped");
        }
    }

    fn clear_skip(&mut self) {
        if self.skip != SkipAffordance::None {
            debug!("Skip affordance cleared");
        }
        self.skip = SkipAffordance::None;
        self.skip_countdown = None;
        self.scheduler.cancel(TimerKind::SkipCountdown);
    }

    fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Checkpoint => {
                if self.state() == PlayerState::Playing {
                    self.write_progress();
                }
            }
            TimerKind::AutoAdvance => {
                let pending = self
                    .session
                    .as_ref()
                    .is_some_and(|s| s.context.has_next() && !s.advance_requested);
                if pending {
                    info!("Auto-advancing to next episode");
                    self.request_navigation(true);
                }
            }
            TimerKind::NotificationDismiss => self.notification = None,
            TimerKind::ControlsHide => {
                if self.state() == PlayerState::Playing {
                    self.controls_visible = false;
                }
            }
            TimerKind::SkipCountdown => {
                let position = self.position();
                let remaining = self
                    .descriptor
                    .as_ref()
                    .and_then(|d| segment::active_at(&d.skip_segments, position))
                    .map(|s| s.remaining(position).ceil() as u32);
                match remaining {
                    Some(secs) if self.skip != SkipAffordance::None => self.skip_countdown = Some(secs),
                    _ => self.clear_skip(),
                }
            }
        }
    }

    /// Save progress only once something has actually been watched, so a
    /// session that never played can't overwrite a stored resume point.
    fn save_if_watching(&mut self) {
        if self.state().evaluates_segments() && self.position() > 0.0 {
            self.write_progress();
        }
    }

    fn write_progress(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let ctx = &session.context;
        match self.store.set(&ctx.anime_id, ctx.episode_number, session.position) {
            Ok(()) => {
                debug!(anime = %ctx.anime_id, position = session.position, "Progress checkpoint");
                self.last_checkpoint = Some(session.position);
                self.checkpoints += 1;
            }
            Err(e) => warn!(error = %e, "Failed to save progress"),
        }
    }

    /// Apply a viewer intent
    #[instrument(skip(self))]
    pub fn apply(&mut self, intent: Intent) {
        match intent {
            Intent::TogglePlay => {
                if self.state() == PlayerState::Playing {
                    self.pause();
                } else {
                    self.play();
                }
            }
            Intent::Play => self.play(),
            Intent::Pause => self.pause(),
            Intent::SeekForward { large } => {
                let step = self.seek_step(large);
                self.seek_to(self.position() + step);
            }
            Intent::SeekBackward { large } => {
                let step = self.seek_step(large);
                self.seek_to(self.position() - step);
            }
            Intent::SeekTo(position) => self.seek_to(position),
            Intent::SeekToTenth(n) => {
                if let Some(duration) = self.session.as_ref().and_then(|s| s.duration) {
                    self.seek_to(duration * f64::from(n.min(10)) / 10.0);
                }
            }
            Intent::VolumeUp => self.set_volume(self.volume + self.config.volume_step),
            Intent::VolumeDown => self.set_volume(self.volume - self.config.volume_step),
            Intent::ToggleMute => {
                self.muted = !self.muted;
                self.store.set_muted(self.muted);
                self.push_volume();
            }
            Intent::ToggleFullscreen => self.fullscreen = !self.fullscreen,
            Intent::ConfirmSkip => self.confirm_skip(),
            Intent::NextEpisode => self.request_next_episode(),
            Intent::PrevEpisode => self.request_prev_episode(),
            Intent::SelectQuality(label) => {
                self.request_quality_change(&label);
            }
            Intent::SelectServer(name) => self.request_server_change(&name),
            Intent::SelectSubtitle(label) => self.select_subtitle(label),
            Intent::PointerActivity => {
                self.controls_visible = true;
                self.schedule_controls_hide();
            }
        }
        self.publish();
    }

    fn play(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.play();
        }
    }

    fn pause(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.pause();
        }
    }

    fn seek_step(&self, large: bool) -> f64 {
        if large {
            self.config.seek_step_large
        } else {
            self.config.seek_step
        }
    }

    fn seek_to(&mut self, position: f64) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let upper = session.duration.unwrap_or(f64::MAX);
        let target = position.clamp(0.0, upper);
        session.position = target;
        if let Some(engine) = self.engine.as_mut() {
            engine.seek(target);
        }
    }

    fn set_volume(&mut self, volume: f64) {
        self.volume = volume.clamp(0.0, 1.0);
        if let Err(e) = self.store.set_volume(self.volume) {
            warn!(error = %e, "Failed to save volume");
        }
        self.push_volume();
    }

    fn push_volume(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.set_volume(self.volume, self.muted);
        }
    }

    fn confirm_skip(&mut self) {
        if self.skip == SkipAffordance::None {
            return;
        }
        let position = self.position();
        let active = self
            .descriptor
            .as_ref()
            .and_then(|d| segment::active_at(&d.skip_segments, position))
            .copied();
        if let Some(active) = active {
            self.skip_segment(&active, true);
        }
    }

    /// Pin the level with this label, or hand selection back to the engine
    /// with "auto". Returns false when nothing changed.
    pub fn request_quality_change(&mut self, label: &str) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if session.quality.label() == label {
            return false;
        }

        if label == AUTO_QUALITY {
            session.quality = QualityMode::Auto;
            if let Some(engine) = self.engine.as_mut() {
                engine.set_level(None);
            }
        } else {
            let Some(level) = self.levels.iter().find(|l| l.label() == label) else {
                debug!(label = label, "Unknown quality, ignoring");
                return false;
            };
            session.quality = QualityMode::Pinned(label.to_string());
            if let Some(engine) = self.engine.as_mut() {
                engine.set_level(Some(level.index));
            }
        }

        info!(quality = label, "Quality changed");
        self.store.set_current_quality(label);
        self.publish();
        true
    }

    /// Ask the owner to remount on another server
    pub fn request_server_change(&mut self, server: &str) {
        let current = self.descriptor.as_ref().and_then(|d| d.server.as_deref());
        if current == Some(server) || self.session.is_none() {
            return;
        }
        info!(server = server, "Server change requested");
        self.requests.push(ControllerRequest::ChangeServer(server.to_string()));
    }

    pub fn request_next_episode(&mut self) {
        if self.session.as_ref().is_some_and(|s| s.context.has_next()) {
            self.save_if_watching();
            self.request_navigation(true);
        }
    }

    pub fn request_prev_episode(&mut self) {
        if self.session.as_ref().is_some_and(|s| s.context.has_previous()) {
            self.save_if_watching();
            self.request_navigation(false);
        }
    }

    fn request_navigation(&mut self, forward: bool) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let current = session.context.episode_number;
        let navigation = if forward {
            session.advance_requested = true;
            Navigation::Next { episode: current + 1 }
        } else {
            Navigation::Previous { episode: current - 1 }
        };
        self.scheduler.cancel(TimerKind::AutoAdvance);
        self.requests.push(ControllerRequest::Navigate(navigation));
    }

    fn select_subtitle(&mut self, label: Option<String>) {
        let known = self
            .descriptor
            .as_ref()
            .is_some_and(|d| label.as_ref().map_or(true, |l| d.subtitles.iter().any(|t| &t.label == l)));
        if known {
            self.subtitle = label;
        }
    }

    fn notify(&mut self, message: &str) {
        self.notification = Some(message.to_string());
        self.scheduler
            .schedule_once(TimerKind::NotificationDismiss, self.config.notification_duration());
    }

    fn schedule_controls_hide(&mut self) {
        if self.state() == PlayerState::Playing {
            self.scheduler
                .schedule_once(TimerKind::ControlsHide, self.config.controls_hide_delay());
        }
    }

    /// Transition to new state
    fn set_state(&mut self, new_state: PlayerState) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::InvalidStateTransition {
                from: PlayerState::Idle.to_string(),
                to: new_state.to_string(),
            })?;
        let current = session.state;

        if !current.can_transition_to(new_state) {
            return Err(Error::InvalidStateTransition {
                from: current.to_string(),
                to: new_state.to_string(),
            });
        }

        session.state = new_state;
        info!(from = %current, to = %new_state, "State transition");
        Ok(())
    }

    /// Engine-driven transition; an event that doesn't fit the current state
    /// is logged and dropped.
    fn try_transition(&mut self, new_state: PlayerState) {
        if self.state() == new_state {
            return;
        }
        if let Err(e) = self.set_state(new_state) {
            debug!(error = %e, "Ignoring engine event");
        }
    }

    /// Build the current snapshot
    pub fn snapshot(&self) -> PlayerSnapshot {
        let session = self.session.as_ref();
        let descriptor = self.descriptor.as_ref();
        let mut qualities = vec![AUTO_QUALITY.to_string()];
        qualities.extend(self.levels.iter().map(QualityLevel::label));

        PlayerSnapshot {
            session_id: session.map(|s| s.id),
            anime_id: session.map(|s| s.context.anime_id.clone()),
            episode_number: session.map(|s| s.context.episode_number),
            state: self.state(),
            position: self.position(),
            duration: session.and_then(|s| s.duration),
            buffering: self.state() == PlayerState::Buffering,
            quality: self.quality(),
            active_level: session.and_then(|s| s.active_level.clone()),
            qualities,
            skip: self.skip,
            skip_countdown: self.skip_countdown,
            notification: self.notification.clone(),
            error: self.error.clone(),
            controls_visible: self.controls_visible,
            volume: self.volume,
            muted: self.muted,
            fullscreen: self.fullscreen,
            subtitles: descriptor
                .map(|d| d.subtitles.iter().map(|t| t.label.clone()).collect())
                .unwrap_or_default(),
            subtitle: self.subtitle.clone(),
            server: descriptor.and_then(|d| d.server.clone()),
            servers: descriptor.map(|d| d.servers.clone()).unwrap_or_default(),
            last_checkpoint: self.last_checkpoint,
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
