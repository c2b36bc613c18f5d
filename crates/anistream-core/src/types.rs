//! Core types for Anistream

use crate::segment::Segment;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use url::Url;
use uuid::Uuid;

/// Label used for the engine-driven quality mode
pub const AUTO_QUALITY: &str = "auto";

/// Unique identifier for a playback session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upstream content provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Zoro,
    Gogoanime,
}

impl Provider {
    /// Path segment used by the upstream API
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Zoro => "zoro",
            Provider::Gogoanime => "gogoanime",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "zoro" => Ok(Provider::Zoro),
            "gogoanime" | "gogo" => Ok(Provider::Gogoanime),
            other => Err(crate::Error::InvalidConfig(format!("unknown provider '{}'", other))),
        }
    }
}

/// A request for a stream descriptor. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolutionRequest {
    pub episode_id: String,
    pub provider: Provider,
    pub server: Option<String>,
}

impl ResolutionRequest {
    pub fn new(episode_id: impl Into<String>, provider: Provider, server: Option<String>) -> Self {
        Self {
            episode_id: episode_id.into(),
            provider,
            server,
        }
    }
}

/// A playable media URL offered by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSource {
    pub url: Url,
    /// Quality label as reported upstream ("1080p", "default", "auto", ...)
    pub quality: String,
    /// True when the URL points at an adaptive (HLS) manifest
    pub is_m3u8: bool,
}

impl VideoSource {
    /// Numeric height parsed from the quality label
    pub fn height(&self) -> Option<u32> {
        parse_quality_height(&self.quality)
    }
}

/// Subtitle track attached to a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleTrack {
    pub url: Url,
    /// Language code or name as reported upstream
    pub lang: String,
    /// Human-readable label
    pub label: String,
}

/// Everything needed to start playback of one episode on one server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Sources ordered by descending quality, unparseable qualities last
    pub sources: Vec<VideoSource>,
    pub subtitles: Vec<SubtitleTrack>,
    pub skip_segments: Vec<Segment>,
    /// CDN servers offered for this episode
    pub servers: Vec<String>,
    /// Request headers the provider expects when fetching media (e.g. Referer)
    pub headers: BTreeMap<String, String>,
    /// Provider that produced this descriptor
    pub provider: Option<Provider>,
    /// Server that produced this descriptor
    pub server: Option<String>,
}

impl StreamDescriptor {
    /// Source to hand to the adaptive engine: first HLS manifest, else the best source
    pub fn preferred_source(&self) -> Option<&VideoSource> {
        self.sources
            .iter()
            .find(|s| s.is_m3u8)
            .or_else(|| self.sources.first())
    }

    /// Add segments whose class (opening, ending, recap) isn't covered yet
    pub fn merge_skip_segments(&mut self, segments: impl IntoIterator<Item = Segment>) {
        for segment in segments {
            if !self.skip_segments.iter().any(|s| s.kind.same_class(segment.kind)) {
                self.skip_segments.push(segment);
            }
        }
    }
}

/// Sort sources by descending numeric quality. Stable, so unparseable
/// qualities keep fetch order at the end.
pub fn sort_sources(sources: &mut [VideoSource]) {
    sources.sort_by(|a, b| match (a.height(), b.height()) {
        (Some(ha), Some(hb)) => hb.cmp(&ha),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

/// Parse the leading number of a quality label ("1080p" -> 1080)
pub fn parse_quality_height(label: &str) -> Option<u32> {
    let digits: String = label
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok().filter(|h| *h > 0)
}

/// Quality level exposed by the adaptive engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityLevel {
    /// Index in the engine's level list
    pub index: usize,
    /// Vertical resolution
    pub height: u32,
    /// Bandwidth in bits per second
    pub bandwidth: u64,
    /// Variant playlist URL
    pub uri: Option<Url>,
}

impl QualityLevel {
    pub fn new(index: usize, height: u32, bandwidth: u64) -> Self {
        Self {
            index,
            height,
            bandwidth,
            uri: None,
        }
    }

    /// Label shown to the viewer ("720p")
    pub fn label(&self) -> String {
        format!("{}p", self.height)
    }
}

/// How the engine picks its level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityMode {
    /// Engine heuristic decides
    Auto,
    /// Pinned to the level with this label
    Pinned(String),
}

impl QualityMode {
    pub fn label(&self) -> &str {
        match self {
            QualityMode::Auto => AUTO_QUALITY,
            QualityMode::Pinned(label) => label,
        }
    }
}

/// Playback controller states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlayerState {
    /// No descriptor mounted
    Idle,
    /// Engine is loading the manifest
    Loading,
    /// Manifest parsed, levels known
    Ready,
    /// Media is playing
    Playing,
    /// Playback paused
    Paused,
    /// Waiting for data
    Buffering,
    /// Playback complete
    Ended,
    /// Fatal error surfaced to the viewer
    Error,
}

impl PlayerState {
    /// Check if transition to target state is valid
    pub fn can_transition_to(&self, target: PlayerState) -> bool {
        use PlayerState::*;
        matches!(
            (self, target),
            // From Idle
            (Idle, Loading) |
            // From Loading
            (Loading, Ready) | (Loading, Error) |
            // From Ready
            (Ready, Playing) | (Ready, Paused) | (Ready, Buffering) | (Ready, Ended) | (Ready, Error) |
            // From Playing
            (Playing, Paused) | (Playing, Buffering) | (Playing, Ended) | (Playing, Error) |
            // From Paused
            (Paused, Playing) | (Paused, Buffering) | (Paused, Ended) | (Paused, Error) |
            // From Buffering
            (Buffering, Playing) | (Buffering, Paused) | (Buffering, Ended) | (Buffering, Error) |
            // From Error
            (Error, Loading)
        )
    }

    /// States in which segment-skip evaluation runs
    pub fn evaluates_segments(&self) -> bool {
        matches!(self, PlayerState::Playing | PlayerState::Paused)
    }
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayerState::Idle => write!(f, "idle"),
            PlayerState::Loading => write!(f, "loading"),
            PlayerState::Ready => write!(f, "ready"),
            PlayerState::Playing => write!(f, "playing"),
            PlayerState::Paused => write!(f, "paused"),
            PlayerState::Buffering => write!(f, "buffering"),
            PlayerState::Ended => write!(f, "ended"),
            PlayerState::Error => write!(f, "error"),
        }
    }
}

/// Which skip button is shown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkipAffordance {
    #[default]
    None,
    Opening,
    Ending,
}

/// Viewer preferences (persisted)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerSettings {
    pub auto_skip_intro: bool,
    pub auto_skip_outro: bool,
    pub auto_play: bool,
    pub auto_next: bool,
    pub default_quality: String,
    pub volume: f64,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            auto_skip_intro: true,
            auto_skip_outro: false,
            auto_play: true,
            auto_next: true,
            default_quality: "1080p".to_string(),
            volume: 1.0,
        }
    }
}

/// Partial settings update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub auto_skip_intro: Option<bool>,
    pub auto_skip_outro: Option<bool>,
    pub auto_play: Option<bool>,
    pub auto_next: Option<bool>,
    pub default_quality: Option<String>,
    pub volume: Option<f64>,
}

impl PlayerSettings {
    /// Apply only the fields present in the patch
    pub fn apply(&mut self, patch: SettingsPatch) {
        if let Some(v) = patch.auto_skip_intro {
            self.auto_skip_intro = v;
        }
        if let Some(v) = patch.auto_skip_outro {
            self.auto_skip_outro = v;
        }
        if let Some(v) = patch.auto_play {
            self.auto_play = v;
        }
        if let Some(v) = patch.auto_next {
            self.auto_next = v;
        }
        if let Some(v) = patch.default_quality {
            self.default_quality = v;
        }
        if let Some(v) = patch.volume {
            self.volume = v.clamp(0.0, 1.0);
        }
    }
}

/// Episode of an anime as listed by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// Provider-specific episode identifier
    pub id: String,
    pub number: u32,
    pub title: Option<String>,
}

/// Anime details needed to drive playback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimeInfo {
    pub id: String,
    pub title: String,
    /// External catalog id used by the skip-time service
    pub mal_id: Option<u64>,
    pub total_episodes: Option<u32>,
    pub episodes: Vec<Episode>,
    pub provider: Provider,
}

impl AnimeInfo {
    /// Episode with the given number, else the one at position `number - 1`
    pub fn find_episode(&self, number: u32) -> Option<&Episode> {
        self.episodes
            .iter()
            .find(|e| e.number == number)
            .or_else(|| {
                number
                    .checked_sub(1)
                    .and_then(|idx| self.episodes.get(idx as usize))
            })
    }

    /// Number of episodes known for this anime
    pub fn episode_count(&self) -> u32 {
        self.total_episodes
            .unwrap_or(0)
            .max(self.episodes.len() as u32)
    }
}

/// Resolved anime + chosen episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSelection {
    pub anime: AnimeInfo,
    pub episode: Episode,
}

/// Search hit from one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    pub image: Option<String>,
    pub provider: Provider,
}

/// Request to move to another episode, emitted by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Navigation {
    Next { episode: u32 },
    Previous { episode: u32 },
}

impl Navigation {
    /// Target episode number
    pub fn episode(&self) -> u32 {
        match self {
            Navigation::Next { episode } | Navigation::Previous { episode } => *episode,
        }
    }
}
