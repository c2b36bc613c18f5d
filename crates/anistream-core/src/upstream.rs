//! Typed upstream response shapes
//!
//! Every upstream payload is decoded into one of these structs and narrowed into
//! core types here. Malformed entries are dropped; a payload that cannot yield
//! anything usable is an error so the caller can fall back.

use crate::{
    segment::{Segment, SegmentKind},
    types::{sort_sources, AnimeInfo, Episode, Provider, SearchResult, StreamDescriptor, SubtitleTrack, VideoSource},
    Error, Result,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

/// `/anime/{provider}/watch` response
#[derive(Debug, Deserialize)]
pub struct RawSources {
    #[serde(default)]
    pub sources: Option<Vec<RawSource>>,
    #[serde(default)]
    pub subtitles: Vec<RawSubtitle>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub intro: Option<RawInterval>,
    #[serde(default)]
    pub outro: Option<RawInterval>,
}

#[derive(Debug, Deserialize)]
pub struct RawSource {
    pub url: String,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default, rename = "isM3U8")]
    pub is_m3u8: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct RawSubtitle {
    pub url: String,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RawInterval {
    pub start: f64,
    pub end: f64,
}

impl RawSources {
    /// Narrow into a descriptor. Fails when no source survives validation.
    pub fn into_descriptor(self, provider: Provider, episode_id: &str) -> Result<StreamDescriptor> {
        let raw_sources = self
            .sources
            .ok_or_else(|| Error::InvalidResponse("missing `sources` array".into()))?;

        let mut sources: Vec<VideoSource> = raw_sources
            .into_iter()
            .filter_map(|raw| {
                let url = Url::parse(&raw.url).ok()?;
                let is_m3u8 = raw
                    .is_m3u8
                    .unwrap_or_else(|| url.path().ends_with(".m3u8"));
                Some(VideoSource {
                    url,
                    quality: raw.quality.unwrap_or_else(|| "default".to_string()),
                    is_m3u8,
                })
            })
            .collect();

        if sources.is_empty() {
            return Err(Error::ProviderNotFound {
                provider: provider.to_string(),
                episode_id: episode_id.to_string(),
            });
        }
        sort_sources(&mut sources);

        let subtitles = self
            .subtitles
            .into_iter()
            .filter_map(|raw| {
                let url = Url::parse(&raw.url).ok()?;
                let lang = raw.lang.unwrap_or_default();
                // Thumbnail sprite tracks ride along with subtitles upstream
                if lang.eq_ignore_ascii_case("thumbnails") {
                    return None;
                }
                let label = raw.label.unwrap_or_else(|| lang.clone());
                Some(SubtitleTrack { url, lang, label })
            })
            .collect();

        let skip_segments = [
            self.intro.and_then(|i| Segment::new(SegmentKind::Opening, i.start, i.end)),
            self.outro.and_then(|i| Segment::new(SegmentKind::Ending, i.start, i.end)),
        ]
        .into_iter()
        .flatten()
        .collect();

        Ok(StreamDescriptor {
            sources,
            subtitles,
            skip_segments,
            servers: Vec::new(),
            headers: self.headers,
            provider: Some(provider),
            server: None,
        })
    }
}

/// Skip-time service response
#[derive(Debug, Deserialize)]
pub struct RawSkipTimes {
    #[serde(default)]
    pub found: bool,
    #[serde(default)]
    pub results: Vec<RawSkipTime>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSkipTime {
    pub interval: RawSkipInterval,
    pub skip_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSkipInterval {
    pub start_time: f64,
    pub end_time: f64,
}

impl RawSkipTimes {
    /// Valid segments only; unknown kinds and empty intervals are dropped
    pub fn into_segments(self) -> Vec<Segment> {
        if !self.found {
            return Vec::new();
        }
        self.results
            .into_iter()
            .filter_map(|raw| {
                let kind = parse_skip_type(&raw.skip_type)?;
                let segment = Segment::new(kind, raw.interval.start_time, raw.interval.end_time);
                if segment.is_none() {
                    debug!(
                        kind = %kind,
                        start = raw.interval.start_time,
                        end = raw.interval.end_time,
                        "Dropping invalid skip interval"
                    );
                }
                segment
            })
            .collect()
    }
}

fn parse_skip_type(raw: &str) -> Option<SegmentKind> {
    match raw {
        "op" => Some(SegmentKind::Opening),
        "ed" => Some(SegmentKind::Ending),
        "recap" => Some(SegmentKind::Recap),
        "mixed-op" => Some(SegmentKind::MixedOpening),
        "mixed-ed" => Some(SegmentKind::MixedEnding),
        _ => None,
    }
}

/// `/anime/{provider}/info` response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAnimeInfo {
    pub id: String,
    #[serde(default)]
    pub title: Option<RawTitle>,
    #[serde(default)]
    pub mal_id: Option<RawNumber>,
    #[serde(default)]
    pub total_episodes: Option<u32>,
    #[serde(default)]
    pub episodes: Vec<RawEpisode>,
}

/// Titles come either as a plain string or as a localized object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawTitle {
    Plain(String),
    Localized {
        #[serde(default)]
        english: Option<String>,
        #[serde(default)]
        romaji: Option<String>,
    },
}

impl RawTitle {
    fn into_string(self) -> Option<String> {
        match self {
            RawTitle::Plain(title) => Some(title),
            RawTitle::Localized { english, romaji } => english.or(romaji),
        }
    }
}

/// Numeric ids sometimes arrive as strings
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawNumber {
    Number(u64),
    Text(String),
}

impl RawNumber {
    fn value(&self) -> Option<u64> {
        match self {
            RawNumber::Number(n) => Some(*n),
            RawNumber::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RawEpisode {
    pub id: String,
    #[serde(default)]
    pub number: Option<f64>,
    #[serde(default)]
    pub title: Option<String>,
}

impl RawAnimeInfo {
    pub fn into_info(self, provider: Provider) -> AnimeInfo {
        let episodes = self
            .episodes
            .into_iter()
            .enumerate()
            .map(|(idx, raw)| Episode {
                id: raw.id,
                number: raw
                    .number
                    .filter(|n| n.is_finite() && *n >= 1.0)
                    .map(|n| n as u32)
                    .unwrap_or(idx as u32 + 1),
                title: raw.title.filter(|t| !t.is_empty()),
            })
            .collect();

        AnimeInfo {
            title: self
                .title
                .and_then(RawTitle::into_string)
                .unwrap_or_else(|| self.id.clone()),
            id: self.id,
            mal_id: self.mal_id.as_ref().and_then(RawNumber::value),
            total_episodes: self.total_episodes,
            episodes,
            provider,
        }
    }
}

/// `/anime/{provider}/servers` response: a list of names or of `{name, url}` objects
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawServer {
    Name(String),
    Entry { name: String },
}

/// Normalize server names ("VidCloud" -> "vidcloud"), dropping duplicates
pub fn server_names(raw: Vec<RawServer>) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for server in raw {
        let name = match server {
            RawServer::Name(name) | RawServer::Entry { name } => name.trim().to_lowercase(),
        };
        if !name.is_empty() && !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Search response
#[derive(Debug, Deserialize)]
pub struct RawSearch {
    #[serde(default)]
    pub results: Vec<RawSearchHit>,
}

#[derive(Debug, Deserialize)]
pub struct RawSearchHit {
    pub id: String,
    #[serde(default)]
    pub title: Option<RawTitle>,
    #[serde(default)]
    pub image: Option<String>,
}

impl RawSearch {
    pub fn into_results(self, provider: Provider) -> Vec<SearchResult> {
        self.results
            .into_iter()
            .filter_map(|hit| {
                let title = hit.title.and_then(RawTitle::into_string)?;
                Some(SearchResult {
                    id: hit.id,
                    title,
                    image: hit.image,
                    provider,
                })
            })
            .collect()
    }
}
