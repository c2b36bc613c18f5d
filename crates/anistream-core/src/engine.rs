//! Adaptive-bitrate media engine abstraction
//!
//! The controller drives an engine through synchronous commands and hears back
//! through an event channel. Every event carries the id of the engine that
//! produced it, so events from a destroyed engine can be told apart from the
//! current one.

use crate::{
    types::{QualityLevel, VideoSource},
    Error, Result,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Identity of one engine instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId(pub u64);

impl std::fmt::Display for EngineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "engine-{}", self.0)
    }
}

/// Error classes reported by an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// Manifest or fragment loading failed
    Network,
    /// Decoding or buffer append failed
    Media,
    /// Anything else (incompatible codecs, parse failures, ...)
    Other,
}

impl std::fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineErrorKind::Network => write!(f, "network"),
            EngineErrorKind::Media => write!(f, "media"),
            EngineErrorKind::Other => write!(f, "other"),
        }
    }
}

/// What happened inside the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEventKind {
    /// Manifest parsed; levels ordered by ascending bandwidth
    ManifestParsed { levels: Vec<QualityLevel> },
    /// Engine switched to the level at this index
    LevelSwitched { index: usize },
    /// Media duration became known
    DurationChanged { duration: f64 },
    Play,
    Pause,
    /// Playback stalled waiting for data
    Waiting,
    /// Enough data to resume
    CanPlay,
    TimeUpdate { position: f64 },
    Ended,
    Error {
        kind: EngineErrorKind,
        fatal: bool,
        details: String,
    },
}

/// Event tagged with its source engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub engine: EngineId,
    pub kind: EngineEventKind,
}

impl EngineEvent {
    pub fn new(engine: EngineId, kind: EngineEventKind) -> Self {
        Self { engine, kind }
    }
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Adaptive-bitrate media engine
pub trait MediaEngine: Send {
    fn id(&self) -> EngineId;

    /// Start loading a source; the engine answers with `ManifestParsed` or `Error`
    fn load_source(&mut self, source: &VideoSource, headers: &BTreeMap<String, String>);

    /// Pin a level by index, or hand selection back to the engine with `None`
    fn set_level(&mut self, level: Option<usize>);

    /// Restart loading after a network error, keeping the position
    fn start_load(&mut self);

    /// Try to recover from a decode error
    fn recover_media_error(&mut self);

    fn play(&mut self);

    fn pause(&mut self);

    fn seek(&mut self, position: f64);

    fn set_volume(&mut self, volume: f64, muted: bool);

    /// Stop all work; no event may be emitted afterwards
    fn destroy(&mut self);
}

/// Creates engines bound to an event channel
pub trait EngineFactory: Send + Sync {
    fn create(&self, id: EngineId, events: EngineEventSender) -> Box<dyn MediaEngine>;
}

/// The single playback surface. At most one engine is attached at a time.
#[derive(Debug, Clone, Default)]
pub struct MediaSink {
    attached: Arc<Mutex<Option<EngineId>>>,
}

impl MediaSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an engine. Fails while another engine is still attached.
    pub fn attach(&self, engine: EngineId) -> Result<()> {
        let mut attached = self.attached.lock();
        match *attached {
            Some(current) if current != engine => Err(Error::SinkBusy {
                attached: current.to_string(),
            }),
            _ => {
                debug!(engine = %engine, "Attached to media sink");
                *attached = Some(engine);
                Ok(())
            }
        }
    }

    /// Detach an engine; returns false when it wasn't the attached one
    pub fn detach(&self, engine: EngineId) -> bool {
        let mut attached = self.attached.lock();
        if *attached == Some(engine) {
            debug!(engine = %engine, "Detached from media sink");
            *attached = None;
            true
        } else {
            false
        }
    }

    pub fn attached(&self) -> Option<EngineId> {
        *self.attached.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_rejects_second_engine() {
        let sink = MediaSink::new();
        sink.attach(EngineId(1)).unwrap();
        assert!(sink.attach(EngineId(1)).is_ok());
        assert!(matches!(sink.attach(EngineId(2)), Err(Error::SinkBusy { .. })));

        assert!(!sink.detach(EngineId(2)));
        assert!(sink.detach(EngineId(1)));
        sink.attach(EngineId(2)).unwrap();
        assert_eq!(sink.attached(), Some(EngineId(2)));
    }

    #[test]
    fn test_sink_clones_share_state() {
        let sink = MediaSink::new();
        let view = sink.clone();
        sink.attach(EngineId(7)).unwrap();
        assert_eq!(view.attached(), Some(EngineId(7)));
    }
}
