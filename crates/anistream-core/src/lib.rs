//! Anistream Core - anime stream resolution and playback control
//!
//! This crate provides the core functionality for watching an episode:
//! - Endpoint pool with concurrent liveness probing and a TTL'd best pick
//! - Source resolution with endpoint failover and provider fallback
//! - Skip-segment (opening/ending) lookup and merging
//! - Playback controller state machine over an adaptive-bitrate engine
//! - Watch progress, bookmarks and preferences
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Anistream Core                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Endpoint   │  │    Source    │  │    Source    │           │
//! │  │     Pool     │──│   Resolver   │──│    Loader    │           │
//! │  └──────────────┘  └──────────────┘  └──────┬───────┘           │
//! │                                             │                   │
//! │                                      ┌──────┴──────┐            │
//! │                                      │    Watch    │            │
//! │                                      │   Session   │            │
//! │                                      └──────┬──────┘            │
//! │                                             │                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────┴───────┐           │
//! │  │   Progress   │──│   Playback   │──│ Media Engine │           │
//! │  │    Store     │  │  Controller  │  │  (HLS, ABR)  │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod types;
pub mod segment;
pub mod config;
pub mod transport;
pub mod endpoint;
pub mod upstream;
pub mod fallback;
pub mod resolver;
pub mod loader;
pub mod engine;
pub mod abr;
#[cfg(feature = "hls")]
pub mod hls;
pub mod scheduler;
pub mod controller;
pub mod store;
pub mod watch;

pub use error::{Error, Result};
pub use types::*;
pub use segment::{Segment, SegmentKind};
pub use config::{Config, PlaybackConfig, UpstreamConfig};
pub use transport::{HttpResponse, HttpTransport, Transport};
pub use endpoint::{EndpointCandidate, EndpointPool};
pub use fallback::FallbackChain;
pub use resolver::SourceResolver;
pub use loader::{SkipTimesKey, SourceLoader};
pub use engine::{EngineEvent, EngineEventKind, EngineFactory, EngineId, MediaEngine, MediaSink};
pub use abr::ThroughputAbr;
#[cfg(feature = "hls")]
pub use hls::{HlsEngine, HlsEngineFactory};
pub use controller::{ControllerRequest, Intent, PlaybackController, PlayerSnapshot, SessionContext};
pub use store::{ProgressStore, WatchProgress};
pub use watch::WatchSession;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the library (call once at startup)
pub fn init() {
    tracing::info!(version = VERSION, "Anistream Core initialized");
}
