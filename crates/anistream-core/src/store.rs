//! Watch progress, bookmarks and preferences
//!
//! Process-wide keyed state loaded once from a single namespaced record and
//! flushed back after every durable mutation. Only settings, watch history,
//! bookmarks and volume are durable; the current quality, dub and mute flag
//! live for the process only.

use crate::{
    types::{PlayerSettings, SettingsPatch},
    Error, Result,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name of the durable record
pub const STORAGE_NAMESPACE: &str = "anime-player-storage";

/// Last known position for one anime. Overwritten wholesale on every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchProgress {
    pub episode: u32,
    /// Position in seconds
    pub progress: f64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Durable part of the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedState {
    pub settings: PlayerSettings,
    pub watch_history: BTreeMap<String, WatchProgress>,
    /// Bookmarked anime ids in insertion order
    pub bookmarks: Vec<String>,
    pub volume: f64,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            settings: PlayerSettings::default(),
            watch_history: BTreeMap::new(),
            bookmarks: Vec::new(),
            volume: 1.0,
        }
    }
}

/// On-disk envelope
#[derive(Debug, Serialize, Deserialize)]
struct PersistedRecord {
    state: PersistedState,
    #[serde(default)]
    version: u32,
}

/// Process-only part of the store
#[derive(Debug, Clone)]
struct EphemeralState {
    current_quality: String,
    current_dub: String,
    muted: bool,
}

impl Default for EphemeralState {
    fn default() -> Self {
        Self {
            current_quality: "1080p".to_string(),
            current_dub: "sub".to_string(),
            muted: false,
        }
    }
}

struct StoreInner {
    persisted: PersistedState,
    ephemeral: EphemeralState,
}

/// Shared handle to the progress store
#[derive(Clone)]
pub struct ProgressStore {
    inner: Arc<RwLock<StoreInner>>,
    /// Record file; None keeps everything in memory
    path: Option<Arc<PathBuf>>,
}

impl ProgressStore {
    /// Store kept in memory only
    pub fn in_memory() -> Self {
        Self::with_state(PersistedState::default(), None)
    }

    /// Open the record inside `dir`, starting from defaults when it is missing
    /// or unreadable.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", STORAGE_NAMESPACE));

        let persisted = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<PersistedRecord>(&raw) {
                Ok(record) => {
                    info!(
                        path = %path.display(),
                        history = record.state.watch_history.len(),
                        bookmarks = record.state.bookmarks.len(),
                        "Loaded progress store"
                    );
                    record.state
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Progress record is corrupt, starting fresh");
                    PersistedState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No progress record yet");
                PersistedState::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self::with_state(persisted, Some(path)))
    }

    fn with_state(persisted: PersistedState, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                persisted,
                ephemeral: EphemeralState::default(),
            })),
            path: path.map(Arc::new),
        }
    }

    /// Record file location, if durable
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref().map(PathBuf::as_path)
    }

    /// Last known episode and position for an anime
    pub fn get(&self, anime_id: &str) -> Option<WatchProgress> {
        self.inner.read().persisted.watch_history.get(anime_id).cloned()
    }

    /// Overwrite the progress entry for an anime
    pub fn set(&self, anime_id: &str, episode: u32, position: f64) -> Result<()> {
        let entry = WatchProgress {
            episode,
            progress: position.max(0.0),
            timestamp: Utc::now(),
        };
        self.mutate(|state| {
            state.watch_history.insert(anime_id.to_string(), entry);
        })
    }

    /// Saved position when the stored entry is for this episode
    pub fn resume_position(&self, anime_id: &str, episode: u32) -> Option<f64> {
        self.get(anime_id)
            .filter(|p| p.episode == episode && p.progress > 0.0)
            .map(|p| p.progress)
    }

    /// Watch history, most recent first
    pub fn history(&self) -> Vec<(String, WatchProgress)> {
        let mut entries: Vec<_> = self
            .inner
            .read()
            .persisted
            .watch_history
            .iter()
            .map(|(id, p)| (id.clone(), p.clone()))
            .collect();
        entries.sort_by(|a, b| b.1.timestamp.cmp(&a.1.timestamp));
        entries
    }

    /// Flip the bookmark for an anime; returns the new state
    pub fn toggle_bookmark(&self, anime_id: &str) -> Result<bool> {
        let mut now_bookmarked = false;
        self.mutate(|state| {
            if let Some(pos) = state.bookmarks.iter().position(|id| id == anime_id) {
                state.bookmarks.remove(pos);
            } else {
                state.bookmarks.push(anime_id.to_string());
                now_bookmarked = true;
            }
        })?;
        Ok(now_bookmarked)
    }

    pub fn is_bookmarked(&self, anime_id: &str) -> bool {
        self.inner.read().persisted.bookmarks.iter().any(|id| id == anime_id)
    }

    pub fn bookmarks(&self) -> Vec<String> {
        self.inner.read().persisted.bookmarks.clone()
    }

    pub fn settings(&self) -> PlayerSettings {
        self.inner.read().persisted.settings.clone()
    }

    /// Merge a partial settings update
    pub fn update_settings(&self, patch: SettingsPatch) -> Result<PlayerSettings> {
        let mut updated = PlayerSettings::default();
        self.mutate(|state| {
            state.settings.apply(patch);
            updated = state.settings.clone();
        })?;
        Ok(updated)
    }

    pub fn volume(&self) -> f64 {
        self.inner.read().persisted.volume
    }

    pub fn set_volume(&self, volume: f64) -> Result<()> {
        self.mutate(|state| state.volume = volume.clamp(0.0, 1.0))
    }

    pub fn current_quality(&self) -> String {
        self.inner.read().ephemeral.current_quality.clone()
    }

    pub fn set_current_quality(&self, quality: impl Into<String>) {
        self.inner.write().ephemeral.current_quality = quality.into();
    }

    pub fn current_dub(&self) -> String {
        self.inner.read().ephemeral.current_dub.clone()
    }

    pub fn set_current_dub(&self, dub: impl Into<String>) {
        self.inner.write().ephemeral.current_dub = dub.into();
    }

    pub fn muted(&self) -> bool {
        self.inner.read().ephemeral.muted
    }

    pub fn set_muted(&self, muted: bool) {
        self.inner.write().ephemeral.muted = muted;
    }

    /// Snapshot of the durable state
    pub fn persisted(&self) -> PersistedState {
        self.inner.read().persisted.clone()
    }

    /// Apply a durable mutation and flush while still holding the lock, so
    /// writes reach disk in mutation order.
    fn mutate(&self, f: impl FnOnce(&mut PersistedState)) -> Result<()> {
        let mut inner = self.inner.write();
        f(&mut inner.persisted);
        if let Some(path) = &self.path {
            write_record(path, &inner.persisted)?;
        }
        Ok(())
    }
}

/// Write via a temp file and rename so a crash never leaves a torn record
fn write_record(path: &Path, state: &PersistedState) -> Result<()> {
    let record = PersistedRecord {
        state: state.clone(),
        version: 0,
    };
    let data = serde_json::to_vec_pretty(&record)?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)
        .map_err(|e| Error::Storage(format!("failed to write {}: {}", tmp.display(), e)))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| Error::Storage(format!("failed to replace {}: {}", path.display(), e)))?;
    Ok(())
}
