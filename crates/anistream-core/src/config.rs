//! Runtime configuration
//!
//! Defaults cover the public upstream instances. A JSON file and a handful of
//! environment variables can override them.

use crate::{types::Provider, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Environment variable holding a comma separated endpoint list
pub const ENV_ENDPOINTS: &str = "ANISTREAM_ENDPOINTS";
/// Environment variable overriding the skip-time service base URL
pub const ENV_ANISKIP_URL: &str = "ANISTREAM_ANISKIP_URL";
/// Environment variable overriding the data directory
pub const ENV_DATA_DIR: &str = "ANISTREAM_DATA_DIR";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub playback: PlaybackConfig,
    /// Directory holding the durable progress record
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            playback: PlaybackConfig::default(),
            data_dir: None,
        }
    }
}

/// Upstream API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Candidate API base addresses
    pub endpoints: Vec<Url>,
    /// Skip-time service base URL
    pub aniskip_url: Url,
    /// Provider fallback order
    pub providers: Vec<Provider>,
    /// CDN servers tried when the provider doesn't list any
    pub default_servers: Vec<String>,
    /// Liveness probe timeout in milliseconds
    pub probe_timeout_ms: u64,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Best-endpoint cache lifetime in seconds
    pub endpoint_ttl_secs: u64,
    /// Delay before trying the next CDN server, in milliseconds
    pub server_retry_delay_ms: u64,
    /// Cache lifetime for search and info responses, in seconds
    pub search_cache_secs: u64,
    /// Cache lifetime for stream descriptors, in seconds
    pub sources_cache_secs: u64,
    /// Cache lifetime for skip-time lookups, in seconds
    pub skip_times_cache_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoints: [
                "https://consumet-api.vercel.app",
                "https://api.consumet.org",
                "https://consumet.azurewebsites.net",
            ]
            .iter()
            .filter_map(|u| Url::parse(u).ok())
            .collect(),
            aniskip_url: Url::parse("https://api.aniskip.com/v2").expect("static URL is valid"),
            providers: vec![Provider::Zoro, Provider::Gogoanime],
            default_servers: ["vidcloud", "streamsb", "vidstreaming", "mega"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            probe_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            endpoint_ttl_secs: 300,
            server_retry_delay_ms: 1_000,
            search_cache_secs: 300,
            sources_cache_secs: 60,
            skip_times_cache_secs: 86_400,
        }
    }
}

impl UpstreamConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn endpoint_ttl(&self) -> Duration {
        Duration::from_secs(self.endpoint_ttl_secs)
    }

    pub fn server_retry_delay(&self) -> Duration {
        Duration::from_millis(self.server_retry_delay_ms)
    }
}

/// Playback controller timing and step settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Progress checkpoint interval in milliseconds
    pub checkpoint_interval_ms: u64,
    /// Delay before advancing to the next episode after the end, in milliseconds
    pub auto_advance_delay_ms: u64,
    /// How long a notification stays visible, in milliseconds
    pub notification_duration_ms: u64,
    /// Idle time before controls hide while playing, in milliseconds
    pub controls_hide_delay_ms: u64,
    /// Skip countdown tick in milliseconds
    pub skip_countdown_tick_ms: u64,
    /// Source reloads allowed for network-class engine errors
    pub max_network_recoveries: u32,
    /// Engine recoveries allowed for decode-class engine errors
    pub max_media_recoveries: u32,
    /// Seek step in seconds
    pub seek_step: f64,
    /// Seek step with shift held, in seconds
    pub seek_step_large: f64,
    /// Volume step (0.0-1.0)
    pub volume_step: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval_ms: 5_000,
            auto_advance_delay_ms: 1_500,
            notification_duration_ms: 2_500,
            controls_hide_delay_ms: 3_000,
            skip_countdown_tick_ms: 1_000,
            max_network_recoveries: 3,
            max_media_recoveries: 2,
            seek_step: 5.0,
            seek_step_large: 30.0,
            volume_step: 0.1,
        }
    }
}

impl PlaybackConfig {
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn auto_advance_delay(&self) -> Duration {
        Duration::from_millis(self.auto_advance_delay_ms)
    }

    pub fn notification_duration(&self) -> Duration {
        Duration::from_millis(self.notification_duration_ms)
    }

    pub fn controls_hide_delay(&self) -> Duration {
        Duration::from_millis(self.controls_hide_delay_ms)
    }

    pub fn skip_countdown_tick(&self) -> Duration {
        Duration::from_millis(self.skip_countdown_tick_ms)
    }
}

impl Config {
    /// Read a JSON config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Defaults, then optional file, then environment, then validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup(ENV_ENDPOINTS).filter(|v| !v.trim().is_empty()) {
            self.upstream.endpoints = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(Url::parse)
                .collect::<std::result::Result<_, _>>()?;
        }
        if let Some(raw) = lookup(ENV_ANISKIP_URL).filter(|v| !v.trim().is_empty()) {
            self.upstream.aniskip_url = Url::parse(raw.trim())?;
        }
        if let Some(raw) = lookup(ENV_DATA_DIR).filter(|v| !v.trim().is_empty()) {
            self.data_dir = Some(PathBuf::from(raw));
        }
        Ok(())
    }

    /// Reject configurations the resolver or controller cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.upstream.endpoints.is_empty() {
            return Err(Error::InvalidConfig("at least one endpoint is required".into()));
        }
        if self.upstream.providers.is_empty() {
            return Err(Error::InvalidConfig("at least one provider is required".into()));
        }
        if self.upstream.probe_timeout_ms == 0 || self.upstream.request_timeout_ms == 0 {
            return Err(Error::InvalidConfig("timeouts must be non-zero".into()));
        }
        let timers = [
            ("checkpoint_interval_ms", self.playback.checkpoint_interval_ms),
            ("auto_advance_delay_ms", self.playback.auto_advance_delay_ms),
            ("notification_duration_ms", self.playback.notification_duration_ms),
            ("controls_hide_delay_ms", self.playback.controls_hide_delay_ms),
            ("skip_countdown_tick_ms", self.playback.skip_countdown_tick_ms),
        ];
        if let Some((name, _)) = timers.iter().find(|(_, ms)| *ms == 0) {
            return Err(Error::InvalidConfig(format!("{} must be non-zero", name)));
        }
        Ok(())
    }

    /// Directory for the durable progress record
    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|base| base.join("anistream"))
                .ok_or_else(|| Error::InvalidConfig("unable to resolve data directory".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.upstream.endpoints.len(), 3);
        assert_eq!(config.upstream.providers, vec![Provider::Zoro, Provider::Gogoanime]);
        assert_eq!(config.upstream.endpoint_ttl(), Duration::from_secs(300));
        assert_eq!(config.playback.checkpoint_interval(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(|key| match key {
                ENV_ENDPOINTS => Some("http://a.test, http://b.test".to_string()),
                ENV_DATA_DIR => Some("/tmp/anistream-test".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.upstream.endpoints.len(), 2);
        assert_eq!(config.upstream.endpoints[1].as_str(), "http://b.test/");
        assert_eq!(config.resolved_data_dir().unwrap(), PathBuf::from("/tmp/anistream-test"));
    }

    #[test]
    fn test_invalid_env_endpoint_is_rejected() {
        let mut config = Config::default();
        let result = config.apply_env(|key| (key == ENV_ENDPOINTS).then(|| "not a url".to_string()));
        assert!(matches!(result, Err(Error::Url(_))));
    }

    #[test]
    fn test_validate_rejects_empty_endpoints() {
        let mut config = Config::default();
        config.upstream.endpoints.clear();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_zero_timer() {
        let config: Config =
            serde_json::from_str(r#"{"playback": {"skip_countdown_tick_ms": 0}}"#).unwrap();
        match config.validate() {
            Err(Error::InvalidConfig(message)) => assert!(message.contains("skip_countdown_tick_ms")),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"upstream": {"probe_timeout_ms": 1500}}"#).unwrap();
        assert_eq!(config.upstream.probe_timeout(), Duration::from_millis(1500));
        assert_eq!(config.upstream.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.playback.seek_step, 5.0);
    }
}
