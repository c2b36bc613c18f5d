//! Error types for Anistream Core

use thiserror::Error;

/// Result type alias for streaming operations
pub type Result<T> = std::result::Result<T, Error>;

/// Streaming error types
#[derive(Error, Debug)]
pub enum Error {
    // Endpoint errors
    #[error("Endpoint unreachable: {address} ({reason})")]
    EndpointUnreachable { address: String, reason: String },

    #[error("All endpoints unreachable: {}", .attempts.join(", "))]
    AllEndpointsUnreachable { attempts: Vec<String> },

    // Provider errors
    #[error("Episode {episode_id} not found on provider {provider}")]
    ProviderNotFound { provider: String, episode_id: String },

    #[error("Provider {provider} failed: {message}")]
    ProviderError { provider: String, message: String },

    #[error("Server {server} failed: {message}")]
    ServerFetchFailed { server: String, message: String },

    #[error("No playable source found: {}", .errors.join("; "))]
    SourceUnavailable { errors: Vec<String> },

    #[error("Invalid upstream response: {0}")]
    InvalidResponse(String),

    // Engine errors
    #[error("Media engine network error: {0}")]
    EngineNetwork(String),

    #[error("Media engine decode error: {0}")]
    EngineMedia(String),

    #[error("Media engine fatal error: {0}")]
    EngineFatal(String),

    #[error("Media sink already has engine {attached} attached")]
    SinkBusy { attached: String },

    // Playback errors
    #[error("Invalid playback state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    // Network errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timed out: {url}")]
    Timeout { url: String },

    #[error("Request superseded by a newer one")]
    Cancelled,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a provider error
    pub fn provider(provider: impl ToString, message: impl Into<String>) -> Self {
        Error::ProviderError {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// Returns true if this error is transient and worth retrying elsewhere
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::EndpointUnreachable { .. }
                | Error::ProviderError { .. }
                | Error::ServerFetchFailed { .. }
                | Error::EngineNetwork(_)
                | Error::EngineMedia(_)
                | Error::Network(_)
                | Error::Timeout { .. }
        )
    }

    /// Returns the error code for logs and CLI output
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::EndpointUnreachable { .. } => "ENDPOINT_UNREACHABLE",
            Error::AllEndpointsUnreachable { .. } => "ALL_ENDPOINTS_UNREACHABLE",
            Error::ProviderNotFound { .. } => "PROVIDER_NOT_FOUND",
            Error::ProviderError { .. } => "PROVIDER_ERROR",
            Error::ServerFetchFailed { .. } => "SERVER_FETCH_FAILED",
            Error::SourceUnavailable { .. } => "SOURCE_UNAVAILABLE",
            Error::InvalidResponse(_) => "INVALID_RESPONSE",
            Error::EngineNetwork(_) => "ENGINE_NETWORK",
            Error::EngineMedia(_) => "ENGINE_MEDIA",
            Error::EngineFatal(_) => "ENGINE_FATAL",
            Error::SinkBusy { .. } => "SINK_BUSY",
            Error::InvalidStateTransition { .. } => "INVALID_STATE",
            Error::Network(_) => "NETWORK",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Cancelled => "CANCELLED",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Url(_) => "INVALID_URL",
            Error::Storage(_) => "STORAGE",
            Error::Json(_) => "JSON",
            Error::Io(_) => "IO",
        }
    }

    /// Viewer-facing message. Always names a remediation instead of a raw diagnostic.
    pub fn user_message(&self) -> String {
        match self {
            Error::AllEndpointsUnreachable { .. } => {
                "Streaming servers are unreachable. Check your connection and try again.".to_string()
            }
            Error::ProviderNotFound { .. } | Error::ProviderError { .. } => {
                "This episode is unavailable on the selected provider. Try another provider.".to_string()
            }
            Error::SourceUnavailable { .. } | Error::ServerFetchFailed { .. } => {
                "Failed to load the episode. Try another server or provider.".to_string()
            }
            Error::EngineNetwork(_) | Error::EngineMedia(_) | Error::EngineFatal(_) => {
                "Failed to load video. Try another server.".to_string()
            }
            _ => "Something went wrong. Try another server.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_unavailable_lists_every_error() {
        let err = Error::SourceUnavailable {
            errors: vec!["[zoro] HTTP 500".to_string(), "[gogoanime] not found".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("[zoro] HTTP 500"));
        assert!(text.contains("[gogoanime] not found"));
        assert_eq!(err.error_code(), "SOURCE_UNAVAILABLE");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::Timeout { url: "x".into() }.is_recoverable());
        assert!(Error::EngineNetwork("reset".into()).is_recoverable());
        assert!(!Error::EngineFatal("bad".into()).is_recoverable());
        assert!(!Error::AllEndpointsUnreachable { attempts: vec![] }.is_recoverable());
    }

    #[test]
    fn test_user_message_suggests_remediation() {
        let err = Error::EngineFatal("manifest incompatible".into());
        assert!(err.user_message().contains("another server"));
        assert!(!err.user_message().contains("manifest incompatible"));
    }
}
