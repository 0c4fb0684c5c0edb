//! Error types for the Colloquy session core
//!
//! Errors from the collaborators (backend, capture, synthesis, playback) are
//! expressed here. The controller folds completion errors into the transcript
//! instead of returning them.

use thiserror::Error;

/// Colloquy errors
#[derive(Error, Debug, Clone)]
pub enum ColloquyError {
    /// Transport failure talking to the backend (connect, timeout, body read)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Backend answered with a non-success status
    #[error("Backend error ({status}): {detail}")]
    BackendError { status: u16, detail: String },

    /// Backend rejected the credentials
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Backend answered with a body we could not interpret
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Speech capture is unsupported or permission was denied
    #[error("Speech capture unavailable: {0}")]
    CaptureUnavailable(String),

    /// Speech capture failed while running
    #[error("Speech capture error: {0}")]
    CaptureError(String),

    /// Text-to-speech failed
    #[error("Speech synthesis error: {0}")]
    SynthesisError(String),

    /// Audio playback failed
    #[error("Playback error: {0}")]
    PlaybackError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<reqwest::Error> for ColloquyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ColloquyError::InvalidResponse(e.to_string())
        } else if e.is_timeout() {
            ColloquyError::NetworkError(format!("request timed out: {}", e))
        } else {
            ColloquyError::NetworkError(e.to_string())
        }
    }
}

impl From<toml::de::Error> for ColloquyError {
    fn from(e: toml::de::Error) -> Self {
        ColloquyError::ConfigError(e.to_string())
    }
}

impl ColloquyError {
    /// Check if this error is recoverable
    ///
    /// Recoverable errors are worth retrying as-is; the others need the user to
    /// change something first (credentials, permissions, settings).
    pub fn is_recoverable(&self) -> bool {
        match self {
            ColloquyError::NetworkError(_) => true,
            // 5xx and 429 are transient, other client errors are not
            ColloquyError::BackendError { status, .. } => *status >= 500 || *status == 429,
            ColloquyError::Unauthorized(_) => false,
            ColloquyError::InvalidResponse(_) => true,
            ColloquyError::CaptureUnavailable(_) => false,
            ColloquyError::CaptureError(_) => true,
            ColloquyError::SynthesisError(_) => true,
            ColloquyError::PlaybackError(_) => true,
            ColloquyError::ConfigError(_) => false,
        }
    }

    /// Get a user-friendly description of the error
    pub fn user_message(&self) -> String {
        match self {
            ColloquyError::NetworkError(_) => {
                "Could not reach the assistant. Please check your connection.".to_string()
            }
            ColloquyError::BackendError { detail, .. } => detail.clone(),
            ColloquyError::Unauthorized(_) => {
                "Your session has expired. Please log in again.".to_string()
            }
            ColloquyError::InvalidResponse(_) => {
                "The assistant sent an unexpected response. Please try again.".to_string()
            }
            ColloquyError::CaptureUnavailable(_) => {
                "Speech recognition is not available. Check microphone permissions.".to_string()
            }
            ColloquyError::CaptureError(_) => {
                "Speech recognition failed. Please try again.".to_string()
            }
            ColloquyError::SynthesisError(_) => {
                "Text-to-speech failed. Response will be shown as text.".to_string()
            }
            ColloquyError::PlaybackError(_) => {
                "Audio playback failed. Response will be shown as text.".to_string()
            }
            ColloquyError::ConfigError(_) => {
                "Configuration error. Please check settings.".to_string()
            }
        }
    }
}

/// Result type alias for Colloquy operations
pub type Result<T> = std::result::Result<T, ColloquyError>;
