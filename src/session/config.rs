//! Configuration for the conversation controller

use serde::Deserialize;
use std::time::Duration;

/// Controller settings
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Model selected when a session starts
    pub default_model: String,

    /// Delay before capture is restarted after an unexpected end
    pub restart_delay_ms: u64,

    /// Language passed to speech synthesis
    pub speech_language: String,

    /// Locale for the speech recognizer
    pub capture_locale: String,

    /// Speak replies even outside continuous voice mode
    pub voice_output_enabled: bool,

    /// Capacity of the view notification channel
    pub event_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_model: "deepseek-coder:6.7b".to_string(),
            restart_delay_ms: 300,
            speech_language: "es".to_string(),
            capture_locale: "es-ES".to_string(),
            voice_output_enabled: false,
            event_buffer_size: 100,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_restart_delay_ms(mut self, delay: u64) -> Self {
        self.restart_delay_ms = delay;
        self
    }

    pub fn with_speech_language(mut self, language: impl Into<String>) -> Self {
        self.speech_language = language.into();
        self
    }

    pub fn with_voice_output(mut self, enabled: bool) -> Self {
        self.voice_output_enabled = enabled;
        self
    }

    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}
