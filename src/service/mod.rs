//! Collaborators consumed by the conversation controller
//!
//! The controller only sees these traits. Concrete implementations:
//! - [`http::HttpBackend`]: completion, synthesis and persistence over HTTP
//! - [`capture::ChannelCapture`]: capture source fed by an external recognizer
//! - [`player::NullPlayer`]: playback sink that finishes immediately
//! - `player::RodioPlayer`: default output device (feature `audio-io`)

pub mod capture;
pub mod http;
pub mod player;

use crate::messages::Message;
use crate::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;

pub use capture::{CaptureFeeder, ChannelCapture};
pub use http::{BackendConfig, HttpBackend};
pub use player::NullPlayer;
#[cfg(feature = "audio-io")]
pub use player::RodioPlayer;

/// Produces the assistant reply for a transcript
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Request one reply from `model` using the whole transcript as context
    async fn complete(&self, model: &str, transcript: &[Message]) -> Result<Message>;
}

/// Events produced by one capture session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureEvent {
    /// A recognized utterance
    Transcript(String),
    /// Non-fatal recognizer error; the session may still end afterwards
    Error(String),
    /// The capture session ended (silence timeout, device hiccup, stop)
    End,
}

/// Stream of events for one capture session, terminated by [`CaptureEvent::End`]
pub type CaptureStream = BoxStream<'static, CaptureEvent>;

/// Continuous speech recognition source
///
/// Each call to `start` opens a new capture session. Calling it again after the
/// previous stream ended restarts capture.
pub trait SpeechCapture: Send + Sync {
    /// Begin a capture session
    ///
    /// Fails with [`crate::ColloquyError::CaptureUnavailable`] when recognition
    /// is unsupported or permission is denied.
    fn start(&self) -> Result<CaptureStream>;

    /// Stop the current capture session immediately
    fn stop(&self);
}

/// Encoded audio returned by the synthesis service
#[derive(Clone, Debug)]
pub struct AudioClip {
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl AudioClip {
    pub fn new(data: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            data,
            mime_type: mime_type.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Text-to-speech sink
#[async_trait]
pub trait SpeechSynthesis: Send + Sync {
    async fn synthesize(&self, text: &str, language: &str) -> Result<AudioClip>;
}

/// Plays synthesized audio
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    /// Play `clip`, resolving once playback has completed
    async fn play(&self, clip: AudioClip) -> Result<()>;

    /// Cut off whatever is currently playing
    fn stop(&self) {}
}

/// Entry in the conversation history list
#[derive(Clone, Debug, Deserialize)]
pub struct ConversationSummary {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message_count: Option<usize>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Stored conversation history
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>>;

    async fn load_conversation(&self, id: &str) -> Result<Vec<Message>>;

    async fn delete_conversation(&self, id: &str) -> Result<()>;
}
