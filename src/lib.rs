//! Colloquy - conversation session core for a voice-enabled chat client
//!
//! The [`session::ConversationController`] owns the transcript of the active
//! conversation and coordinates typed submissions, continuous speech capture,
//! backend completions and spoken replies.

pub mod config;
pub mod error;
pub mod messages;
pub mod service;
pub mod session;
pub mod state;

pub use config::AppConfig;
pub use error::{ColloquyError, Result};
pub use messages::{Attachment, Message, Role, Transcript};
pub use session::{ControllerBuilder, ConversationController, SessionConfig};
pub use state::{CaptureState, PlaybackState, RequestState, SessionEvent, SessionSnapshot};
