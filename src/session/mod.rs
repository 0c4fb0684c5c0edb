//! Conversation session layer
//!
//! Provides the controller that owns the active conversation and the
//! configuration it runs with.

pub mod config;
pub mod controller;

pub use config::SessionConfig;
pub use controller::{ControllerBuilder, ConversationController};
