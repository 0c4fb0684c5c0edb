//! Session state for the conversation controller
//!
//! The controller is the only writer. Views read through snapshots or the
//! convenience accessors on [`SharedSessionState`] and never mutate directly.
//!
//! Three activity flags move independently:
//! - **Request**: idle → sending → idle, at most one completion in flight
//! - **Capture**: off → listening → off, continuous speech recognition
//! - **Playback**: silent → speaking → silent, synthesized reply audio

use crate::messages::{Message, Transcript};
use parking_lot::RwLock;
use std::sync::Arc;

/// Completion request state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RequestState {
    /// No request outstanding, submissions are accepted
    #[default]
    Idle,
    /// Waiting on the completion service
    Sending,
}

impl RequestState {
    /// Check if a completion is outstanding
    pub fn is_sending(&self) -> bool {
        matches!(self, RequestState::Sending)
    }

    /// Check if a submission would be accepted
    pub fn is_idle(&self) -> bool {
        matches!(self, RequestState::Idle)
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestState::Idle => write!(f, "Idle"),
            RequestState::Sending => write!(f, "Sending"),
        }
    }
}

/// Continuous speech capture state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CaptureState {
    #[default]
    Off,
    /// Capture is running; utterances are submitted as they arrive
    Listening,
}

impl CaptureState {
    /// Check if continuous capture is running
    pub fn is_listening(&self) -> bool {
        matches!(self, CaptureState::Listening)
    }
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureState::Off => write!(f, "Off"),
            CaptureState::Listening => write!(f, "Listening"),
        }
    }
}

/// Speech playback state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlaybackState {
    #[default]
    Silent,
    Speaking,
}

impl PlaybackState {
    /// Check if a reply is being spoken
    pub fn is_speaking(&self) -> bool {
        matches!(self, PlaybackState::Speaking)
    }
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackState::Silent => write!(f, "Silent"),
            PlaybackState::Speaking => write!(f, "Speaking"),
        }
    }
}

/// State of the active conversation
#[derive(Clone, Debug, Default)]
pub struct SessionState {
    pub transcript: Transcript,
    pub request: RequestState,
    pub capture: CaptureState,
    pub playback: PlaybackState,
    /// Backend model targeted by the next request
    pub selected_model: String,
    /// Standing preference for spoken replies
    pub voice_output_enabled: bool,
    /// Reset epoch; results tagged with an older value are discarded
    pub generation: u64,
    /// Bumped on every capture start/stop so a stale capture loop can tell
    pub capture_epoch: u64,
    /// Bumped on every playback so an older playback cannot clear a newer one
    pub playback_seq: u64,
    /// Last user-facing notice
    pub last_notice: Option<String>,
}

impl SessionState {
    pub fn new(selected_model: impl Into<String>) -> Self {
        Self {
            selected_model: selected_model.into(),
            ..Default::default()
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            transcript: self.transcript.to_vec(),
            request: self.request,
            capture: self.capture,
            playback: self.playback,
            selected_model: self.selected_model.clone(),
            voice_output_enabled: self.voice_output_enabled,
            generation: self.generation,
            last_notice: self.last_notice.clone(),
        }
    }

    /// Replies are spoken when the preference is on or continuous capture runs
    pub fn voice_output_applies(&self) -> bool {
        self.voice_output_enabled || self.capture.is_listening()
    }

    // === State transitions ===

    /// Append the user's message and mark the request outstanding
    pub fn begin_request(&mut self, message: Message) {
        self.transcript.push(message);
        self.request = RequestState::Sending;
    }

    /// Append the reply (or failure entry) and return to idle
    pub fn finish_request(&mut self, reply: Message) {
        self.transcript.push(reply);
        self.request = RequestState::Idle;
    }

    pub fn start_listening(&mut self) -> u64 {
        self.capture = CaptureState::Listening;
        self.capture_epoch += 1;
        self.last_notice = None;
        self.capture_epoch
    }

    pub fn stop_listening(&mut self) {
        self.capture = CaptureState::Off;
        self.capture_epoch += 1;
    }

    /// True while the capture loop started at `epoch` is still current
    pub fn is_listening_in(&self, epoch: u64) -> bool {
        self.capture.is_listening() && self.capture_epoch == epoch
    }

    pub fn start_speaking(&mut self) -> u64 {
        self.playback = PlaybackState::Speaking;
        self.playback_seq += 1;
        self.playback_seq
    }

    /// Finish playback `seq`; later playbacks are left alone
    pub fn finish_speaking(&mut self, seq: u64) -> bool {
        if self.playback_seq == seq && self.playback.is_speaking() {
            self.playback = PlaybackState::Silent;
            true
        } else {
            false
        }
    }

    /// Clear the conversation and start a new generation
    pub fn reset(&mut self) {
        self.transcript.clear();
        self.request = RequestState::Idle;
        self.capture = CaptureState::Off;
        self.capture_epoch += 1;
        self.playback = PlaybackState::Silent;
        self.playback_seq += 1;
        self.generation += 1;
        self.last_notice = None;
    }
}

/// Immutable snapshot of session state
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub transcript: Vec<Message>,
    pub request: RequestState,
    pub capture: CaptureState,
    pub playback: PlaybackState,
    pub selected_model: String,
    pub voice_output_enabled: bool,
    pub generation: u64,
    pub last_notice: Option<String>,
}

/// Thread-safe shared session state
#[derive(Clone, Default)]
pub struct SharedSessionState {
    inner: Arc<RwLock<SessionState>>,
}

impl SharedSessionState {
    pub fn new(state: SessionState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, SessionState> {
        self.inner.read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, SessionState> {
        self.inner.write()
    }

    /// Get a snapshot of current state (no lock held after return)
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.read().snapshot()
    }

    pub fn is_sending(&self) -> bool {
        self.inner.read().request.is_sending()
    }

    pub fn is_listening(&self) -> bool {
        self.inner.read().capture.is_listening()
    }

    pub fn is_speaking(&self) -> bool {
        self.inner.read().playback.is_speaking()
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    pub fn transcript(&self) -> Vec<Message> {
        self.inner.read().transcript.to_vec()
    }

    pub fn selected_model(&self) -> String {
        self.inner.read().selected_model.clone()
    }
}

/// Notifications published to the view
///
/// State should be queried from the snapshot; events only say that something
/// changed.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// Flags or settings changed (trigger repaint)
    StateChanged,
    /// A message was appended to the transcript
    MessageAppended(Message),
    /// A user-facing notice that is not part of the transcript
    Notice(String),
}
