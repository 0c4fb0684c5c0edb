//! In-process speech capture source
//!
//! `ChannelCapture` turns events pushed through a [`CaptureFeeder`] into one
//! [`CaptureStream`] per capture session. An external recognizer (or a test)
//! owns the feeder; the controller owns the capture.

use super::{CaptureEvent, CaptureStream, SpeechCapture};
use crate::{ColloquyError, Result};
use async_stream::stream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::debug;

/// Events are tagged with the session that was running when they were fed
type TaggedEvent = (u64, CaptureEvent);

struct CaptureShared {
    rx: Mutex<mpsc::UnboundedReceiver<TaggedEvent>>,
    active: AtomicBool,
    sessions: AtomicU64,
    stopped: Notify,
}

/// Capture source backed by an unbounded channel
pub struct ChannelCapture {
    shared: Arc<CaptureShared>,
    locale: String,
    unavailable: Option<String>,
}

/// Sending half handed to the recognizer
#[derive(Clone)]
pub struct CaptureFeeder {
    tx: mpsc::UnboundedSender<TaggedEvent>,
    shared: Arc<CaptureShared>,
}

impl ChannelCapture {
    /// Create a capture source for `locale` and the feeder that drives it
    pub fn new(locale: impl Into<String>) -> (Self, CaptureFeeder) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(CaptureShared {
            rx: Mutex::new(rx),
            active: AtomicBool::new(false),
            sessions: AtomicU64::new(0),
            stopped: Notify::new(),
        });

        let capture = Self {
            shared: Arc::clone(&shared),
            locale: locale.into(),
            unavailable: None,
        };
        let feeder = CaptureFeeder { tx, shared };
        (capture, feeder)
    }

    /// A capture source that refuses to start, e.g. when permission is denied
    pub fn unavailable(reason: impl Into<String>) -> Self {
        let (mut capture, _feeder) = Self::new("");
        capture.unavailable = Some(reason.into());
        capture
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    /// Number of capture sessions opened so far
    pub fn sessions_started(&self) -> u64 {
        self.shared.sessions.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }
}

impl SpeechCapture for ChannelCapture {
    fn start(&self) -> Result<CaptureStream> {
        if let Some(reason) = &self.unavailable {
            return Err(ColloquyError::CaptureUnavailable(reason.clone()));
        }

        let session = self.shared.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.active.store(true, Ordering::SeqCst);
        debug!("Capture session {} started ({})", session, self.locale);

        let shared = Arc::clone(&self.shared);
        Ok(Box::pin(stream! {
            while shared.active.load(Ordering::SeqCst)
                && shared.sessions.load(Ordering::SeqCst) == session
            {
                let event = {
                    let mut rx = shared.rx.lock().await;
                    tokio::select! {
                        event = rx.recv() => event,
                        _ = shared.stopped.notified() => None,
                    }
                };

                match event {
                    Some((tag, event)) if tag != session => {
                        debug!("Dropping {:?} left over from capture session {}", event, tag);
                    }
                    Some((_, CaptureEvent::End)) | None => break,
                    Some((_, event)) => yield event,
                }
            }

            // A newer session may already be running
            if shared.sessions.load(Ordering::SeqCst) == session {
                shared.active.store(false, Ordering::SeqCst);
            }
            debug!("Capture session {} ended", session);
            yield CaptureEvent::End;
        }))
    }

    fn stop(&self) {
        self.shared.active.store(false, Ordering::SeqCst);
        self.shared.stopped.notify_waiters();
    }
}

impl CaptureFeeder {
    /// Deliver a recognized utterance; dropped when no session is running
    pub fn utterance(&self, text: impl Into<String>) -> bool {
        self.send(CaptureEvent::Transcript(text.into()))
    }

    /// Report a recognizer error
    pub fn error(&self, message: impl Into<String>) -> bool {
        self.send(CaptureEvent::Error(message.into()))
    }

    /// End the current capture session
    pub fn end(&self) -> bool {
        self.send(CaptureEvent::End)
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    fn send(&self, event: CaptureEvent) -> bool {
        if !self.is_active() {
            debug!("Capture inactive, dropping {:?}", event);
            return false;
        }
        let session = self.shared.sessions.load(Ordering::SeqCst);
        self.tx.send((session, event)).is_ok()
    }
}
