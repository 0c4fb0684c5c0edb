//! Conversation session controller
//!
//! Owns the transcript and the three activity flags, and coordinates:
//! - user submissions (typed or recognized speech)
//! - completion replies from the backend
//! - the continuous capture loop, restarting capture after unexpected ends
//! - speech playback of replies
//!
//! `submit` returns as soon as the user message is in the transcript; the
//! completion runs on a spawned task. Every outstanding request carries the
//! generation it was issued in, and replies from an older generation are
//! dropped so a reset conversation never receives a stale answer.

use crate::messages::{Attachment, Message};
use crate::service::{
    AudioPlayer, CaptureEvent, CaptureStream, CompletionService, ConversationStore, NullPlayer,
    SpeechCapture, SpeechSynthesis,
};
use crate::session::config::SessionConfig;
use crate::state::{SessionEvent, SessionSnapshot, SessionState, SharedSessionState};
use crate::{ColloquyError, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

struct Inner {
    config: SessionConfig,
    state: SharedSessionState,
    completion: Arc<dyn CompletionService>,
    synthesis: Option<Arc<dyn SpeechSynthesis>>,
    player: Arc<dyn AudioPlayer>,
    capture: Option<Arc<dyn SpeechCapture>>,
    event_tx: Sender<SessionEvent>,
    event_rx: Receiver<SessionEvent>,
    capture_task: Mutex<Option<JoinHandle<()>>>,
}

/// Controller for one active conversation
///
/// Cheap to clone; clones share the same session. All operations that start
/// asynchronous work must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct ConversationController {
    inner: Arc<Inner>,
}

impl ConversationController {
    pub fn builder(completion: Arc<dyn CompletionService>) -> ControllerBuilder {
        ControllerBuilder::new(completion)
    }

    /// Submit a user message
    ///
    /// Ignored when both the text and attachment are empty, or while another
    /// request is outstanding. Returns whether the submission was accepted.
    /// Completion failures end up in the transcript, never here.
    pub fn submit(&self, content: &str, attachment: Option<&Attachment>) -> bool {
        self.inner.submit(content, attachment)
    }

    /// Start continuous voice mode
    ///
    /// No-op when already listening. When capture is unavailable a notice is
    /// published and the mode is not entered.
    pub fn start_continuous_capture(&self) -> Result<()> {
        if self.inner.state.is_listening() {
            debug!("Continuous capture already running");
            return Ok(());
        }

        let capture = match &self.inner.capture {
            Some(capture) => Arc::clone(capture),
            None => {
                let err = ColloquyError::CaptureUnavailable(
                    "no speech capture source configured".into(),
                );
                self.inner.notice(err.user_message());
                return Err(err);
            }
        };

        let stream = match capture.start() {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to start speech capture: {}", e);
                self.inner.notice(e.user_message());
                return Err(e);
            }
        };

        let epoch = self.inner.state.write().start_listening();
        self.inner.publish(SessionEvent::StateChanged);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.capture_loop(epoch, stream).await });
        if let Some(previous) = self.inner.capture_task.lock().replace(task) {
            previous.abort();
        }

        info!("Continuous capture started");
        Ok(())
    }

    /// Leave continuous voice mode
    ///
    /// Stops the capture source at once and cancels any pending restart. An
    /// in-flight request is left alone.
    pub fn stop_continuous_capture(&self) {
        {
            let mut state = self.inner.state.write();
            if !state.capture.is_listening() {
                return;
            }
            state.stop_listening();
        }
        self.inner.halt_capture();
        self.inner.publish(SessionEvent::StateChanged);
        info!("Continuous capture stopped");
    }

    /// Start a new conversation
    ///
    /// Clears the transcript and all activity flags. A reply still in flight
    /// is discarded when it arrives.
    pub fn reset(&self) {
        self.inner.reset_with(Vec::new());
    }

    /// Replace the working transcript with a stored conversation
    pub fn load_conversation(&self, messages: Vec<Message>) {
        self.inner.reset_with(messages);
    }

    /// Fetch conversation `id` from `store` and make it the working transcript
    pub async fn open_conversation(&self, store: &dyn ConversationStore, id: &str) -> Result<usize> {
        let messages = store.load_conversation(id).await?;
        let count = messages.len();
        self.load_conversation(messages);
        info!("Opened conversation {} ({} messages)", id, count);
        Ok(count)
    }

    /// Choose the model targeted by the next request
    pub fn set_selected_model(&self, model: impl Into<String>) {
        let model = model.into();
        debug!("Selected model: {}", model);
        self.inner.state.write().selected_model = model;
        self.inner.publish(SessionEvent::StateChanged);
    }

    pub fn selected_model(&self) -> String {
        self.inner.state.selected_model()
    }

    pub fn set_voice_output_enabled(&self, enabled: bool) {
        self.inner.state.write().voice_output_enabled = enabled;
        self.inner.publish(SessionEvent::StateChanged);
    }

    /// Flip the spoken-replies preference, returning the new value
    pub fn toggle_voice_output(&self) -> bool {
        let enabled = {
            let mut state = self.inner.state.write();
            state.voice_output_enabled = !state.voice_output_enabled;
            state.voice_output_enabled
        };
        self.inner.publish(SessionEvent::StateChanged);
        enabled
    }

    /// Stop capture and playback before dropping the controller
    pub fn shutdown(&self) {
        self.stop_continuous_capture();
        self.inner.halt_capture();
        self.inner.player.stop();
        info!("Conversation controller shut down");
    }

    // === Queries ===

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.snapshot()
    }

    pub fn transcript(&self) -> Vec<Message> {
        self.inner.state.transcript()
    }

    pub fn is_sending(&self) -> bool {
        self.inner.state.is_sending()
    }

    pub fn is_listening(&self) -> bool {
        self.inner.state.is_listening()
    }

    pub fn is_speaking(&self) -> bool {
        self.inner.state.is_speaking()
    }

    pub fn generation(&self) -> u64 {
        self.inner.state.generation()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Receiver for change notifications
    ///
    /// Receivers share one queue; give each view its own controller clone but
    /// only one event consumer.
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.inner.event_rx.clone()
    }
}

impl Inner {
    fn submit(self: &Arc<Self>, content: &str, attachment: Option<&Attachment>) -> bool {
        if content.trim().is_empty() && attachment.is_none() {
            debug!("Ignoring empty submission");
            return false;
        }

        // Only the emptiness check ignores whitespace
        let body = match attachment {
            Some(attachment) => attachment.annotate(content),
            None => content.to_string(),
        };
        let message = Message::user(body);

        let (context, model, generation) = {
            let mut state = self.state.write();
            if state.request.is_sending() {
                debug!("Request outstanding, ignoring submission");
                return false;
            }
            state.begin_request(message.clone());
            (
                state.transcript.to_vec(),
                state.selected_model.clone(),
                state.generation,
            )
        };

        self.publish(SessionEvent::MessageAppended(message));
        self.publish(SessionEvent::StateChanged);

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_completion(generation, model, context).await });
        true
    }

    async fn run_completion(self: Arc<Self>, generation: u64, model: String, context: Vec<Message>) {
        let outcome = self.completion.complete(&model, &context).await;

        let (reply, succeeded) = match outcome {
            Ok(reply) if reply.is_assistant() => (reply, true),
            Ok(reply) => (Message::assistant(reply.content), true),
            Err(e) => {
                warn!("Completion failed: {}", e);
                (Message::failure(failure_description(&e)), false)
            }
        };

        let playback = {
            let mut state = self.state.write();
            if state.generation != generation {
                debug!(
                    "Discarding reply from generation {} (current {})",
                    generation, state.generation
                );
                return;
            }
            state.finish_request(reply.clone());
            let speak = succeeded && self.synthesis.is_some() && state.voice_output_applies();
            speak.then(|| state.start_speaking())
        };

        self.publish(SessionEvent::MessageAppended(reply.clone()));
        self.publish(SessionEvent::StateChanged);

        if let Some(seq) = playback {
            self.speak(seq, &reply.content).await;
        }
    }

    async fn speak(&self, seq: u64, text: &str) {
        if let Err(e) = self.play_reply(seq, text).await {
            warn!("Voice output failed: {}", e);
        }

        if self.state.write().finish_speaking(seq) {
            self.publish(SessionEvent::StateChanged);
        }
    }

    async fn play_reply(&self, seq: u64, text: &str) -> Result<()> {
        let Some(synthesis) = &self.synthesis else {
            return Ok(());
        };

        let clip = synthesis
            .synthesize(text, &self.config.speech_language)
            .await?;

        // Reset or a newer reply while synthesizing
        if self.state.read().playback_seq != seq {
            debug!("Playback {} superseded, not playing", seq);
            return Ok(());
        }

        debug!("Playing {} bytes of synthesized speech", clip.data.len());
        self.player.play(clip).await
    }

    /// Consume capture sessions until `epoch` is no longer current
    async fn capture_loop(self: Arc<Self>, epoch: u64, mut stream: CaptureStream) {
        loop {
            while let Some(event) = stream.next().await {
                match event {
                    CaptureEvent::Transcript(text) => {
                        if !self.state.read().is_listening_in(epoch) {
                            return;
                        }
                        let text = text.trim();
                        if text.is_empty() {
                            continue;
                        }
                        debug!("Recognized utterance: {}", text);
                        if !self.submit(text, None) {
                            info!("Reply pending, utterance dropped: {}", text);
                            self.notice(format!(
                                "Still waiting for the previous reply; \"{}\" was not sent.",
                                text
                            ));
                        }
                    }
                    CaptureEvent::Error(e) => {
                        let error = ColloquyError::CaptureError(e);
                        warn!("{}", error);
                        self.notice(error.user_message());
                    }
                    CaptureEvent::End => break,
                }
            }

            if !self.state.read().is_listening_in(epoch) {
                return;
            }

            let delay = self.config.restart_delay();
            debug!("Capture ended while listening, restarting in {:?}", delay);
            tokio::time::sleep(delay).await;

            if !self.state.read().is_listening_in(epoch) {
                return;
            }

            let Some(capture) = &self.capture else {
                return;
            };
            match capture.start() {
                Ok(next) => stream = next,
                Err(e) => {
                    warn!("Failed to restart speech capture: {}", e);
                    {
                        let mut state = self.state.write();
                        if state.is_listening_in(epoch) {
                            state.stop_listening();
                        }
                    }
                    self.notice(e.user_message());
                    self.publish(SessionEvent::StateChanged);
                    return;
                }
            }
        }
    }

    /// Stop the capture source and any pending restart
    fn halt_capture(&self) {
        if let Some(capture) = &self.capture {
            capture.stop();
        }
        if let Some(task) = self.capture_task.lock().take() {
            task.abort();
        }
    }

    fn reset_with(&self, messages: Vec<Message>) {
        let (was_listening, generation) = {
            let mut state = self.state.write();
            let was_listening = state.capture.is_listening();
            state.reset();
            state.transcript.replace(messages);
            (was_listening, state.generation)
        };

        if was_listening {
            self.halt_capture();
        }
        self.player.stop();
        self.publish(SessionEvent::StateChanged);
        info!("Session reset (generation {})", generation);
    }

    fn notice(&self, message: String) {
        self.state.write().last_notice = Some(message.clone());
        self.publish(SessionEvent::Notice(message));
    }

    fn publish(&self, event: SessionEvent) {
        if let Err(TrySendError::Full(event)) = self.event_tx.try_send(event) {
            trace!("Event buffer full, dropping {:?}", event);
        }
    }
}

/// Text recorded in the transcript for a failed completion
fn failure_description(error: &ColloquyError) -> String {
    match error {
        ColloquyError::BackendError { detail, .. } if !detail.is_empty() => detail.clone(),
        other => other.to_string(),
    }
}

/// Builder for [`ConversationController`]
pub struct ControllerBuilder {
    config: SessionConfig,
    completion: Arc<dyn CompletionService>,
    synthesis: Option<Arc<dyn SpeechSynthesis>>,
    player: Arc<dyn AudioPlayer>,
    capture: Option<Arc<dyn SpeechCapture>>,
}

impl ControllerBuilder {
    pub fn new(completion: Arc<dyn CompletionService>) -> Self {
        Self {
            config: SessionConfig::default(),
            completion,
            synthesis: None,
            player: Arc::new(NullPlayer),
            capture: None,
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_synthesis(mut self, synthesis: Arc<dyn SpeechSynthesis>) -> Self {
        self.synthesis = Some(synthesis);
        self
    }

    pub fn with_player(mut self, player: Arc<dyn AudioPlayer>) -> Self {
        self.player = player;
        self
    }

    pub fn with_capture(mut self, capture: Arc<dyn SpeechCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn build(self) -> ConversationController {
        let mut state = SessionState::new(self.config.default_model.clone());
        state.voice_output_enabled = self.config.voice_output_enabled;

        let (event_tx, event_rx) = bounded(self.config.event_buffer_size.max(1));

        ConversationController {
            inner: Arc::new(Inner {
                config: self.config,
                state: SharedSessionState::new(state),
                completion: self.completion,
                synthesis: self.synthesis,
                player: self.player,
                capture: self.capture,
                event_tx,
                event_rx,
                capture_task: Mutex::new(None),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl CompletionService for Echo {
        async fn complete(&self, _model: &str, transcript: &[Message]) -> Result<Message> {
            let last = transcript.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(Message::assistant(format!("echo: {}", last)))
        }
    }

    fn controller() -> ConversationController {
        ConversationController::builder(Arc::new(Echo)).build()
    }

    #[test]
    fn test_failure_description_uses_detail() {
        let err = ColloquyError::BackendError {
            status: 503,
            detail: "No Ollama server available".into(),
        };
        assert_eq!(failure_description(&err), "No Ollama server available");

        let err = ColloquyError::NetworkError("connection refused".into());
        assert_eq!(failure_description(&err), "Network error: connection refused");
    }

    #[tokio::test]
    async fn test_empty_submission_ignored() {
        let controller = controller();
        assert!(!controller.submit("   ", None));
        assert!(controller.transcript().is_empty());
        assert!(!controller.is_sending());
    }

    #[tokio::test]
    async fn test_attachment_only_submission() {
        let controller = controller();
        let photo = Attachment::new("cat.png", "image/png", vec![1, 2, 3]);
        assert!(controller.submit("", Some(&photo)));
        assert_eq!(controller.transcript()[0].content, "[Image: cat.png]");
    }

    #[tokio::test]
    async fn test_missing_capture_source_surfaces_notice() {
        let controller = controller();
        let events = controller.events();

        let err = controller.start_continuous_capture().unwrap_err();
        assert!(matches!(err, ColloquyError::CaptureUnavailable(_)));
        assert!(!controller.is_listening());
        assert!(controller.snapshot().last_notice.is_some());
        assert!(matches!(events.try_recv(), Ok(SessionEvent::Notice(_))));
    }

    #[tokio::test]
    async fn test_selected_model_and_voice_toggle() {
        let controller = controller();
        assert_eq!(controller.selected_model(), "deepseek-coder:6.7b");

        controller.set_selected_model("llama3:8b");
        assert_eq!(controller.selected_model(), "llama3:8b");

        assert!(controller.toggle_voice_output());
        assert!(controller.snapshot().voice_output_enabled);
        assert!(!controller.toggle_voice_output());
    }

    #[tokio::test]
    async fn test_full_event_buffer_does_not_block() {
        let controller = ConversationController::builder(Arc::new(Echo))
            .with_config(SessionConfig::default().with_event_buffer_size(1))
            .build();

        for _ in 0..5 {
            controller.set_voice_output_enabled(true);
        }
        assert_eq!(controller.events().len(), 1);
    }
}
