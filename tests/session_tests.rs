//! Session controller tests
//!
//! Completion, synthesis and playback are scripted so each test decides when
//! a reply arrives. The clock is paused so capture restart delays are exact.

use async_trait::async_trait;
use colloquy::service::{
    AudioClip, AudioPlayer, CaptureFeeder, CaptureStream, ChannelCapture, CompletionService,
    SpeechCapture, SpeechSynthesis,
};
use colloquy::{
    ColloquyError, ConversationController, Message, Result, Role, SessionConfig, SessionEvent,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

/// Completion service whose replies are delivered by the test
#[derive(Default)]
struct ScriptedCompletion {
    pending: Mutex<VecDeque<oneshot::Sender<Result<Message>>>>,
    requests: Mutex<Vec<(String, Vec<Message>)>>,
    calls: AtomicUsize,
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, model: &str, transcript: &[Message]) -> Result<Message> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .push((model.to_string(), transcript.to_vec()));

        let (tx, rx) = oneshot::channel();
        self.pending.lock().push_back(tx);
        rx.await
            .unwrap_or_else(|_| Err(ColloquyError::NetworkError("reply dropped".into())))
    }
}

impl ScriptedCompletion {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Resolve the oldest outstanding request
    async fn respond(&self, outcome: Result<Message>) {
        for _ in 0..100 {
            let next = self.pending.lock().pop_front();
            if let Some(tx) = next {
                let _ = tx.send(outcome);
                settle().await;
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("no completion request outstanding");
    }
}

#[derive(Default)]
struct RecordingSynthesis {
    requests: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl SpeechSynthesis for RecordingSynthesis {
    async fn synthesize(&self, text: &str, language: &str) -> Result<AudioClip> {
        self.requests
            .lock()
            .push((text.to_string(), language.to_string()));
        Ok(AudioClip::new(vec![0x49, 0x44, 0x33], "audio/mpeg"))
    }
}

/// Player that keeps "playing" until the test releases it
#[derive(Default)]
struct GatedPlayer {
    finished: Notify,
    played: AtomicUsize,
}

#[async_trait]
impl AudioPlayer for GatedPlayer {
    async fn play(&self, _clip: AudioClip) -> Result<()> {
        self.played.fetch_add(1, Ordering::SeqCst);
        self.finished.notified().await;
        Ok(())
    }
}

/// Capture source that opens one session and then refuses to restart
struct OneShotCapture {
    inner: ChannelCapture,
}

impl SpeechCapture for OneShotCapture {
    fn start(&self) -> Result<CaptureStream> {
        if self.inner.sessions_started() > 0 {
            return Err(ColloquyError::CaptureUnavailable("microphone unplugged".into()));
        }
        self.inner.start()
    }

    fn stop(&self) {
        self.inner.stop();
    }
}

struct Harness {
    controller: ConversationController,
    completion: Arc<ScriptedCompletion>,
    synthesis: Arc<RecordingSynthesis>,
    player: Arc<GatedPlayer>,
    capture: Arc<ChannelCapture>,
    feeder: CaptureFeeder,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    fn with_config(config: SessionConfig) -> Self {
        let completion = Arc::new(ScriptedCompletion::default());
        let synthesis = Arc::new(RecordingSynthesis::default());
        let player = Arc::new(GatedPlayer::default());
        let (capture, feeder) = ChannelCapture::new("es-ES");
        let capture = Arc::new(capture);

        let controller = ConversationController::builder(completion.clone())
            .with_config(config)
            .with_synthesis(synthesis.clone())
            .with_player(player.clone())
            .with_capture(capture.clone())
            .build();

        Self {
            controller,
            completion,
            synthesis,
            player,
            capture,
            feeder,
        }
    }

    fn contents(&self) -> Vec<(Role, String)> {
        self.controller
            .transcript()
            .into_iter()
            .map(|m| (m.role, m.content))
            .collect()
    }
}

/// Let spawned tasks run until they block
async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_submit_then_reply() {
    let h = Harness::new();

    assert!(h.controller.submit("Hello", None));
    assert_eq!(h.contents(), vec![(Role::User, "Hello".to_string())]);
    assert!(h.controller.is_sending());

    h.completion
        .respond(Ok(Message::assistant("Hi there")))
        .await;

    assert_eq!(
        h.contents(),
        vec![
            (Role::User, "Hello".to_string()),
            (Role::Assistant, "Hi there".to_string()),
        ]
    );
    assert!(!h.controller.is_sending());

    let requests = h.completion.requests.lock();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "deepseek-coder:6.7b");
    assert_eq!(requests[0].1.len(), 1);
    assert_eq!(requests[0].1[0].content, "Hello");
}

#[tokio::test(start_paused = true)]
async fn test_submission_keeps_whitespace() {
    let h = Harness::new();

    let code = "    fn main() {}\n";
    assert!(h.controller.submit(code, None));
    assert_eq!(h.contents(), vec![(Role::User, code.to_string())]);

    settle().await;
    assert_eq!(h.completion.requests.lock()[0].1[0].content, code);
}

#[tokio::test(start_paused = true)]
async fn test_failure_becomes_assistant_message() {
    let h = Harness::new();

    assert!(h.controller.submit("X", None));
    h.completion
        .respond(Err(ColloquyError::BackendError {
            status: 503,
            detail: "No Ollama server available".into(),
        }))
        .await;

    let transcript = h.controller.transcript();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[1].role, Role::Assistant);
    assert_eq!(transcript[1].content, "Error: No Ollama server available");
    assert!(!h.controller.is_sending());
}

#[tokio::test(start_paused = true)]
async fn test_network_failure_has_description() {
    let h = Harness::new();

    h.controller.submit("X", None);
    h.completion
        .respond(Err(ColloquyError::NetworkError("connection refused".into())))
        .await;

    let last = h.controller.transcript().pop().unwrap();
    assert!(last.is_assistant());
    assert!(last.content.starts_with("Error: "));
    assert!(last.content.len() > "Error: ".len());
}

#[tokio::test(start_paused = true)]
async fn test_submissions_while_sending_are_ignored() {
    let h = Harness::new();

    assert!(h.controller.submit("first", None));
    assert!(!h.controller.submit("second", None));
    assert!(!h.controller.submit("third", None));
    settle().await;

    assert_eq!(h.contents(), vec![(Role::User, "first".to_string())]);
    assert_eq!(h.completion.calls(), 1);

    h.completion.respond(Ok(Message::assistant("ok"))).await;
    assert!(h.controller.submit("fourth", None));
    settle().await;
    assert_eq!(h.completion.calls(), 2);

    let requests = h.completion.requests.lock();
    let context: Vec<_> = requests[1].1.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(context, vec!["first", "ok", "fourth"]);
}

#[tokio::test(start_paused = true)]
async fn test_reply_after_reset_is_discarded() {
    let h = Harness::new();

    h.controller.submit("old question", None);
    settle().await;
    h.controller.reset();

    assert!(h.controller.transcript().is_empty());
    assert!(!h.controller.is_sending());
    assert_eq!(h.controller.generation(), 1);

    h.completion
        .respond(Ok(Message::assistant("stale answer")))
        .await;
    assert!(h.controller.transcript().is_empty());
    assert!(!h.controller.is_sending());
}

#[tokio::test(start_paused = true)]
async fn test_stale_reply_does_not_touch_new_conversation() {
    let h = Harness::new();

    h.controller.submit("old question", None);
    settle().await;
    h.controller.reset();

    assert!(h.controller.submit("new question", None));
    settle().await;

    // The old request resolves first and must not complete the new one
    h.completion
        .respond(Ok(Message::assistant("stale answer")))
        .await;
    assert_eq!(h.contents(), vec![(Role::User, "new question".to_string())]);
    assert!(h.controller.is_sending());

    h.completion
        .respond(Ok(Message::assistant("fresh answer")))
        .await;
    assert_eq!(
        h.contents(),
        vec![
            (Role::User, "new question".to_string()),
            (Role::Assistant, "fresh answer".to_string()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_load_conversation_replaces_transcript() {
    let h = Harness::new();

    h.controller.submit("pending", None);
    settle().await;

    h.controller
        .load_conversation(vec![Message::user("saved"), Message::assistant("reply")]);
    h.completion
        .respond(Ok(Message::assistant("late")))
        .await;

    assert_eq!(
        h.contents(),
        vec![
            (Role::User, "saved".to_string()),
            (Role::Assistant, "reply".to_string()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_start_then_stop_capture() {
    let h = Harness::new();

    h.controller.start_continuous_capture().unwrap();
    h.controller.stop_continuous_capture();
    assert!(!h.controller.is_listening());
    assert!(!h.capture.is_active());

    tokio::time::advance(Duration::from_secs(5)).await;
    settle().await;

    assert_eq!(h.capture.sessions_started(), 1);
    assert!(!h.controller.is_listening());
}

#[tokio::test(start_paused = true)]
async fn test_start_and_stop_are_idempotent() {
    let h = Harness::new();

    h.controller.start_continuous_capture().unwrap();
    h.controller.start_continuous_capture().unwrap();
    assert_eq!(h.capture.sessions_started(), 1);

    h.controller.stop_continuous_capture();
    h.controller.stop_continuous_capture();
    assert!(!h.controller.is_listening());
}

#[tokio::test(start_paused = true)]
async fn test_utterance_submits_once() {
    let h = Harness::new();

    h.controller.start_continuous_capture().unwrap();
    settle().await;

    assert!(h.feeder.utterance("¿qué hora es?"));
    settle().await;

    assert_eq!(h.contents(), vec![(Role::User, "¿qué hora es?".to_string())]);
    assert_eq!(h.completion.calls(), 1);
    assert!(h.controller.is_listening());
}

#[tokio::test(start_paused = true)]
async fn test_capture_restarts_after_end() {
    let h = Harness::new();
    let events = h.controller.events();

    h.controller.start_continuous_capture().unwrap();
    settle().await;
    while events.try_recv().is_ok() {}

    h.feeder.end();
    settle().await;
    assert!(h.controller.is_listening());
    assert_eq!(h.capture.sessions_started(), 1);

    tokio::time::advance(Duration::from_millis(290)).await;
    settle().await;
    assert_eq!(h.capture.sessions_started(), 1);
    assert!(h.controller.is_listening());

    tokio::time::advance(Duration::from_millis(20)).await;
    settle().await;
    assert_eq!(h.capture.sessions_started(), 2);
    assert!(h.controller.is_listening());
    assert!(h.capture.is_active());

    // The restart is invisible to the view
    assert!(events.try_recv().is_err());

    assert!(h.feeder.utterance("sigo aquí"));
    settle().await;
    assert_eq!(h.completion.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rapid_end_events_are_debounced() {
    let h = Harness::with_config(SessionConfig::default().with_restart_delay_ms(100));

    h.controller.start_continuous_capture().unwrap();
    settle().await;

    for expected in 2..=4 {
        h.feeder.end();
        settle().await;
        tokio::time::advance(Duration::from_millis(50)).await;
        settle().await;
        assert_eq!(h.capture.sessions_started(), expected - 1);

        tokio::time::advance(Duration::from_millis(60)).await;
        settle().await;
        assert_eq!(h.capture.sessions_started(), expected);
    }
    assert!(h.controller.is_listening());
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_pending_restart() {
    let h = Harness::new();

    h.controller.start_continuous_capture().unwrap();
    settle().await;
    h.feeder.end();
    settle().await;

    h.controller.stop_continuous_capture();
    tokio::time::advance(Duration::from_secs(1)).await;
    settle().await;

    assert_eq!(h.capture.sessions_started(), 1);
    assert!(!h.controller.is_listening());
}

#[tokio::test(start_paused = true)]
async fn test_failed_restart_leaves_continuous_mode() {
    let (inner, feeder) = ChannelCapture::new("es-ES");
    let completion = Arc::new(ScriptedCompletion::default());
    let controller = ConversationController::builder(completion)
        .with_capture(Arc::new(OneShotCapture { inner }))
        .build();
    let events = controller.events();

    controller.start_continuous_capture().unwrap();
    settle().await;
    while events.try_recv().is_ok() {}

    feeder.end();
    settle().await;
    assert!(controller.is_listening());

    tokio::time::advance(Duration::from_millis(310)).await;
    settle().await;

    assert!(!controller.is_listening());
    let notices: Vec<_> = events
        .try_iter()
        .filter(|e| matches!(e, SessionEvent::Notice(_)))
        .collect();
    assert_eq!(notices.len(), 1);
    assert!(controller.snapshot().last_notice.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_recognizer_error_surfaces_notice() {
    let h = Harness::new();
    let events = h.controller.events();

    h.controller.start_continuous_capture().unwrap();
    settle().await;
    while events.try_recv().is_ok() {}

    assert!(h.feeder.error("audio-capture"));
    settle().await;

    assert!(h.controller.is_listening());
    assert!(events
        .try_iter()
        .any(|e| matches!(e, SessionEvent::Notice(_))));
    assert!(h.controller.snapshot().last_notice.is_some());
    assert_eq!(h.completion.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_speech_before_reset_stays_out_of_new_conversation() {
    let h = Harness::new();

    h.controller.start_continuous_capture().unwrap();
    settle().await;
    assert!(h.feeder.utterance("old conversation speech"));
    h.controller.reset();
    settle().await;
    assert!(h.controller.transcript().is_empty());

    h.controller.start_continuous_capture().unwrap();
    settle().await;
    assert!(h.controller.transcript().is_empty());
    assert_eq!(h.completion.calls(), 0);

    assert!(h.feeder.utterance("new conversation speech"));
    settle().await;
    assert_eq!(
        h.contents(),
        vec![(Role::User, "new conversation speech".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_capture_unavailable_surfaces_notice() {
    let completion = Arc::new(ScriptedCompletion::default());
    let controller = ConversationController::builder(completion)
        .with_capture(Arc::new(ChannelCapture::unavailable("permission denied")))
        .build();
    let events = controller.events();

    let err = controller.start_continuous_capture().unwrap_err();
    assert!(matches!(err, ColloquyError::CaptureUnavailable(_)));
    assert!(!controller.is_listening());

    let notices: Vec<_> = events
        .try_iter()
        .filter(|e| matches!(e, SessionEvent::Notice(_)))
        .collect();
    assert_eq!(notices.len(), 1);
    assert!(controller.snapshot().last_notice.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_continuous_mode_speaks_replies() {
    let h = Harness::new();

    h.controller.start_continuous_capture().unwrap();
    settle().await;
    h.feeder.utterance("hola");
    settle().await;

    h.completion
        .respond(Ok(Message::assistant("buenas tardes")))
        .await;

    assert!(h.controller.is_speaking());
    assert_eq!(
        h.synthesis.requests.lock().clone(),
        vec![("buenas tardes".to_string(), "es".to_string())]
    );
    assert_eq!(h.player.played.load(Ordering::SeqCst), 1);

    h.player.finished.notify_one();
    settle().await;
    assert!(!h.controller.is_speaking());
}

#[tokio::test(start_paused = true)]
async fn test_voice_preference_speaks_typed_replies() {
    let h = Harness::with_config(SessionConfig::default().with_voice_output(true));

    h.controller.submit("hello", None);
    h.completion.respond(Ok(Message::assistant("hi"))).await;

    assert!(h.controller.is_speaking());
    h.player.finished.notify_one();
    settle().await;
    assert!(!h.controller.is_speaking());
}

#[tokio::test(start_paused = true)]
async fn test_no_speech_without_voice_output() {
    let h = Harness::new();

    h.controller.submit("hello", None);
    h.completion.respond(Ok(Message::assistant("hi"))).await;

    assert!(!h.controller.is_speaking());
    assert!(h.synthesis.requests.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failures_are_not_spoken() {
    let h = Harness::with_config(SessionConfig::default().with_voice_output(true));

    h.controller.submit("hello", None);
    h.completion
        .respond(Err(ColloquyError::NetworkError("timeout".into())))
        .await;

    assert!(!h.controller.is_speaking());
    assert!(h.synthesis.requests.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_utterance_dropped_while_sending() {
    let h = Harness::new();
    let events = h.controller.events();

    h.controller.start_continuous_capture().unwrap();
    settle().await;
    h.controller.submit("typed", None);
    h.feeder.utterance("spoken");
    settle().await;

    assert_eq!(h.contents(), vec![(Role::User, "typed".to_string())]);
    assert_eq!(h.completion.calls(), 1);
    assert!(events
        .try_iter()
        .any(|e| matches!(e, SessionEvent::Notice(n) if n.contains("spoken"))));
}

#[tokio::test(start_paused = true)]
async fn test_stop_capture_keeps_request_in_flight() {
    let h = Harness::new();

    h.controller.start_continuous_capture().unwrap();
    settle().await;
    h.feeder.utterance("pregunta");
    settle().await;

    h.controller.stop_continuous_capture();
    assert!(h.controller.is_sending());

    h.completion
        .respond(Ok(Message::assistant("respuesta")))
        .await;
    assert_eq!(h.controller.transcript().len(), 2);
    assert!(!h.controller.is_speaking());
}

#[tokio::test(start_paused = true)]
async fn test_reset_stops_capture_and_playback() {
    let h = Harness::with_config(SessionConfig::default().with_voice_output(true));

    h.controller.start_continuous_capture().unwrap();
    h.controller.submit("hello", None);
    h.completion.respond(Ok(Message::assistant("hi"))).await;
    assert!(h.controller.is_speaking());

    h.controller.reset();
    let snapshot = h.controller.snapshot();
    assert!(snapshot.transcript.is_empty());
    assert!(snapshot.request.is_idle());
    assert!(!snapshot.capture.is_listening());
    assert!(!snapshot.playback.is_speaking());
    assert!(!h.capture.is_active());

    // The old playback finishing leaves the new session silent
    h.player.finished.notify_one();
    settle().await;
    assert!(!h.controller.is_speaking());
}

#[tokio::test(start_paused = true)]
async fn test_events_announce_appended_messages() {
    let h = Harness::new();
    let events = h.controller.events();

    h.controller.submit("Hello", None);
    h.completion.respond(Ok(Message::assistant("Hi"))).await;

    let appended: Vec<_> = events
        .try_iter()
        .filter_map(|e| match e {
            SessionEvent::MessageAppended(m) => Some(m.content),
            _ => None,
        })
        .collect();
    assert_eq!(appended, vec!["Hello".to_string(), "Hi".to_string()]);
}
