//! Audio sinks for synthesized speech

use super::{AudioClip, AudioPlayer};
use crate::Result;
use async_trait::async_trait;
use tracing::debug;

#[cfg(feature = "audio-io")]
pub use self::rodio_output::RodioPlayer;

/// Player for text-only front ends: accepts the clip and finishes at once
#[derive(Clone, Debug, Default)]
pub struct NullPlayer;

#[async_trait]
impl AudioPlayer for NullPlayer {
    async fn play(&self, clip: AudioClip) -> Result<()> {
        debug!("Discarding {} bytes of {}", clip.data.len(), clip.mime_type);
        Ok(())
    }
}

#[cfg(feature = "audio-io")]
mod rodio_output {
    use crate::service::{AudioClip, AudioPlayer};
    use crate::{ColloquyError, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
    use std::io::Cursor;
    use std::sync::Arc;
    use tracing::{debug, info};

    /// Plays clips on the default output device
    ///
    /// `OutputStream` is not `Send`, so it lives on a dedicated thread for as
    /// long as the player exists. Each clip gets its own `Sink`.
    pub struct RodioPlayer {
        handle: OutputStreamHandle,
        current: Mutex<Option<Arc<Sink>>>,
        _shutdown: crossbeam_channel::Sender<()>,
    }

    impl RodioPlayer {
        /// Open the default output device
        pub fn new() -> Result<Self> {
            let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
            let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);

            std::thread::Builder::new()
                .name("audio-output".into())
                .spawn(move || match OutputStream::try_default() {
                    Ok((stream, handle)) => {
                        let _ = ready_tx.send(Ok(handle));
                        // Returns once the player is dropped
                        let _ = shutdown_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                    }
                })
                .map_err(|e| {
                    ColloquyError::PlaybackError(format!("Failed to spawn audio thread: {}", e))
                })?;

            let handle = ready_rx
                .recv()
                .map_err(|_| ColloquyError::PlaybackError("Audio thread exited".into()))?
                .map_err(|e| ColloquyError::PlaybackError(format!("No output device: {}", e)))?;

            info!("Audio output ready");
            Ok(Self {
                handle,
                current: Mutex::new(None),
                _shutdown: shutdown_tx,
            })
        }

        pub fn is_playing(&self) -> bool {
            self.current.lock().is_some()
        }
    }

    #[async_trait]
    impl AudioPlayer for RodioPlayer {
        async fn play(&self, clip: AudioClip) -> Result<()> {
            let source = Decoder::new(Cursor::new(clip.data)).map_err(|e| {
                ColloquyError::PlaybackError(format!("Failed to decode {}: {}", clip.mime_type, e))
            })?;
            let sink = Sink::try_new(&self.handle)
                .map_err(|e| ColloquyError::PlaybackError(format!("Failed to open sink: {}", e)))?;
            sink.append(source);

            let sink = Arc::new(sink);
            if let Some(previous) = self.current.lock().replace(Arc::clone(&sink)) {
                previous.stop();
            }

            let playing = Arc::clone(&sink);
            tokio::task::spawn_blocking(move || playing.sleep_until_end())
                .await
                .map_err(|e| ColloquyError::PlaybackError(e.to_string()))?;

            let mut current = self.current.lock();
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &sink)) {
                *current = None;
            }
            debug!("Playback finished");
            Ok(())
        }

        fn stop(&self) {
            if let Some(sink) = self.current.lock().take() {
                debug!("Stopping playback");
                sink.stop();
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_player_finishes_immediately() {
        let player = NullPlayer;
        player
            .play(AudioClip::new(vec![0x49, 0x44, 0x33], "audio/mpeg"))
            .await
            .unwrap();
    }
}
