//! Colloquy - terminal front end
//!
//! Line-oriented chat against the backend. Typed lines are submitted; in
//! listen mode they are fed through the capture source as recognized speech
//! instead, exercising continuous voice mode without a microphone.

use anyhow::{Context, Result};
use clap::Parser;
use colloquy::service::{
    AudioPlayer, CaptureFeeder, ChannelCapture, ConversationStore, HttpBackend, NullPlayer,
};
use colloquy::{AppConfig, Attachment, ConversationController, SessionEvent};
use crossbeam_channel::Receiver;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "colloquy", version, about = "Chat with the assistant from the terminal")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Model to start with
    #[arg(short, long)]
    model: Option<String>,

    /// Bearer token for the backend
    #[arg(long, env = "COLLOQUY_TOKEN")]
    token: Option<String>,

    /// Speak replies
    #[arg(long)]
    voice: bool,
}

const HELP: &str = "\
Commands:
  /new               start a new conversation
  /model [NAME]      show or select the model
  /models            list backend models
  /history           list stored conversations
  /open ID           load a stored conversation
  /delete ID         delete a stored conversation
  /image PATH [TEXT] send an image with optional text
  /voice             toggle spoken replies
  /listen            toggle continuous voice mode (lines become utterances)
  /end               end the current capture session (listen mode)
  /quit              exit";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "colloquy=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let mut config = load_config(&args)?;
    info!("Starting Colloquy against {}", config.backend.base_url);

    let backend = Arc::new(HttpBackend::new(config.backend.clone())?);
    if let Err(e) = backend.health().await {
        warn!("Backend health check failed: {}", e);
    }

    if args.model.is_none() {
        match backend.first_model().await {
            Ok(Some(model)) => {
                info!("Selecting model {}", model);
                config.session.default_model = model;
            }
            Ok(None) => {}
            Err(e) => warn!("Could not list models: {}", e),
        }
    }

    let (capture, feeder) = ChannelCapture::new(config.session.capture_locale.clone());
    let controller = ConversationController::builder(backend.clone())
        .with_config(config.session.clone())
        .with_synthesis(backend.clone())
        .with_player(output_player())
        .with_capture(Arc::new(capture))
        .build();

    let events = controller.events();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tick = tokio::time::interval(Duration::from_millis(50));

    println!("{}", HELP);
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if !handle_line(&controller, &backend, &feeder, line.trim()).await {
                    break;
                }
            }
            _ = tick.tick() => drain_events(&events),
        }
    }

    controller.shutdown();
    drain_events(&events);
    info!("Goodbye");
    Ok(())
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => AppConfig::default(),
    };

    if let Some(base_url) = &args.base_url {
        config.backend.base_url = base_url.clone();
    }
    if let Some(token) = &args.token {
        config.backend.auth_token = Some(token.clone());
    }
    if let Some(model) = &args.model {
        config.session.default_model = model.clone();
    }
    if args.voice {
        config.session.voice_output_enabled = true;
    }
    Ok(config)
}

#[cfg(feature = "audio-io")]
fn output_player() -> Arc<dyn AudioPlayer> {
    match colloquy::service::RodioPlayer::new() {
        Ok(player) => Arc::new(player),
        Err(e) => {
            warn!("Spoken replies will be silent: {}", e);
            Arc::new(NullPlayer)
        }
    }
}

#[cfg(not(feature = "audio-io"))]
fn output_player() -> Arc<dyn AudioPlayer> {
    Arc::new(NullPlayer)
}

/// Handle one input line; returns false to quit
async fn handle_line(
    controller: &ConversationController,
    backend: &HttpBackend,
    feeder: &CaptureFeeder,
    line: &str,
) -> bool {
    let (command, rest) = match line.split_once(' ') {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "/quit" | "/exit" => return false,
        "/help" => println!("{}", HELP),
        "/new" => {
            controller.reset();
            println!("-- new conversation --");
        }
        "/model" if rest.is_empty() => println!("model: {}", controller.selected_model()),
        "/model" => controller.set_selected_model(rest),
        "/models" => match backend.list_models().await {
            Ok(models) => {
                for model in models {
                    println!("  {}", model.name);
                }
            }
            Err(e) => println!("! {}", e.user_message()),
        },
        "/history" => match backend.list_conversations().await {
            Ok(conversations) => {
                for conv in conversations {
                    println!(
                        "  {}  {}",
                        conv.id,
                        conv.title.or(conv.last_message).unwrap_or_default()
                    );
                }
            }
            Err(e) => println!("! {}", e.user_message()),
        },
        "/open" => match controller.open_conversation(backend, rest).await {
            Ok(_) => {
                for message in controller.transcript() {
                    println!("{}> {}", message.role, message.content);
                }
            }
            Err(e) => println!("! {}", e.user_message()),
        },
        "/delete" => match backend.delete_conversation(rest).await {
            Ok(()) => println!("deleted {}", rest),
            Err(e) => println!("! {}", e.user_message()),
        },
        "/image" => {
            let (path, text) = rest.split_once(' ').unwrap_or((rest, ""));
            match read_attachment(Path::new(path)).await {
                Ok(attachment) => submit(controller, text, Some(&attachment)),
                Err(e) => println!("! {:#}", e),
            }
        }
        "/voice" => {
            let enabled = controller.toggle_voice_output();
            println!("spoken replies {}", if enabled { "on" } else { "off" });
        }
        "/listen" if controller.is_listening() => controller.stop_continuous_capture(),
        "/listen" => {
            if controller.start_continuous_capture().is_ok() {
                println!("listening; lines are sent as speech, /listen to stop");
            }
        }
        "/end" => {
            feeder.end();
        }
        _ if controller.is_listening() => {
            feeder.utterance(line);
        }
        _ => submit(controller, line, None),
    }
    true
}

fn submit(controller: &ConversationController, text: &str, attachment: Option<&Attachment>) {
    if !controller.submit(text, attachment) && controller.is_sending() {
        println!("(waiting for the previous reply)");
    }
}

async fn read_attachment(path: &Path) -> Result<Attachment> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let mime_type = match path.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    };
    Ok(Attachment::new(name, mime_type, data))
}

fn drain_events(events: &Receiver<SessionEvent>) {
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::MessageAppended(message) if message.is_assistant() => {
                println!("assistant> {}", message.content);
            }
            SessionEvent::Notice(notice) => println!("! {}", notice),
            _ => {}
        }
    }
}
