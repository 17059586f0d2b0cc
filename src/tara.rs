use std::time::Duration;

use anyhow::Result;
use tara::{
    APP_NAME_PRETTY, ConfigManager, DEFAULT_LOG_LEVEL, SessionPhase, VERSION, VoiceEvent,
    VoiceInput,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize the logger
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("TARA_LOG")
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load config
    let config_manager = ConfigManager::new()?;
    let config = config_manager.load()?;
    // save back the config to create the file if it doesn't exist
    config_manager.save(&config)?;
    info!(path = %config_manager.config_path().display(), "Loaded config");

    let (events, mut event_rx) = mpsc::unbounded_channel();
    let mut voice = VoiceInput::from_config(&config, events)?;

    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(event);
        }
    });

    println!("{} {}", APP_NAME_PRETTY, VERSION);
    println!("Press Enter to start or stop listening, q to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "q" | "quit" => break,
            _ if voice.is_listening() => voice.stop(),
            _ => match voice.start() {
                Ok(strategy) => info!(strategy = %strategy, "Listening"),
                Err(e) => warn!(error = %e, "Could not start listening"),
            },
        }
    }

    voice.shutdown().await;
    // A model download may still hold the event channel open.
    drop(voice);
    tokio::time::timeout(Duration::from_millis(200), printer).await.ok();
    Ok(())
}

fn print_event(event: VoiceEvent) {
    match event {
        VoiceEvent::StrategySelected(strategy) => println!("[{}]", strategy),
        VoiceEvent::PhaseChanged(SessionPhase::Listening) => println!("Listening..."),
        VoiceEvent::PhaseChanged(_) => {}
        VoiceEvent::ModelProgress(percent) => println!("Preparing voice model: {}%", percent),
        VoiceEvent::Partial(text) => println!("  {}", text),
        VoiceEvent::Transcript(transcript) => println!("You: {}", transcript),
        VoiceEvent::Reply(reply) => println!("Tara: {}", reply),
        VoiceEvent::Error(message) => println!("! {}", message),
    }
}
