use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use live_conversation::audio::{capture::MAX_VOLUME, CpalBackend};
use live_conversation::settings::{self, LiveSettings};
use live_conversation::streaming::{install_crypto_provider, LiveClient};
use live_conversation::LiveSessionHandle;

/// Talk to a Gemini Live model through the default microphone and speakers.
#[derive(Debug, Parser)]
#[command(name = "live-conversation", version, about)]
struct Args {
    /// Settings file (defaults to <config dir>/live-conversation/settings.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model identifier
    #[arg(long)]
    model: Option<String>,

    /// Prebuilt voice name
    #[arg(long)]
    voice: Option<String>,

    /// System instruction sent at session start
    #[arg(long)]
    system_instruction: Option<String>,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    save_config: bool,
}

fn apply_overrides(settings: &mut LiveSettings, args: &Args) {
    if let Some(model) = &args.model {
        settings.model = model.clone();
    }
    if let Some(voice) = &args.voice {
        settings.voice = voice.clone();
    }
    if let Some(instruction) = &args.system_instruction {
        settings.system_instruction = instruction.clone();
    }
}

fn draw_meter(volume: f32) {
    const WIDTH: usize = 30;
    let filled = ((volume / MAX_VOLUME) * WIDTH as f32).round() as usize;
    let filled = filled.min(WIDTH);
    eprint!("\r[{}{}] {:>5.1}", "#".repeat(filled), " ".repeat(WIDTH - filled), volume);
    let _ = std::io::stderr().flush();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    install_crypto_provider();

    let args = Args::parse();

    let path = match &args.config {
        Some(path) => path.clone(),
        None => settings::settings_path()?,
    };
    let mut settings = settings::load_settings_or_default(&path);
    apply_overrides(&mut settings, &args);

    if args.save_config {
        settings::save_settings(&path, &settings)
            .with_context(|| format!("saving settings to {}", path.display()))?;
        log::info!("Settings saved to {}", path.display());
    }

    let client = LiveClient::from_env()?
        .with_endpoint(settings.endpoint.clone())
        .with_timeouts(settings.connect_timeout(), settings.setup_timeout());

    log::info!(
        "Starting live conversation (model {}, voice {})",
        settings.model,
        settings.voice
    );

    let handle = LiveSessionHandle::spawn(settings, CpalBackend::new(), std::sync::Arc::new(client));
    let mut ui = handle.subscribe();
    handle.connect().await?;

    let mut was_connected = false;
    let mut failure = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                log::info!("Interrupted, disconnecting");
                break;
            }
            changed = ui.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = ui.borrow_and_update().clone();
                if state.is_connected {
                    if !was_connected {
                        log::info!("Connected. Start talking (Ctrl+C to quit).");
                        was_connected = true;
                    }
                    draw_meter(state.volume);
                } else if !state.is_connecting {
                    eprintln!();
                    failure = state.error;
                    if failure.is_none() {
                        log::info!("Session closed by server");
                    }
                    break;
                }
            }
        }
    }

    handle.disconnect().await?;
    let summary = handle.metrics().await;
    log::info!(
        "Sessions: {} ({} opened, {} failed), {} frames sent, {:.1}s audio received, {} interruptions",
        summary.total_sessions,
        summary.opened_sessions,
        summary.failed_sessions,
        summary.total_frames_sent,
        summary.total_audio_received_secs,
        summary.total_interruptions
    );
    handle.shutdown().await;

    match failure {
        Some(message) => Err(anyhow::anyhow!(message)),
        None => Ok(()),
    }
}
