use anyhow::{Context, Result};
use clap::Parser;
use sightline_core::{Action, GestureRecognizer, Mode, Notice, SessionHandle, SessionOptions, SessionOrchestrator};
use sightline_service::config::Config;
use sightline_service::console;
use sightline_service::devices::CpalDevices;
use sightline_service::gemini_adapter::GeminiTransport;
use sightline_service::prompt_loader;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::fmt::time::ChronoLocal;

#[derive(Parser)]
#[command(version, about = "Voice and vision companion driven by touch gestures")]
struct Cli {
    /// Mode to start in (navigation, reading or object)
    #[arg(long)]
    mode: Option<Mode>,
    /// Prebuilt voice for spoken replies
    #[arg(long)]
    voice: Option<String>,
    /// Start with hazard reporting enabled
    #[arg(long)]
    safety: bool,
    /// Image file that an external capture tool keeps overwriting
    #[arg(long)]
    camera: Option<PathBuf>,
    /// Microphone name (see --list-devices)
    #[arg(long)]
    input_device: Option<String>,
    /// Speaker name (see --list-devices)
    #[arg(long)]
    output_device: Option<String>,
    /// Print the audio devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    // --- 3. Parse Command-Line Arguments ---
    let args = Cli::parse();
    if args.list_devices {
        println!("Inputs:\n{}", sightline_native_utils::device::get_available_inputs()?);
        println!("Outputs:\n{}", sightline_native_utils::device::get_available_outputs()?);
        return Ok(());
    }

    tracing::info!("Configuration loaded successfully. Starting Sightline...");

    // --- 4. Load Prompts ---
    let prompts = prompt_loader::prompt_set(config.prompts_dir.as_deref())
        .context("Failed to load persona prompts")?;

    // --- 5. Build the Session ---
    let gemini_config = gemini_live::Config::builder()
        .with_api_key(config.gemini_api_key.clone())
        .with_model(&config.model)
        .build();
    let transport = Arc::new(GeminiTransport::new(gemini_config));
    let devices = Arc::new(CpalDevices::new(args.input_device, args.output_device, args.camera));
    let options = SessionOptions {
        voice: args.voice.unwrap_or(config.voice),
        initial_mode: args.mode.unwrap_or(config.mode),
        safety_mode: args.safety || config.safety,
        ..SessionOptions::default()
    };
    let handle = SessionOrchestrator::spawn(transport, devices, prompts, options);

    // --- 6. Wire Gestures and Notices ---
    let (pointer_tx, pointer_rx) = mpsc::channel(64);
    let (action_tx, action_rx) = mpsc::channel(16);
    let recognizer = tokio::spawn(GestureRecognizer::default().run(pointer_rx, action_tx));
    let forwarder = tokio::spawn(forward_actions(action_rx, handle.clone()));
    let notices = tokio::spawn(print_notices(handle.subscribe()));
    let console = tokio::spawn(console::run_console(handle.clone(), pointer_tx));

    tokio::select! {
        _ = recognizer => {},
        _ = forwarder => {},
        _ = notices => {},
        result = console => match result {
            Ok(Err(e)) => tracing::error!("Console stopped: {:?}", e),
            Err(e) => tracing::error!("Console task failed: {:?}", e),
            Ok(Ok(())) => {}
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl-C, shutting down...");
        }
    }
    tracing::info!("Shutting down...");
    handle.shutdown().await
}

async fn forward_actions(mut actions: mpsc::Receiver<Action>, handle: SessionHandle) {
    while let Some(action) = actions.recv().await {
        if let Err(e) = handle.gesture(action).await {
            tracing::warn!("Dropping gesture {:?}: {}", action, e);
            break;
        }
    }
}

async fn print_notices(mut notices: broadcast::Receiver<Notice>) {
    loop {
        match notices.recv().await {
            Ok(Notice::Error(message)) => println!("[error] {message}"),
            Ok(Notice::Retry(message)) => println!("[retry] {message}"),
            Ok(Notice::Cleared) => {}
            Ok(notice) => match serde_json::to_string(&notice) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!("Could not render notice: {}", e),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Missed {} notices", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
