//! Main Entrypoint for the Voice Agent Client
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and applying CLI overrides.
//! 2. Initializing logging.
//! 3. Running one voice session against the default sound devices.
//! 4. Stopping the session gracefully on Ctrl+C.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use voice_agent::{
    audio::{CpalAudio, list_devices},
    config::{Config, load_instructions},
    ws::VoiceSession,
};
use voice_agent_core::{FunctionRegistry, LogNotifier};

#[derive(Parser, Debug)]
#[command(version, about = "Talk to a voice agent from the terminal")]
struct Args {
    /// Input device name or index (overrides INPUT_DEVICE_ID).
    #[arg(long)]
    input_device: Option<String>,

    /// Output device name or index (overrides OUTPUT_DEVICE_ID).
    #[arg(long)]
    output_device: Option<String>,

    /// File with the agent instructions (overrides AGENT_INSTRUCTIONS_PATH).
    #[arg(long)]
    instructions: Option<PathBuf>,

    /// List the available audio devices and exit.
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(device) = args.input_device {
        config.input_device_id = Some(device);
    }
    if let Some(device) = args.output_device {
        config.output_device_id = Some(device);
    }
    if let Some(path) = args.instructions {
        config.agent.instructions = load_instructions(path)?;
    }

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    if args.list_devices {
        let devices = list_devices().context("Failed to enumerate audio devices")?;
        println!("Input devices:");
        for (index, name) in devices.inputs.iter().enumerate() {
            println!("  {index}: {name}");
        }
        println!("Output devices:");
        for (index, name) in devices.outputs.iter().enumerate() {
            println!("  {index}: {name}");
        }
        return Ok(());
    }

    // --- 3. Build the Session ---
    let registry = FunctionRegistry::with_builtins();
    info!(
        functions = registry.len(),
        url = %config.agent_url,
        "Configuration loaded. Starting voice session..."
    );
    let audio = CpalAudio::new(
        config.input_device_id.clone(),
        config.output_device_id.clone(),
    );
    let session = VoiceSession::new(config, registry, Arc::new(LogNotifier));
    let handle = session.handle();

    // --- 4. Run Until Done or Interrupted ---
    let stopper = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal. Stopping session...");
            stopper.stop();
        }
    });

    if let Err(e) = session.run(audio).await {
        error!(error = %e, "Voice session failed");
        return Err(e.into());
    }
    info!(state = %handle.state(), "Voice session has shut down.");
    Ok(())
}
