//! Attacca player - main entry point
//!
//! Headless local audio player: activates a music folder (given on the
//! command line, or the last one used) and plays it until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use attacca_library::Library;
use attacca_player::audio::AudioOutput;
use attacca_player::config::Config;
use attacca_player::db::{open_database, settings};
use attacca_player::{PlaybackEngine, SharedState};

/// Command-line arguments for attacca-player
#[derive(Parser, Debug)]
#[command(name = "attacca-player")]
#[command(about = "Local audio player with gapless and crossfaded transitions")]
#[command(version)]
struct Args {
    /// Music folder to play (defaults to the last activated folder)
    folder: Option<PathBuf>,

    /// Data directory for the player database
    /// (default: ATTACCA_DATA_DIR, config file, then platform default)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Audio output device name (see --list-devices)
    #[arg(long)]
    device: Option<String>,

    /// List available audio output devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "attacca_player=info,attacca_library=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if args.list_devices {
        for name in AudioOutput::list_devices().context("Failed to enumerate audio devices")? {
            println!("{}", name);
        }
        return Ok(());
    }

    let config = Config::resolve(args.data_dir.as_deref(), args.device.clone())
        .context("Failed to resolve the data directory")?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;

    info!("Data directory: {}", config.data_dir.display());

    let db = open_database(&config.db_path)
        .await
        .context("Failed to open the player database")?;

    let folder = match args.folder {
        Some(folder) => folder,
        None => settings::get_last_folder(&db)
            .await?
            .map(PathBuf::from)
            .context("No folder given and no previous folder recorded")?,
    };

    let state = Arc::new(SharedState::new());
    let library = Arc::new(Library::new());
    let engine = Arc::new(
        PlaybackEngine::new(db, Arc::clone(&state), library, config.device.clone())
            .await
            .context("Failed to initialize the playback engine")?,
    );

    engine
        .start()
        .await
        .context("Failed to start the playback engine")?;

    engine
        .activate_folder(&folder)
        .await
        .with_context(|| format!("Failed to activate {}", folder.display()))?;

    engine.play().await.context("Failed to start playback")?;

    shutdown_signal().await;

    engine.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
