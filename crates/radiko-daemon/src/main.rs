mod audio;
mod client_ip;
mod http;
mod player;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use radiko_proto::config::Config;
use radiko_proto::state::StateManager;
use radiko_stream::{FfmpegLauncher, RadikoResolver, SessionRegistry, SessionSettings};

use crate::player::{is_valid_area, Player};

/// radiko client: local player and HTTP fan-out relay.
#[derive(Parser, Debug)]
#[command(name = "radiko", version, about, long_about = None)]
struct Cli {
    /// Use ffmpeg/ffplay from PATH instead of ones shipped beside the binary.
    #[arg(long, global = true)]
    use_system_deps: bool,

    /// Listening area (JP1..JP47), overrides config and saved state.
    #[arg(long, global = true, value_name = "JPnn")]
    area: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Relay stations over HTTP to any number of listeners.
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        /// Seconds to keep an idle station's transcoder alive.
        #[arg(long)]
        grace: Option<i64>,
        #[arg(long)]
        bind: Option<String>,
    },
    /// Play a station locally (the default).
    Play {
        #[arg(short, long)]
        station: Option<String>,
        /// Initial volume, 0-100.
        #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=100))]
        volume: Option<u8>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    radiko_proto::platform::set_use_system_deps(cli.use_system_deps);

    let serving = matches!(cli.command, Some(Command::Serve { .. }));
    let log_path = init_logging(serving)?;
    eprintln!("log: {}", log_path.display());
    info!("Log file: {:?}", log_path);

    let mut config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    if let Some(area) = &cli.area {
        anyhow::ensure!(is_valid_area(area), "invalid area '{}' (JP1..JP47)", area);
        config.radiko.area_id = area.to_uppercase();
    }

    match cli.command {
        Some(Command::Serve { port, grace, bind }) => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(grace) = grace {
                config.server.grace_seconds = grace;
            }
            if let Some(bind) = bind {
                config.server.bind_address = bind;
            }
            run_server(config).await
        }
        Some(Command::Play { station, volume }) => {
            run_player(config, cli.area.is_some(), station, volume).await
        }
        None => run_player(config, cli.area.is_some(), None, None).await,
    }
}

/// File log always; stderr as well when running headless.
fn init_logging(with_stderr: bool) -> anyhow::Result<std::path::PathBuf> {
    let data_dir = radiko_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("radiko.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer =
        with_stderr.then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,radiko_stream=debug,radiko_daemon=debug")
            }),
        )
        .init();

    Ok(log_path)
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let resolver = Arc::new(RadikoResolver::new(config.radiko.clone())?);
    let registry = SessionRegistry::new(
        SessionSettings::from_config(&config),
        resolver,
        Arc::new(FfmpegLauncher::new()),
    );
    info!(
        "Serving area {} with grace period {:?}",
        config.radiko.area_id,
        registry.settings().grace_period
    );

    // Sessions are stopped before the server drains so open streams end.
    let stopping = registry.clone();
    let shutdown = async move {
        shutdown_signal().await;
        info!("Shutdown signal received, stopping sessions");
        stopping.stop_all().await;
    };

    http::serve(
        &config.server.bind_address,
        config.server.port,
        registry,
        shutdown,
    )
    .await?;
    info!("Shutdown complete");
    Ok(())
}

async fn run_player(
    mut config: Config,
    area_from_cli: bool,
    station: Option<String>,
    volume: Option<u8>,
) -> anyhow::Result<()> {
    let state = StateManager::new(config.paths.state_file.clone());
    if area_from_cli {
        state.set_area(&config.radiko.area_id).await?;
    } else {
        config.radiko.area_id = state.get_state().await.area_id;
    }
    if let Some(v) = volume {
        state.set_volume(f64::from(v) / 100.0).await?;
    }

    let player = Player::new(config, state)?;
    player
        .run(station.map(|s| s.to_uppercase()))
        .await
        .inspect_err(|e| error!("Player exited with error: {:#}", e))
}

/// Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
