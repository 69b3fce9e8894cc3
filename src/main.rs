use color_eyre::{eyre::eyre, Result};
use mqttstream::config::AppConfig;
use mqttstream::{Envelope, StreamManager, StreamState};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = AppConfig::locate(std::env::args().nth(1));
    let config = AppConfig::load(&path).await?;

    let manager = StreamManager::new(config.stream_config(), config.stream_options()?)
        .with_handler(log_message);
    manager
        .start()
        .await
        .map_err(|e| eyre!("Failed to start {} stream: {}", manager.config().kind(), e))?;

    let mut states = manager.subscribe_state();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Could not listen for Ctrl-C: {}", e);
            }
            info!("Ctrl-C received, stopping");
        }
        _ = run_limit(config.run_for()) => info!("Run time elapsed, stopping"),
        _ = async { states.wait_for(|state| *state != StreamState::Running).await.is_ok() } => {
            info!("Stream ended on its own");
        }
    }

    let ended_in = manager.state();
    let stopped = manager.stop().await;
    info!("Stream stats: {}", serde_json::to_string(&manager.stats())?);

    stopped.map_err(|e| eyre!("Stream did not stop cleanly: {}", e))?;
    if ended_in == StreamState::Failed {
        return Err(eyre!("Stream failed"));
    }
    Ok(())
}

fn log_message(envelope: &Envelope) -> Result<()> {
    info!("{}", envelope);
    Ok(())
}

async fn run_limit(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
