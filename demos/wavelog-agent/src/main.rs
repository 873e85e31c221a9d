//! Logging agent fed by the in-process loopback provider.
//!
//! Run with: cargo run -p wavelog-agent -- --seconds 5 --export
//!
//! Logs synthetic accelerometer and location samples into the SQLite store
//! named by the config, then optionally exports and empties it.

use std::{f64::consts::TAU, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wavelog_core::{LoggerConfig, ProviderSample, SampleStore, StreamBinding, StreamType};
use wavelog_export::{DirectorySink, ExportCoordinator};
use wavelog_provider::LoopbackProvider;
use wavelog_session::LoggingSession;
use wavelog_store::SqliteStore;

/// Wavelog background logging agent
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (TOML). Built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds to log for. Runs until Ctrl-C when omitted.
    #[arg(short, long)]
    seconds: Option<u64>,

    /// Synthetic samples per second, per stream
    #[arg(long, default_value = "20")]
    rate_hz: u32,

    /// Export the store after logging
    #[arg(long)]
    export: bool,

    /// Empty the store after a complete export
    #[arg(long, requires = "export")]
    purge: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => LoggerConfig::load(path)?,
        None => LoggerConfig::default(),
    };

    let store = Arc::new(SqliteStore::open_with_config(&config.store).await?);
    agent(&cli, &config, store).await
}

/// Log, then export if asked. The session is torn down, and the store
/// closed, however this ends.
async fn agent(cli: &Cli, config: &LoggerConfig, store: Arc<SqliteStore>) -> anyhow::Result<()> {
    let provider = config
        .streams
        .iter()
        .fold(LoopbackProvider::new(), |provider, binding| provider.authorize(&binding.id));
    let session = LoggingSession::new(config, Arc::new(provider.clone()), Arc::clone(&store));

    let result = run(cli, config, &session, &store, provider).await;
    session.teardown().await;
    result
}

async fn run(
    cli: &Cli,
    config: &LoggerConfig,
    session: &LoggingSession<SqliteStore>,
    store: &Arc<SqliteStore>,
    provider: LoopbackProvider,
) -> anyhow::Result<()> {
    let report = session
        .start(config.streams.iter().map(|binding| binding.id.clone()))
        .await?;
    for subscription in &report.active {
        tracing::info!(
            stream_id = %subscription.stream_id,
            stream_type = %subscription.stream_type,
            "Logging stream"
        );
    }

    let generator = tokio::spawn(generate(provider, config.streams.clone(), cli.rate_hz));
    let waited = match cli.seconds {
        Some(seconds) => {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(seconds)) => Ok(()),
                signal = tokio::signal::ctrl_c() => signal,
            }
        }
        None => tokio::signal::ctrl_c().await,
    };

    let stopped = session.stop().await;
    generator.abort();
    waited?;
    tracing::info!(
        inserted = stopped.ingest.inserted,
        failed = stopped.ingest.failed,
        dropped = stopped.ingest.dropped,
        "Logging finished"
    );

    if cli.export {
        let coordinator = ExportCoordinator::new(Arc::clone(store));
        let result = coordinator
            .export(&DirectorySink::new(&config.export.directory))
            .await?
            .into_result()?;
        tracing::info!(location = %result.location, rows = result.total_rows(), "Data has been exported");

        if cli.purge {
            let purged = store.purge().await?;
            tracing::info!(purged, "Store emptied");
        }
    }

    Ok(())
}

/// Push synthetic samples for every registered stream until nobody listens.
async fn generate(provider: LoopbackProvider, streams: Vec<StreamBinding>, rate_hz: u32) {
    let period = Duration::from_secs_f64(1.0 / f64::from(rate_hz.max(1)));
    let mut ticker = tokio::time::interval(period);
    let mut tick: u32 = 0;

    loop {
        ticker.tick().await;
        let sampled_at_ms = chrono::Utc::now().timestamp_millis();
        let phase = f64::from(tick % 1000) / 1000.0 * TAU;

        let mut delivered = false;
        for binding in &streams {
            let sample = match binding.stream_type {
                StreamType::Accel => ProviderSample::new(sampled_at_ms)
                    .with_value("x", phase.sin())
                    .with_value("y", phase.cos())
                    .with_value("z", 9.81),
                StreamType::Location => ProviderSample::new(sampled_at_ms)
                    .with_value("latitude", 37.8719 + phase.sin() * 1e-4)
                    .with_value("longitude", -122.2585 + phase.cos() * 1e-4)
                    .with_value("altitude", 52.0)
                    .with_value("accuracy", 5.0),
            };
            delivered |= provider.push(&binding.id, sample);
        }
        if !delivered {
            tracing::debug!("No listeners left, generator stopping");
            break;
        }
        tick = tick.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_failed_start_still_closes_store() {
        let dir = TempDir::new().unwrap();
        let mut config = LoggerConfig::default();
        config.store.path = dir.path().join("agent.db");
        config.streams.clear();
        let store = Arc::new(SqliteStore::open_with_config(&config.store).await.unwrap());

        let cli = Cli::parse_from(["wavelog-agent", "--seconds", "0"]);
        assert!(agent(&cli, &config, Arc::clone(&store)).await.is_err());
        assert!(store.is_closed());
    }
}
