pub mod clock;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod feed;
pub mod mqtt;
pub mod orchestrator;
pub mod scheduler;
pub mod sensor;
#[cfg(test)]
pub mod testing;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{reload, FmtSubscriber};

use crate::clock::SystemClock;
use crate::config::AgentConfig;
use crate::mqtt::reachability::PingProbe;
use crate::mqtt::transport::RumqttTransport;
use crate::orchestrator::Orchestrator;

#[derive(Parser, Debug)]
#[command(name = "garage-monitor")]
#[command(author, version, about = "Publishes garage sensor readings to an MQTT broker", long_about = None)]
struct Cli {
    /// Log every published reading
    #[arg(short, long)]
    debug: bool,

    /// Configuration file (default: ~/.config/garage-monitor/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = setup(cli.debug)?;

    let config = AgentConfig::load(cli.config.as_deref())
        .await
        .map_err(|e| eyre!("Configuration rejected: {}", e))?;
    if config.verbose && !cli.debug {
        log_level.reload(LevelFilter::DEBUG)?;
        debug!("Verbose logging enabled by configuration");
    }
    info!(
        "Starting garage monitor {} for broker {}:{}",
        config.broker.client_id, config.broker.host, config.broker.port
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let sensors = sensor::open_all(&config.sensors);
    info!("{} sensor(s) configured", sensors.len());

    let transport = RumqttTransport::new(
        config.broker.client_id.clone(),
        config.broker.request_capacity,
        Duration::from_secs(config.broker.reconnect_delay_secs),
    );
    let probe = PingProbe::new(config.broker.port);
    let orchestrator = Orchestrator::new(config, Arc::new(SystemClock::start()));

    match orchestrator
        .run(Box::new(transport), &probe, sensors, shutdown)
        .await
    {
        Ok(report) => {
            info!(
                "Stopped after {} publish(es), {} dropped",
                report.session.published, report.session.dropped
            );
            Ok(())
        }
        Err(orchestrator::OrchestratorError::Cancelled) => {
            warn!("Stopped before the broker session was established");
            Ok(())
        }
        Err(e) => {
            error!("Startup failed: {}", e);
            Err(eyre!("Startup failed: {}", e))
        }
    }
}

fn setup(verbose: bool) -> Result<LevelHandle> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(setup_logging_env(verbose))
}

/// Switches the log level once the configuration is known
struct LevelHandle(Box<dyn Fn(LevelFilter) -> Result<(), reload::Error>>);

impl LevelHandle {
    fn reload(&self, level: LevelFilter) -> Result<(), reload::Error> {
        (self.0)(level)
    }
}

fn setup_logging_env(verbose: bool) -> LevelHandle {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .with_filter_reloading();
    let handle = builder.reload_handle();
    builder.init();
    LevelHandle(Box::new(move |level| handle.reload(level)))
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
                    _ = terminate.recv() => info!("Terminate received"),
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Cannot listen for Ctrl-C: {}", e);
                    return;
                }
            }
        }
    }
    #[cfg(not(unix))]
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for Ctrl-C: {}", e);
        return;
    }

    info!("Shutting down");
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_raise_log_level_after_logging_started() {
        let level = setup_logging_env(false);
        info!("Logging before configuration is loaded");
        assert_eq!(LevelFilter::current(), LevelFilter::INFO);

        level.reload(LevelFilter::DEBUG).unwrap();
        assert_eq!(LevelFilter::current(), LevelFilter::DEBUG);
    }
}
