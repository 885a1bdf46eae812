//! Swarm runner entry point.
//!
//! Loads `geoswarm.yaml` (or the file named by `GEOSWARM_CONFIG`), opens
//! the configured transport, spawns the swarm and runs it until Ctrl-C or
//! the run timeout, then drains every entity and logs a summary.

use std::sync::Arc;

use anyhow::Context as _;
use geoswarm_runner::config::{SwarmConfig, TransportKind};
use geoswarm_runner::loopback::LoopbackTransport;
use geoswarm_runner::nats::NatsTransport;
use geoswarm_runner::status::SwarmStatus;
use geoswarm_runner::swarm::Swarm;
use geoswarm_runner::transport::Transport;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration, transport setup or logging
/// initialisation fails.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SwarmConfig::load().context("failed to load configuration")?;
    init_logging(&config);

    info!(
        entities = config.swarm.entity_count,
        batch_size = config.swarm.batch_size,
        cell_size = config.grid.cell_size,
        policy = ?config.grid.policy,
        reconcile = ?config.grid.reconcile,
        transport = ?config.transport.kind,
        "geoswarm-runner starting"
    );

    let transport: Arc<dyn Transport> = match config.transport.kind {
        TransportKind::Nats => Arc::new(
            NatsTransport::connect(&config.transport)
                .await
                .context("failed to open NATS transport")?,
        ),
        TransportKind::Loopback => Arc::new(LoopbackTransport::new()),
    };

    let swarm = Swarm::new(config.clone(), transport).context("invalid grid settings")?;
    let reporter = config
        .status
        .report_interval()
        .map(|period| spawn_reporter(swarm.status(), period));

    let summary = swarm.run(interrupted()).await;
    if let Some(reporter) = reporter {
        reporter.abort();
    }

    let rendered = serde_json::to_string(&summary).unwrap_or_default();
    if summary.is_clean() {
        info!(summary = %rendered, "swarm finished");
    } else {
        error!(summary = %rendered, "swarm finished with entities still holding cells");
    }
    Ok(())
}

fn init_logging(config: &SwarmConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolve on Ctrl-C. If the handler cannot be installed, never resolve
/// and leave shutdown to the run timeout.
async fn interrupted() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received"),
        Err(e) => {
            error!(error = %e, "failed to listen for interrupt");
            std::future::pending::<()>().await;
        }
    }
}

fn spawn_reporter(status: Arc<SwarmStatus>, period: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let snap = status.snapshot();
            info!(
                uptime_ms = snap.uptime_ms,
                connecting = snap.connecting,
                active = snap.active,
                draining = snap.draining,
                failed = snap.failed,
                ticks = snap.ticks,
                remote_call_failures = snap.remote_call_failures,
                malformed_events = snap.malformed_events,
                "swarm status"
            );
        }
    })
}
