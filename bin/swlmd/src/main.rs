//! ---
//! swm_section: "01-core-functionality"
//! swm_subsection: "binary"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Binary entrypoint for the software loading manager daemon."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use prometheus::{Encoder, Registry, TextEncoder};
use swm_common::{init_tracing, AppConfig};
use swm_core::{Orchestrator, OrchestratorMetrics};
use swm_msg::{MessagingMetricsExporter, TcpTransport};
use swm_persistence::{PersistenceMetrics, Store};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod server;

use server::Inbound;

#[derive(Debug, Parser)]
#[command(author, version, about = "Software loading manager daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Clear persisted updates and operations before starting")]
    reset_db: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/swlm.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;
    init_tracing("swlmd", &config.logging)?;
    info!(config_path = %loaded.source.display(), "configuration loaded");

    let registry = config.metrics.enabled.then(|| Arc::new(Registry::new()));

    let mut store = Store::open(&config.database.path)
        .with_context(|| format!("unable to open store {}", config.database.path.display()))?;
    if let Some(registry) = &registry {
        store = store.with_metrics(PersistenceMetrics::new(registry.clone())?);
    }
    if cli.reset_db || config.database.reset_on_start {
        store.reset()?;
        warn!(path = %config.database.path.display(), "persisted updates cleared");
    }

    let bus_metrics = registry
        .as_deref()
        .map(MessagingMetricsExporter::register)
        .transpose()?;
    let (transport, writer) = TcpTransport::spawn(config.bus.endpoints.clone(), bus_metrics.clone());
    for (service, endpoint) in &config.bus.endpoints {
        debug!(service = %service, endpoint = %endpoint, "bus endpoint configured");
    }

    let mut orchestrator = Orchestrator::from_config(&config, store, Arc::new(transport));
    if let Some(registry) = &registry {
        orchestrator = orchestrator.with_metrics(OrchestratorMetrics::new(registry.clone())?);
    }

    let (events, inbox) = mpsc::channel::<Inbound>(64);
    let (address, listener) = server::spawn_listener(config.bus.listen, events, bus_metrics).await?;
    info!(address = %address, "daemon running; waiting for termination signal");

    run_event_loop(&mut orchestrator, inbox, &config).await?;

    orchestrator.shutdown();
    listener.abort();
    writer.abort();
    if let Some(registry) = &registry {
        dump_metrics(registry);
    }
    Ok(())
}

/// Single owner of the orchestrator: inbound calls and deadline ticks are
/// handled strictly one at a time.
async fn run_event_loop(
    orchestrator: &mut Orchestrator,
    mut inbox: mpsc::Receiver<Inbound>,
    config: &AppConfig,
) -> Result<()> {
    let mut ticker = tokio::time::interval(config.operations.tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(Inbound { request, reply }) = inbox.recv() => {
                debug!(method = request.method(), "handling inbound call");
                let value = orchestrator.handle(request);
                if reply.send(value).is_err() {
                    debug!("caller went away before the reply");
                }
            }
            _ = ticker.tick() => {
                if orchestrator.expire_stalled_operation(Instant::now()) {
                    info!(state = ?orchestrator.state(), "stalled operation expired");
                }
            }
            result = &mut shutdown => {
                result?;
                info!("ctrl-c received; shutting down");
                return Ok(());
            }
        }
    }
}

fn dump_metrics(registry: &Registry) {
    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        Ok(()) => info!(metrics = %String::from_utf8_lossy(&buffer), "final metrics snapshot"),
        Err(err) => warn!(error = %err, "failed to encode metrics"),
    }
}
