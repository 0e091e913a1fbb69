//! fluxwarden engine
//!
//! Discovers control-plane nodes, then runs per-node automation driven by
//! credential events.
//!
//! ## I/O
//!
//! - **stdin**: inbound events, one JSON object per line
//! - **stdout**: outbound events (node table, log history, status,
//!   purge/reload requests, redacted log lines), one JSON object per line
//! - **stderr**: structured JSON process logs

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fluxwarden_agent::bridge::{read_inbound, write_outbound};
use fluxwarden_agent::logging::{init_tracing, LogSink, Subsystem};
use fluxwarden_agent::{
    AutomationScheduler, ChannelCollaborator, Config, CredentialVault, Discovery, DiscoveryConfig,
    HttpProber, HttpWorkloadClient, NodeRegistry, PolicyMatcher, SchedulerConfig,
    SchedulerContext,
};
use fluxwarden_events::OutboundEvent;
use fluxwarden_sealing::select_store;
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

/// Log line queue depth; lines beyond it are dropped.
const LOG_CAPACITY: usize = 1024;
const CONTROL_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 64;

/// How long shutdown waits for queued outbound events to be written.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "fluxwarden", version, about = "Fleet discovery and workload policy automation")]
struct Args {
    /// TOML settings file.
    #[arg(long, env = "FLUXWARDEN_SETTINGS")]
    settings: Option<PathBuf>,

    /// Run discovery, print the node table as JSON and exit.
    #[arg(long)]
    discover_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.settings.as_deref())?;

    let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
    let (log_tx, log_rx) = mpsc::channel(LOG_CAPACITY);
    let log_sink = LogSink::new(log_tx);
    init_tracing(&config, log_sink.clone())?;

    info!(subsystem = %Subsystem::Main, "Starting fluxwarden");
    config.report();

    let prober = HttpProber::new(config.probe_timeout).context("building probe client")?;
    let nodes = Discovery::new(prober, DiscoveryConfig::default())
        .discover(&config.scan_hosts)
        .await;
    if nodes.is_empty() {
        error!(
            subsystem = %Subsystem::Main,
            hosts = ?config.scan_hosts,
            "No active nodes found"
        );
        anyhow::bail!("No active nodes found on {:?}", config.scan_hosts);
    }

    let registry = Arc::new(NodeRegistry::from_nodes(nodes));
    let snapshot = registry.snapshot().await;

    if args.discover_only {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let selection = select_store(config.sealing_mode, config.sealing_key.as_deref());
    let vault = Arc::new(CredentialVault::new(registry.clone(), selection.store));
    vault.report_sealing(selection.degraded_reason.as_deref());
    let client = HttpWorkloadClient::new(config.request_timeout, config.debug)
        .context("building workload client")?;

    let scheduler = AutomationScheduler::new(
        SchedulerContext {
            registry: registry.clone(),
            vault,
            api: Arc::new(client),
            policy: PolicyMatcher::new(config.target_prefixes.clone()),
            collaborator: Arc::new(ChannelCollaborator::new(control_tx.clone())),
        },
        SchedulerConfig::from_config(&config),
    );

    control_tx
        .send(OutboundEvent::NodesDiscovered { nodes: snapshot })
        .await
        .context("publishing node table")?;
    control_tx
        .send(OutboundEvent::LogHistory {
            lines: log_sink.attach(),
        })
        .await
        .context("publishing log history")?;
    drop(control_tx);

    let writer_handle = tokio::spawn(write_outbound(tokio::io::stdout(), control_rx, log_rx));

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    let reader_handle = tokio::spawn(read_inbound(BufReader::new(tokio::io::stdin()), inbound_tx));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle =
        tokio::spawn(async move { scheduler.run(inbound_rx, shutdown_rx).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!(subsystem = %Subsystem::Main, "Received shutdown signal");
        }
        result = reader_handle => {
            match result {
                Ok(Ok(count)) => info!(subsystem = %Subsystem::Main, events = count, "Inbound stream closed"),
                Ok(Err(e)) => error!(subsystem = %Subsystem::Main, error = %e, "Inbound stream error"),
                Err(e) => error!(subsystem = %Subsystem::Main, error = %e, "Inbound reader panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_handle.await {
        error!(subsystem = %Subsystem::Main, error = %e, "Scheduler task panicked");
    }

    info!(subsystem = %Subsystem::Main, "fluxwarden shutdown complete");
    log_sink.close();
    match tokio::time::timeout(WRITER_DRAIN, writer_handle).await {
        Ok(Ok(Ok(_))) => {}
        Ok(Ok(Err(e))) => error!(subsystem = %Subsystem::Main, error = %e, "Outbound writer failed"),
        Ok(Err(e)) => error!(subsystem = %Subsystem::Main, error = %e, "Outbound writer panicked"),
        Err(_) => error!(subsystem = %Subsystem::Main, "Outbound writer did not drain in time"),
    }
    Ok(())
}
