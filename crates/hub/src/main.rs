//! fwdprog Hub
//!
//! Wires a hub controller to a bus provider through the interface registry,
//! pushes a batch of synthetic requests through the forward-progress
//! deferral path and reports what happened to them.

use anyhow::{Context, Result};
use clap::Parser;
use common::{DeferralStats, setup_logging};
use hub::{HubConfig, HubController, HubDevice, config::expand_path};
use interface::{
    Completion, CompletionWaiter, DeferOutcome, InterfaceVersion, OwnerRef, Request, RequestId,
    RequestStatus,
};
use provider::{BusProvider, InterfaceRegistry};
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fwdprog-hub")]
#[command(author, version, about = "Forward-progress deferral hub")]
#[command(long_about = "
Runs a bus provider and a hub controller in one process and drives synthetic
requests through the forward-progress deferral interface.

EXAMPLES:
    # Run with default config
    fwdprog-hub

    # Push 10000 requests through a deliberately small pool
    fwdprog-hub --requests 10000 --pool-limit 8

    # Serve the hub with a version 1 provider and print JSON statistics
    fwdprog-hub --provider-version 1 --stats-json

CONFIGURATION:
    The hub looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/fwdprog/hub.toml
    3. /etc/fwdprog/hub.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Number of synthetic requests to submit
    #[arg(short = 'n', long, default_value_t = 64)]
    requests: u64,

    /// Override the work item pool limit
    #[arg(long, value_name = "COUNT")]
    pool_limit: Option<usize>,

    /// Interface revision the provider offers
    #[arg(long, value_name = "VERSION")]
    provider_version: Option<u16>,

    /// Print statistics as JSON
    #[arg(long)]
    stats_json: bool,
}

/// Outcome of one run
#[derive(Debug, Serialize)]
struct RunReport {
    hub: String,
    mode: String,
    negotiated: Option<String>,
    submitted: u64,
    deferred: u64,
    inline: u64,
    succeeded: u64,
    failed: u64,
    abandoned: u64,
    provider: DeferralStats,
    hub_fallbacks: DeferralStats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = HubConfig::default();
        let path = HubConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        HubConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        HubConfig::load_or_default()
    };

    if let Some(limit) = args.pool_limit {
        config.bus.pool.max_outstanding = limit;
    }
    if let Some(version) = args.provider_version {
        config.bus.provider.version = InterfaceVersion(version);
    }
    config.validate().context("Invalid configuration")?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.hub.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("fwdprog Hub v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);
    if let Some(ref path) = args.config {
        info!("Config: {}", expand_path(path).display());
    }

    let registry = InterfaceRegistry::new();
    let provider = BusProvider::new(&config.bus).context("Failed to start bus provider")?;
    provider
        .publish(&registry)
        .context("Failed to publish forward-progress interface")?;

    let device = HubDevice::new(config.hub.name.clone(), config.hub.ports);
    let ports = device.ports();
    let controller = HubController::connect(&registry, device, &config.hub);

    let (deferred, waiters) = submit_requests(&controller, args.requests, ports);
    info!(
        submitted = args.requests,
        deferred,
        inline = args.requests - deferred,
        "Requests submitted"
    );

    let completions = tokio::select! {
        completions = collect(waiters) => completions,
        _ = signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
            Vec::new()
        }
    };

    let mode = controller.mode();
    let negotiated = controller.negotiated().map(|h| h.to_string());
    let hub_fallbacks = controller.stats();

    // Joining lane workers blocks; keep it off the runtime threads
    let provider_stats = tokio::task::spawn_blocking(move || {
        controller.disconnect();
        provider.withdraw(&registry);
        provider.shutdown();
        provider.stats()
    })
    .await
    .context("Provider shutdown task failed")?;

    let count = |wanted: fn(&RequestStatus) -> bool| {
        completions.iter().filter(|c| wanted(&c.status)).count() as u64
    };
    let report = RunReport {
        hub: config.hub.name.clone(),
        mode: mode.to_string(),
        negotiated,
        submitted: args.requests,
        deferred,
        inline: args.requests - deferred,
        succeeded: count(|s| *s == RequestStatus::Success),
        failed: count(|s| matches!(s, RequestStatus::Failed { .. })),
        abandoned: count(|s| *s == RequestStatus::Abandoned),
        provider: provider_stats,
        hub_fallbacks,
    };

    print_report(&report, args.stats_json)?;
    info!("Hub shutting down...");
    Ok(())
}

/// Submit `count` requests with random payloads; returns how many were deferred
fn submit_requests(
    controller: &HubController,
    count: u64,
    ports: u8,
) -> (u64, Vec<CompletionWaiter>) {
    let mut rng = rand::rng();
    let mut deferred = 0;
    let mut waiters = Vec::with_capacity(count as usize);

    for id in 1..=count {
        let mut payload = vec![0u8; rng.random_range(0..=512)];
        rng.fill(&mut payload[..]);
        let endpoint = (id % u64::from(ports)) as u8 + 1;

        let (request, waiter) = Request::new(RequestId(id), endpoint, payload);
        if let DeferOutcome::Deferred(_) = controller.submit(request, process_request) {
            deferred += 1;
        }
        waiters.push(waiter);
    }

    (deferred, waiters)
}

/// Stand-in for the hub's real request processing
fn process_request(owner: &OwnerRef, request: Request) {
    let status = if request.payload().is_empty() {
        RequestStatus::Failed { code: -22 }
    } else {
        RequestStatus::Success
    };
    tracing::trace!(hub = owner.name(), request = %request.id(), ?status, "Processed request");
    request.complete(status);
}

async fn collect(waiters: Vec<CompletionWaiter>) -> Vec<Completion> {
    let mut completions = Vec::with_capacity(waiters.len());
    for waiter in waiters {
        completions.push(waiter.wait().await);
    }
    completions
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        let text =
            serde_json::to_string_pretty(report).context("Failed to serialize statistics")?;
        println!("{}", text);
        return Ok(());
    }

    println!("Hub:         {} ({})", report.hub, report.mode);
    if let Some(ref negotiated) = report.negotiated {
        println!("Interface:   {}", negotiated);
    }
    println!(
        "Requests:    {} submitted, {} deferred, {} inline",
        report.submitted, report.deferred, report.inline
    );
    println!(
        "Completions: {} ok, {} failed, {} abandoned",
        report.succeeded, report.failed, report.abandoned
    );
    println!(
        "Provider:    {} queued, {} executed, {} rejected, {} inline, {} panics",
        report.provider.queued,
        report.provider.executed,
        report.provider.rejected,
        report.provider.inline_total(),
        report.provider.callback_panics
    );
    println!(
        "Latency:     avg {}, max {}",
        report.provider.queue_latency.format_avg(),
        report.provider.queue_latency.format_max()
    );
    Ok(())
}
