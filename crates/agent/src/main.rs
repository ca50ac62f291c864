//! Autorange agent
//!
//! Runs on each host, watches the configured workloads through cgroup v2,
//! learns their memory and CPU limits and applies them once learned.

use anyhow::Result;
use autorange_agent::{api, config};
use autorange_core::{
    collector::{CgroupV2Runtime, CgroupV2Sampler, SamplingLoopBuilder},
    health::{components, ComponentHealth, HealthRegistry},
    observability::{AutoRangeMetrics, StructuredLogger},
    AttachOutcome, Supervisor,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting autorange-agent");

    let config = config::AgentConfig::load()?;
    info!(
        node_name = %config.node_name,
        cgroup_root = %config.cgroup_root,
        workloads_file = %config.workloads_file,
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::SAMPLER).await;
    health_registry.register(components::WATCHERS).await;

    let metrics = AutoRangeMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);

    let runtime = Arc::new(CgroupV2Runtime::new(&config.cgroup_root));
    let sampler = Arc::new(CgroupV2Sampler::with_proc_path(
        &config.cgroup_root,
        &config.proc_root,
    ));
    let supervisor = Arc::new(Supervisor::new(runtime, config.watcher_settings()));

    let mut attached = HashSet::new();
    discover(&config, &supervisor, &mut attached);
    logger.log_startup(AGENT_VERSION, attached.len());

    let (shutdown_tx, _) = broadcast::channel(1);

    let sampling_loop = SamplingLoopBuilder::new()
        .sampler(sampler)
        .supervisor(supervisor.clone())
        .health(health_registry.clone())
        .interval(config.tick_interval())
        .jitter(Duration::from_millis(config.sampling_jitter_ms))
        .build()?;
    let sampling_handle = tokio::spawn(sampling_loop.run(shutdown_tx.subscribe()));

    let discovery_handle = tokio::spawn(run_discovery(
        config.clone(),
        supervisor.clone(),
        health_registry.clone(),
        attached,
        shutdown_tx.subscribe(),
    ));

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics,
        supervisor,
    ));

    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            logger.log_shutdown("SIGINT received");
        }
        result = api_handle => {
            match result {
                Ok(Err(e)) => warn!(error = %e, "API server stopped"),
                Err(e) => warn!(error = %e, "API server task failed"),
                Ok(Ok(())) => {}
            }
            logger.log_shutdown("API server stopped");
        }
    }

    let _ = shutdown_tx.send(());
    let _ = sampling_handle.await;
    let _ = discovery_handle.await;
    info!("Shutdown complete");

    Ok(())
}

/// Re-read the workloads file periodically until shutdown
async fn run_discovery(
    config: config::AgentConfig,
    supervisor: Arc<Supervisor>,
    health: HealthRegistry,
    mut attached: HashSet<String>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let period = Duration::from_secs(config.discovery_interval_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    // First tick fires immediately and startup already attached everything
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Judge watchers before rediscovery respawns the ones that failed
                let watchers = ComponentHealth::from_watchers(&supervisor.summaries());
                let status = if discover(&config, &supervisor, &mut attached) {
                    watchers
                } else {
                    ComponentHealth::degraded("Workloads file could not be loaded")
                };
                health.update(components::WATCHERS, status).await;
                info!(
                    active = supervisor.active_count(),
                    learning = supervisor.learning_count(),
                    "Workload discovery complete"
                );
            }
            _ = shutdown.recv() => {
                info!("Shutting down workload discovery");
                break;
            }
        }
    }
}

/// Attach every listed workload and pause those that disappeared from the list
fn discover(
    config: &config::AgentConfig,
    supervisor: &Arc<Supervisor>,
    attached: &mut HashSet<String>,
) -> bool {
    let specs = match config::load_workloads(&config.workloads_file) {
        Ok(specs) => specs,
        Err(e) => {
            warn!(error = %format!("{:#}", e), "Failed to load workloads");
            return false;
        }
    };

    let mut seen = HashSet::new();
    for spec in specs {
        let workload_id = spec.workload.id.clone();
        seen.insert(workload_id.clone());
        match supervisor.attach(spec) {
            Ok(AttachOutcome::AlreadyWatching)
            | Ok(AttachOutcome::AlreadyApplied)
            | Ok(AttachOutcome::HeldPaused) => {}
            Ok(outcome) => info!(workload_id = %workload_id, outcome = ?outcome, "Workload attached"),
            Err(e) => warn!(workload_id = %workload_id, error = %e, "Failed to attach workload"),
        }
    }

    for gone in attached.difference(&seen) {
        if supervisor.detach(gone) {
            info!(workload_id = %gone, "Workload no longer listed, watcher paused");
        }
    }
    *attached = seen;
    true
}
