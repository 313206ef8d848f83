//! gpuslice daemon
//!
//! Runs the slice controller together with emulated node agents against the
//! in-memory store.

use anyhow::{Context, Result};
use clap::Parser;
use gpuslice_agent::{EmulatedBackend, NodeAgent};
use gpuslice_core::{DaemonConfig, LabelConfig, LoggingConfig, Node, Profile, Workload};
use gpuslice_scheduler::{Controller, ControllerManager};
use gpuslice_store::{ClusterStore, MemoryStore, RetryPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Interval between capacity summaries
const CAPACITY_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// gpusliced - fractional GPU slice allocator
#[derive(Parser, Debug)]
#[command(name = "gpusliced")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (overrides the configuration file)
    #[arg(long)]
    log_level: Option<String>,

    /// Number of emulated nodes (overrides the configuration file)
    #[arg(long)]
    nodes: Option<u32>,

    /// JSON file of workloads to submit at startup
    #[arg(long)]
    seed: Option<PathBuf>,
}

/// A workload to submit, as the admission webhook would pass it on
#[derive(Debug, Deserialize)]
struct SeedWorkload {
    #[serde(default = "default_namespace")]
    namespace: String,
    name: String,
    profile: Profile,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl SeedWorkload {
    /// Build the gated, labelled workload the webhook would leave behind
    fn admit(&self, labels: &LabelConfig) -> Workload {
        Workload::admitted(self.namespace.clone(), self.name.clone(), self.profile, labels)
    }
}

fn load_config(args: &Args) -> Result<DaemonConfig> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(nodes) = args.nodes {
        config.emulator.nodes = nodes;
    }
    Ok(config)
}

fn load_seed(path: &Path) -> Result<Vec<SeedWorkload>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading seed file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing seed file {}", path.display()))
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("invalid log level")?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let file = match &logging.file {
        Some(path) => Some(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?,
        ),
        None => None,
    };

    let result = match (logging.format.as_str(), file) {
        ("json", Some(file)) => builder.json().with_writer(std::sync::Mutex::new(file)).try_init(),
        ("json", None) => builder.json().try_init(),
        (_, Some(file)) => builder.with_ansi(false).with_writer(std::sync::Mutex::new(file)).try_init(),
        (_, None) => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to set subscriber: {}", e))
}

async fn log_capacity(store: &dyn ClusterStore) {
    let ledgers = match store.list_ledgers().await {
        Ok(ledgers) => ledgers,
        Err(e) => {
            warn!(error = %e, "Failed to list ledgers for capacity report");
            return;
        }
    };
    for ledger in ledgers {
        let free: Vec<String> = ledger
            .resources
            .profiles
            .keys()
            .map(|p| format!("{}={}", p, ledger.free_windows(p)))
            .collect();
        info!(
            node = %ledger.name,
            allocations = ledger.results.len(),
            free = %free.join(","),
            "Capacity"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config.logging)?;

    info!("Starting gpuslice daemon v{}", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    // Emulated nodes, each with its own agent
    let interval = Duration::from_millis(config.emulator.agent_interval_ms);
    for i in 0..config.emulator.nodes {
        let name = format!("node-{}", i);
        let backend = Arc::new(EmulatedBackend::from_config(name.clone(), &config.emulator));

        let mut node = Node::new(name.clone(), backend.boot_id().await);
        node.labels
            .insert(config.labels.managed_label.clone(), "true".to_string());
        store.put_node(node).await;

        let agent = Arc::new(NodeAgent::new(
            name.clone(),
            store.clone(),
            backend,
            RetryPolicy::from_config(&config.retry),
        ));
        agent
            .publish()
            .await
            .with_context(|| format!("publishing resources of {}", name))?;
        tasks.spawn(agent.run(interval, cancel.clone()));
    }
    info!(
        nodes = config.emulator.nodes,
        gpus_per_node = config.emulator.gpus_per_node,
        model = %config.emulator.gpu_model,
        "Emulated nodes ready"
    );

    let controller = Arc::new(Controller::new(store.clone(), &config));
    let manager = ControllerManager::new(store.clone(), controller, config.controller.workers);

    if let Some(path) = &args.seed {
        for seed in load_seed(path)? {
            let workload = seed.admit(&config.labels);
            match store.create_workload(workload).await {
                Ok(w) => info!(workload = %w.key(), profile = %seed.profile, "Workload submitted"),
                Err(e) => warn!(workload = %seed.name, error = %e, "Failed to submit workload"),
            }
        }
    }

    {
        let store = store.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(CAPACITY_REPORT_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => log_capacity(store.as_ref()).await,
                }
            }
        });
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
            cancel.cancel();
        });
    }

    let outcome = manager.run(cancel.clone()).await;
    cancel.cancel();
    while tasks.join_next().await.is_some() {}

    outcome.context("controller manager failed")?;
    info!("gpuslice daemon stopped");
    Ok(())
}
