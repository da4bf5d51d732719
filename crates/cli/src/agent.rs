//! Wiring of the collection stages: watchers -> transform workers -> reconciler.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kollect_kubehub::{ChannelHandler, KubeDiscovery, KubeSourceFactory, ResourceFilter, WatchSupervisor};
use kollect_store::{spawn_reconciler, Reconciler};
use kollect_transform::{EventPipeline, TransformContext, TransformRegistry};
use kube::Client;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Knobs shared by `run` and `snapshot`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cluster: String,
    pub init_timeout: Duration,
    pub purge_capacity: usize,
    pub workers: usize,
    pub queue_cap: usize,
    pub filter: ResourceFilter,
}

pub struct Agent {
    pub reconciler: Arc<Reconciler>,
    pub supervisor: WatchSupervisor,
    /// Transform workers and the reconciler consumer; they end once every watcher is gone.
    pub tasks: Vec<JoinHandle<()>>,
}

impl Agent {
    pub fn assemble(client: Client, settings: &Settings) -> Self {
        let (raw_tx, raw_rx) = mpsc::channel(settings.queue_cap);
        let (node_tx, node_rx) = mpsc::channel(settings.queue_cap);

        let registry = Arc::new(TransformRegistry::with_builtins());
        let mut tasks = EventPipeline::new(registry, TransformContext::new(settings.cluster.as_str()))
            .with_workers(settings.workers)
            .spawn(raw_rx, node_tx);

        let reconciler = Arc::new(Reconciler::new(settings.purge_capacity));
        tasks.push(spawn_reconciler(Arc::clone(&reconciler), node_rx));

        let supervisor = WatchSupervisor::new(
            Arc::new(KubeDiscovery::new(client.clone(), settings.filter.clone())),
            Arc::new(KubeSourceFactory::new(client)),
            Arc::new(ChannelHandler::new(raw_tx)),
        )
        .with_init_timeout(settings.init_timeout);

        info!(cluster = %settings.cluster, workers = settings.workers, queue_cap = settings.queue_cap, "agent assembled");
        Self { reconciler, supervisor, tasks }
    }
}

/// Wait for the pipeline tasks to finish draining, up to `limit`.
pub async fn drain(tasks: Vec<JoinHandle<()>>, limit: Duration) {
    if tokio::time::timeout(limit, join_all(tasks)).await.is_err() {
        warn!(limit_secs = limit.as_secs(), "pipeline did not drain in time");
    }
}

async fn join_all(tasks: Vec<JoinHandle<()>>) {
    for t in tasks {
        if let Err(e) = t.await {
            warn!(error = %e, "pipeline task failed");
        }
    }
}

/// Load allow/deny rules; no file means the default filter.
pub fn load_filter(path: Option<&Path>) -> Result<ResourceFilter> {
    let Some(path) = path else { return Ok(ResourceFilter::default()) };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading filter file {}", path.display()))?;
    let filter: ResourceFilter =
        serde_yaml::from_str(&text).with_context(|| format!("parsing filter file {}", path.display()))?;
    info!(path = %path.display(), allow = filter.allow.len(), deny = filter.deny.len(), "resource filter loaded");
    Ok(filter)
}
