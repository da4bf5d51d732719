//! Keeps one running watcher per served resource type.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::handler::ResourceHandler;
use crate::source::ResourceSource;
use crate::watcher::{ResourceWatcher, WatcherConfig, WatcherHandle};
use crate::ResourceType;

/// Produces the set of resource types that should be watched right now.
#[async_trait]
pub trait ResourceDiscovery: Send + Sync {
    async fn discover(&self) -> Result<Vec<ResourceType>>;
}

/// Builds the API access used by a new watcher.
pub trait SourceFactory: Send + Sync {
    fn source_for(&self, resource: &ResourceType) -> Arc<dyn ResourceSource>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub kept: usize,
}

pub struct WatchSupervisor {
    discovery: Arc<dyn ResourceDiscovery>,
    sources: Arc<dyn SourceFactory>,
    handler: Arc<dyn ResourceHandler>,
    config: WatcherConfig,
    init_timeout: Duration,
    root: CancellationToken,
    running: BTreeMap<String, WatcherHandle>,
}

impl WatchSupervisor {
    pub fn new(
        discovery: Arc<dyn ResourceDiscovery>,
        sources: Arc<dyn SourceFactory>,
        handler: Arc<dyn ResourceHandler>,
    ) -> Self {
        Self {
            discovery,
            sources,
            handler,
            config: WatcherConfig::default(),
            init_timeout: Duration::from_secs(10),
            root: CancellationToken::new(),
            running: BTreeMap::new(),
        }
    }

    pub fn with_watcher_config(mut self, config: WatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Resource types with a running watcher, ordered by key.
    pub fn running(&self) -> Vec<ResourceType> {
        self.running.values().map(|h| h.resource().clone()).collect()
    }

    pub fn handle(&self, key: &str) -> Option<&WatcherHandle> {
        self.running.get(key)
    }

    /// Reconcile running watchers with discovery. New watchers start one at a
    /// time, each waiting for its initial list so full lists don't pile up.
    pub async fn sync_watchers(&mut self) -> Result<SyncSummary> {
        let discovered = self.discovery.discover().await?;
        let mut wanted: BTreeMap<String, ResourceType> =
            discovered.into_iter().map(|r| (r.key(), r)).collect();
        let mut summary = SyncSummary::default();

        let keys: Vec<String> = self.running.keys().cloned().collect();
        for key in keys {
            if wanted.remove(&key).is_some() {
                summary.kept += 1;
                continue;
            }
            if let Some(handle) = self.running.remove(&key) {
                handle.stop();
                info!(gvr = %key, "resource type no longer served; watcher stopped");
                summary.stopped.push(key);
            }
        }

        for (key, resource) in wanted {
            let source = self.sources.source_for(&resource);
            let handle = ResourceWatcher::new(resource, source, Arc::clone(&self.handler))
                .with_config(self.config.clone())
                .spawn(self.root.child_token());
            if !handle.wait_until_initialized(self.init_timeout).await {
                warn!(gvr = %key, timeout_ms = self.init_timeout.as_millis() as u64, "initial list not complete; moving on");
            }
            self.running.insert(key.clone(), handle);
            summary.started.push(key);
        }

        metrics::gauge!("kollect_watchers", self.running.len() as f64);
        Ok(summary)
    }

    /// Sync now and then every `interval` until `shutdown` fires; stops all watchers on exit.
    pub async fn run(mut self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let res = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = self.sync_watchers() => res,
            };
            match res {
                Ok(s) if !s.started.is_empty() || !s.stopped.is_empty() => {
                    info!(started = s.started.len(), stopped = s.stopped.len(), kept = s.kept, "watchers synced");
                }
                Ok(_) => {}
                Err(e) => warn!(error = ?e, "resource discovery failed; keeping current watchers"),
            }
        }
        self.shutdown();
    }

    /// Stop every watcher.
    pub fn shutdown(&mut self) {
        self.root.cancel();
        let n = self.running.len();
        self.running.clear();
        metrics::gauge!("kollect_watchers", 0.0);
        info!(watchers = n, "watch supervisor shut down");
    }
}

impl Drop for WatchSupervisor {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
