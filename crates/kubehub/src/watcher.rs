//! Per-resource-type list+watch loop with resync and backoff.
//!
//! Each watcher keeps an index of `uid -> resourceVersion` for the objects it
//! has reported. Every (re)list rebuilds that index and reports objects that
//! vanished in between as deletions, so missed watch events heal on the next
//! relist.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use kube::core::{DynamicObject, ObjectMeta, TypeMeta};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handler::ResourceHandler;
use crate::source::{ResourceSource, WatchEvent};
use crate::ResourceType;

type ResourceIndex = FxHashMap<String, String>;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub page_size: u32,
    pub backoff_step: Duration,
    pub backoff_max: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            page_size: 250,
            backoff_step: Duration::from_secs(2),
            backoff_max: Duration::from_secs(120),
        }
    }
}

/// Delay before the next list attempt: `min(retries * step, max)`.
pub fn backoff_delay(config: &WatcherConfig, retries: u32) -> Duration {
    config.backoff_step.saturating_mul(retries).min(config.backoff_max)
}

enum WatchEnd {
    Stopped,
    /// Server closed the stream.
    Expired,
    Failed(String),
}

pub struct ResourceWatcher {
    resource: ResourceType,
    source: Arc<dyn ResourceSource>,
    handler: Arc<dyn ResourceHandler>,
    config: WatcherConfig,
    index: Arc<Mutex<ResourceIndex>>,
    initialized: watch::Sender<bool>,
    retries: u32,
}

fn lock(index: &Mutex<ResourceIndex>) -> MutexGuard<'_, ResourceIndex> {
    index.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ResourceWatcher {
    pub fn new(resource: ResourceType, source: Arc<dyn ResourceSource>, handler: Arc<dyn ResourceHandler>) -> Self {
        let (initialized, _) = watch::channel(false);
        Self {
            resource,
            source,
            handler,
            config: WatcherConfig::default(),
            index: Arc::new(Mutex::new(ResourceIndex::default())),
            initialized,
            retries: 0,
        }
    }

    pub fn with_config(mut self, config: WatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Run on its own task until `token` is cancelled.
    pub fn spawn(self, token: CancellationToken) -> WatcherHandle {
        let resource = self.resource.clone();
        let initialized = self.initialized.subscribe();
        let index = Arc::clone(&self.index);
        let task = tokio::spawn(self.run(token.clone()));
        WatcherHandle { resource, token, initialized, index, task }
    }

    pub async fn run(mut self, token: CancellationToken) {
        let key = self.resource.key();
        info!(gvr = %key, "watcher started");
        loop {
            if token.is_cancelled() {
                break;
            }
            let delay = backoff_delay(&self.config, self.retries);
            if !delay.is_zero() {
                debug!(gvr = %key, retries = self.retries, delay_ms = delay.as_millis() as u64, "backing off before relist");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let listed = tokio::select! {
                _ = token.cancelled() => break,
                res = self.list_and_resync() => res,
            };
            let resource_version = match listed {
                Ok(rv) => rv,
                Err(e) => {
                    self.retries += 1;
                    warn!(gvr = %key, retries = self.retries, error = ?e, "list failed");
                    continue;
                }
            };
            self.initialized.send_replace(true);

            match self.watch(&resource_version, &token).await {
                WatchEnd::Stopped => break,
                WatchEnd::Expired => debug!(gvr = %key, "watch stream closed by server; relisting"),
                WatchEnd::Failed(reason) => {
                    self.retries += 1;
                    warn!(gvr = %key, retries = self.retries, reason = %reason, "watch failed; relisting");
                }
            }
            metrics::counter!("kollect_watch_restarts_total", 1u64);
        }
        info!(gvr = %key, "watcher stopped");
    }

    /// Paginated list reporting every object as added, then deletions for
    /// objects indexed before but absent now. Returns the list resourceVersion.
    async fn list_and_resync(&mut self) -> Result<String> {
        let key = self.resource.key();
        let mut fresh = ResourceIndex::default();
        let mut continue_token: Option<String> = None;
        let mut resource_version = String::new();
        let mut pages = 0u32;
        loop {
            let page = self
                .source
                .list_page(self.config.page_size, continue_token.take())
                .await
                .with_context(|| format!("listing {} (page {})", key, pages + 1))?;
            pages += 1;
            if let Some(rv) = page.resource_version {
                resource_version = rv;
            }
            for obj in page.items {
                let Some(uid) = obj.metadata.uid.clone() else {
                    warn!(gvr = %key, name = ?obj.metadata.name, "listed object without uid; skipping");
                    continue;
                };
                self.handler.on_add(&obj).await;
                fresh.insert(uid, obj.metadata.resource_version.clone().unwrap_or_default());
            }
            match page.continue_token {
                Some(token) if !token.is_empty() => continue_token = Some(token),
                _ => break,
            }
        }

        let vanished: Vec<String> = {
            let index = lock(&self.index);
            index.keys().filter(|uid| !fresh.contains_key(*uid)).cloned().collect()
        };
        for uid in &vanished {
            self.handler.on_delete(&self.tombstone(uid)).await;
        }
        let items = fresh.len();
        *lock(&self.index) = fresh;
        info!(gvr = %key, items, pages, deleted = vanished.len(), "list and resync complete");
        Ok(resource_version)
    }

    async fn watch(&mut self, resource_version: &str, token: &CancellationToken) -> WatchEnd {
        let source = Arc::clone(&self.source);
        let opened = tokio::select! {
            _ = token.cancelled() => return WatchEnd::Stopped,
            res = source.watch(resource_version) => res,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) => return WatchEnd::Failed(format!("{:#}", e)),
        };
        self.retries = 0;

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return WatchEnd::Stopped,
                next = stream.next() => next,
            };
            let ev = match next {
                None => return WatchEnd::Expired,
                Some(Err(e)) => return WatchEnd::Failed(format!("{:#}", e)),
                Some(Ok(ev)) => ev,
            };
            match ev {
                WatchEvent::Added(obj) => {
                    metrics::counter!("kollect_watch_events_total", 1u64, "event" => "added");
                    if self.is_duplicate(&obj) {
                        continue;
                    }
                    self.handler.on_add(&obj).await;
                    self.record(&obj);
                }
                WatchEvent::Modified(obj) => {
                    metrics::counter!("kollect_watch_events_total", 1u64, "event" => "modified");
                    if self.is_duplicate(&obj) {
                        continue;
                    }
                    let previous = obj.metadata.uid.as_deref().and_then(|uid| lock(&self.index).get(uid).cloned());
                    self.handler.on_update(previous.as_deref(), &obj).await;
                    self.record(&obj);
                }
                WatchEvent::Deleted(obj) => {
                    metrics::counter!("kollect_watch_events_total", 1u64, "event" => "deleted");
                    self.handler.on_delete(&obj).await;
                    if let Some(uid) = obj.metadata.uid.as_deref() {
                        lock(&self.index).remove(uid);
                    }
                }
                WatchEvent::Bookmark(rv) => debug!(gvr = %self.resource.key(), rv = %rv, "bookmark"),
                WatchEvent::Error(reason) => return WatchEnd::Failed(reason),
            }
        }
    }

    /// Same object at the same resourceVersion as already indexed.
    fn is_duplicate(&self, obj: &DynamicObject) -> bool {
        match (obj.metadata.uid.as_deref(), obj.metadata.resource_version.as_deref()) {
            (Some(uid), Some(rv)) => lock(&self.index).get(uid).map(String::as_str) == Some(rv),
            _ => false,
        }
    }

    fn record(&self, obj: &DynamicObject) {
        if let Some(uid) = obj.metadata.uid.clone() {
            lock(&self.index).insert(uid, obj.metadata.resource_version.clone().unwrap_or_default());
        }
    }

    /// Minimal object carrying only kind and uid.
    fn tombstone(&self, uid: &str) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta { api_version: self.resource.api_version(), kind: self.resource.kind.clone() }),
            metadata: ObjectMeta { uid: Some(uid.to_string()), ..Default::default() },
            data: serde_json::json!({}),
        }
    }
}

/// Owner-side view of a running watcher.
pub struct WatcherHandle {
    resource: ResourceType,
    token: CancellationToken,
    initialized: watch::Receiver<bool>,
    index: Arc<Mutex<ResourceIndex>>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn resource(&self) -> &ResourceType { &self.resource }

    /// Wait for the first list+resync; `false` on timeout or if the watcher exited first.
    pub async fn wait_until_initialized(&self, timeout: Duration) -> bool {
        let mut rx = self.initialized.clone();
        let done = match tokio::time::timeout(timeout, rx.wait_for(|done| *done)).await {
            Ok(res) => res.is_ok(),
            Err(_) => false,
        };
        done
    }

    pub fn is_initialized(&self) -> bool { *self.initialized.borrow() }

    /// Number of objects currently indexed.
    pub fn indexed(&self) -> usize { lock(&self.index).len() }

    /// Signal the watcher to stop. Does not wait for an in-flight API call.
    pub fn stop(&self) { self.token.cancel(); }

    pub fn is_stopped(&self) -> bool { self.token.is_cancelled() }

    pub fn is_finished(&self) -> bool { self.task.is_finished() }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(gvr = %self.resource.key(), error = %e, "watcher task panicked");
        }
    }
}
