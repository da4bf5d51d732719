//! Kollect kubehub: discovery and per-resource-type watchers.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::{
    core::ApiResource,
    discovery::{self, verbs, Scope},
    Client,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

mod filter;
mod handler;
mod source;
mod supervisor;
mod watcher;

pub use filter::{FilterRule, ResourceFilter};
pub use handler::{ChannelHandler, ResourceHandler};
pub use source::{KubeSource, ListPage, ResourceSource, WatchEvent};
pub use supervisor::{ResourceDiscovery, SourceFactory, SyncSummary, WatchSupervisor};
pub use watcher::{backoff_delay, ResourceWatcher, WatcherConfig, WatcherHandle};

/// A watchable resource type (group/version/resource plus kind and scope).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceType {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceType {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            namespaced,
        }
    }

    pub fn from_api_resource(ar: &ApiResource, namespaced: bool) -> Self {
        Self::new(&ar.group, &ar.version, &ar.kind, &ar.plural, namespaced)
    }

    /// `group/version/resource`, or `version/resource` for the core group.
    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.plural)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.plural)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

/// Discover listable+watchable resources (incl. CRDs) that pass `filter`.
///
/// Groups are queried one at a time; a group that fails is logged and
/// skipped so a single broken aggregated API does not hide the rest.
pub async fn discover_watchable(client: &Client, filter: &ResourceFilter) -> Result<Vec<ResourceType>> {
    let mut groups = vec![String::new()];
    let listed = client.list_api_groups().await.context("listing API groups")?;
    groups.extend(listed.groups.into_iter().map(|g| g.name));

    let mut out = Vec::new();
    let mut failed = 0usize;
    for name in groups {
        let group = match discovery::group(client, &name).await {
            Ok(g) => g,
            Err(e) => {
                failed += 1;
                warn!(group = %name, error = %e, "discovery failed for group; skipping");
                continue;
            }
        };
        for (ar, caps) in group.recommended_resources() {
            if !caps.supports_operation(verbs::LIST) || !caps.supports_operation(verbs::WATCH) {
                continue;
            }
            if !filter.allows(&ar.group, &ar.plural) {
                debug!(group = %ar.group, resource = %ar.plural, "filtered out");
                continue;
            }
            out.push(ResourceType::from_api_resource(&ar, matches!(caps.scope, Scope::Namespaced)));
        }
    }
    out.sort();
    out.dedup_by(|a, b| a.key() == b.key());
    if failed > 0 {
        warn!(failed_groups = failed, discovered = out.len(), "using partial discovery result");
    }
    Ok(out)
}

/// [`ResourceDiscovery`] against a live cluster.
pub struct KubeDiscovery {
    client: Client,
    filter: ResourceFilter,
}

impl KubeDiscovery {
    pub fn new(client: Client, filter: ResourceFilter) -> Self { Self { client, filter } }
}

#[async_trait]
impl ResourceDiscovery for KubeDiscovery {
    async fn discover(&self) -> Result<Vec<ResourceType>> {
        discover_watchable(&self.client, &self.filter).await
    }
}

/// [`SourceFactory`] producing [`KubeSource`]s over a shared client.
pub struct KubeSourceFactory {
    client: Client,
}

impl KubeSourceFactory {
    pub fn new(client: Client) -> Self { Self { client } }
}

impl SourceFactory for KubeSourceFactory {
    fn source_for(&self, resource: &ResourceType) -> Arc<dyn ResourceSource> {
        Arc::new(KubeSource::new(self.client.clone(), resource))
    }
}
