//! List/watch access to one resource type.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchParams},
    core::{DynamicObject, TypeMeta, WatchEvent as KubeWatchEvent},
    Client,
};

use crate::ResourceType;

/// One page of a paginated list.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub items: Vec<DynamicObject>,
    /// Set while more pages remain.
    pub continue_token: Option<String>,
    pub resource_version: Option<String>,
}

/// Watch stream notification.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(DynamicObject),
    Modified(DynamicObject),
    Deleted(DynamicObject),
    Bookmark(String),
    Error(String),
}

/// Cluster API access for a single resource type.
#[async_trait]
pub trait ResourceSource: Send + Sync {
    async fn list_page(&self, limit: u32, continue_token: Option<String>) -> Result<ListPage>;

    /// Open a watch starting after `resource_version`.
    async fn watch<'a>(&'a self, resource_version: &'a str) -> Result<BoxStream<'a, Result<WatchEvent>>>;
}

/// [`ResourceSource`] backed by a dynamic kube `Api`.
pub struct KubeSource {
    api: Api<DynamicObject>,
    types: TypeMeta,
    watch_params: WatchParams,
}

impl KubeSource {
    pub fn new(client: Client, resource: &ResourceType) -> Self {
        let ar = resource.api_resource();
        let types = TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() };
        Self {
            api: Api::all_with(client, &ar),
            types,
            watch_params: WatchParams::default(),
        }
    }
}

/// List responses omit apiVersion/kind on items; fill them from the descriptor.
fn stamp(types: &TypeMeta, mut obj: DynamicObject) -> DynamicObject {
    if obj.types.as_ref().map_or(true, |t| t.kind.is_empty()) {
        obj.types = Some(types.clone());
    }
    obj
}

#[async_trait]
impl ResourceSource for KubeSource {
    async fn list_page(&self, limit: u32, continue_token: Option<String>) -> Result<ListPage> {
        let mut lp = ListParams::default().limit(limit);
        if let Some(token) = continue_token.as_deref() {
            lp = lp.continue_token(token);
        }
        let list = self
            .api
            .list(&lp)
            .await
            .with_context(|| format!("listing {}", self.types.kind))?;
        Ok(ListPage {
            items: list.items.into_iter().map(|o| stamp(&self.types, o)).collect(),
            continue_token: list.metadata.continue_.filter(|c| !c.is_empty()),
            resource_version: list.metadata.resource_version,
        })
    }

    async fn watch<'a>(&'a self, resource_version: &'a str) -> Result<BoxStream<'a, Result<WatchEvent>>> {
        let stream = self
            .api
            .watch(&self.watch_params, resource_version)
            .await
            .with_context(|| format!("opening watch for {}", self.types.kind))?;
        let types = &self.types;
        let mapped = stream.map(move |res| -> Result<WatchEvent> {
            let ev = res.context("reading watch stream")?;
            Ok(match ev {
                KubeWatchEvent::Added(o) => WatchEvent::Added(stamp(types, o)),
                KubeWatchEvent::Modified(o) => WatchEvent::Modified(stamp(types, o)),
                KubeWatchEvent::Deleted(o) => WatchEvent::Deleted(stamp(types, o)),
                KubeWatchEvent::Bookmark(b) => WatchEvent::Bookmark(b.metadata.resource_version),
                KubeWatchEvent::Error(e) => WatchEvent::Error(format!("{} ({}): {}", e.reason, e.code, e.message)),
            })
        });
        Ok(mapped.boxed())
    }
}
