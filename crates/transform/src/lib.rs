//! Kollect transforms: raw Kubernetes objects to graph nodes plus edge rules.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use kollect_core::{EdgeFn, Node, TransformError};
use rustc_hash::FxHashMap;
use serde_json::Value;

mod builtin;
mod common;
mod edges;
mod pipeline;

pub use common::{common, generic, OWNER_UID};
pub use edges::EdgeRules;
pub use pipeline::{default_workers, EventPipeline};

/// Inputs every transform sees besides the object itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformContext {
    /// Prefix for node UIDs.
    pub cluster: String,
}

impl TransformContext {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self { cluster: cluster.into() }
    }
}

/// A node plus the closure computing its outgoing edges.
pub struct TransformOutput {
    pub node: Node,
    pub edges: EdgeFn,
}

impl fmt::Debug for TransformOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformOutput").field("node", &self.node).finish_non_exhaustive()
    }
}

/// Maps one raw object to its normalized form. Must not block.
pub trait Transform: Send + Sync {
    fn transform(&self, ctx: &TransformContext, raw: &Value) -> Result<TransformOutput, TransformError>;
}

impl<F> Transform for F
where
    F: Fn(&TransformContext, &Value) -> Result<TransformOutput, TransformError> + Send + Sync,
{
    fn transform(&self, ctx: &TransformContext, raw: &Value) -> Result<TransformOutput, TransformError> {
        self(ctx, raw)
    }
}

/// Immutable (API group, kind) -> transform table with a generic fallback.
pub struct TransformRegistry {
    by_group: FxHashMap<String, FxHashMap<String, Arc<dyn Transform>>>,
    fallback: Arc<dyn Transform>,
}

impl TransformRegistry {
    pub fn builder() -> TransformRegistryBuilder {
        TransformRegistryBuilder::default()
    }

    /// Registry holding every built-in transform.
    pub fn with_builtins() -> Self {
        builtin::register(Self::builder()).build()
    }

    /// Dedicated transform for the kind, if any.
    pub fn lookup(&self, group: &str, kind: &str) -> Option<&dyn Transform> {
        self.by_group.get(group)?.get(kind).map(|t| t.as_ref())
    }

    /// Dedicated transform, else the fallback.
    pub fn resolve(&self, group: &str, kind: &str) -> &dyn Transform {
        self.lookup(group, kind).unwrap_or(self.fallback.as_ref())
    }

    /// Number of dedicated transforms.
    pub fn len(&self) -> usize {
        self.by_group.values().map(|kinds| kinds.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformRegistry").field("transforms", &self.len()).finish_non_exhaustive()
    }
}

pub struct TransformRegistryBuilder {
    by_group: FxHashMap<String, FxHashMap<String, Arc<dyn Transform>>>,
    fallback: Arc<dyn Transform>,
}

impl Default for TransformRegistryBuilder {
    fn default() -> Self {
        Self { by_group: FxHashMap::default(), fallback: Arc::new(generic) }
    }
}

impl TransformRegistryBuilder {
    /// Register `transform` for `kind` in API `group` ("" for core). Later
    /// registrations replace earlier ones.
    pub fn register<T>(mut self, kind: &str, group: &str, transform: T) -> Self
    where
        T: Transform + 'static,
    {
        self.by_group
            .entry(group.to_string())
            .or_default()
            .insert(kind.to_string(), Arc::new(transform));
        self
    }

    pub fn fallback<T>(mut self, transform: T) -> Self
    where
        T: Transform + 'static,
    {
        self.fallback = Arc::new(transform);
        self
    }

    pub fn build(self) -> TransformRegistry {
        TransformRegistry { by_group: self.by_group, fallback: self.fallback }
    }
}
