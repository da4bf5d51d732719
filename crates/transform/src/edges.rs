//! Declarative edge rules compiled into an [`EdgeFn`].

use std::sync::Arc;

use kollect_core::{Edge, EdgeFn, EdgeSource, EdgeType, Node, NodeStore};

#[derive(Debug, Clone)]
enum Target {
    Uid(String),
    /// Same namespace as the source.
    Named { kind: &'static str, name: String },
    ClusterScoped { kind: &'static str, name: String },
}

/// Relationships of one node, resolved lazily against the current state.
#[derive(Debug, Clone)]
pub struct EdgeRules {
    source: EdgeSource,
    rules: Vec<(Target, EdgeType)>,
}

impl EdgeRules {
    pub fn for_node(node: &Node) -> Self {
        Self { source: EdgeSource::of(node), rules: Vec::new() }
    }

    pub fn to_uid(&mut self, uid: impl Into<String>, edge_type: EdgeType) -> &mut Self {
        self.rules.push((Target::Uid(uid.into()), edge_type));
        self
    }

    pub fn to_named(&mut self, kind: &'static str, name: impl Into<String>, edge_type: EdgeType) -> &mut Self {
        self.rules.push((Target::Named { kind, name: name.into() }, edge_type));
        self
    }

    pub fn to_cluster_scoped(&mut self, kind: &'static str, name: impl Into<String>, edge_type: EdgeType) -> &mut Self {
        self.rules.push((Target::ClusterScoped { kind, name: name.into() }, edge_type));
        self
    }

    pub fn len(&self) -> usize { self.rules.len() }
    pub fn is_empty(&self) -> bool { self.rules.is_empty() }

    pub fn resolve(&self, store: &NodeStore<'_>) -> Vec<Edge> {
        self.rules
            .iter()
            .filter_map(|(target, ty)| match target {
                Target::Uid(uid) => self.source.to_uid(store, uid, *ty),
                Target::Named { kind, name } => self.source.to_named(store, kind, name, *ty),
                Target::ClusterScoped { kind, name } => self.source.to_cluster_scoped(store, kind, name, *ty),
            })
            // no self-loops
            .filter(|e| e.source_uid != e.dest_uid)
            .collect()
    }

    pub fn into_fn(self) -> EdgeFn {
        Arc::new(move |store: &NodeStore<'_>| self.resolve(store))
    }
}
