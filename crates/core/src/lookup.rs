//! Lookup structure handed to edge functions.

use rustc_hash::FxHashMap;

use crate::{Edge, EdgeType, Node};

/// Namespace key used for cluster-scoped resources.
pub const NO_NAMESPACE: &str = "_NONE";

type ByName<'a> = FxHashMap<&'a str, &'a Node>;

/// Borrowed view over the current nodes, indexed by UID and by kind/namespace/name.
#[derive(Default)]
pub struct NodeStore<'a> {
    by_uid: FxHashMap<&'a str, &'a Node>,
    by_kind: FxHashMap<&'a str, FxHashMap<&'a str, ByName<'a>>>,
}

impl<'a> NodeStore<'a> {
    pub fn build<I>(nodes: I) -> Self
    where
        I: IntoIterator<Item = &'a Node>,
    {
        let mut store = NodeStore::default();
        for n in nodes {
            store.by_uid.insert(n.uid.as_str(), n);
            let ns = n.namespace().unwrap_or(NO_NAMESPACE);
            store
                .by_kind
                .entry(n.kind())
                .or_default()
                .entry(ns)
                .or_default()
                .insert(n.name(), n);
        }
        store
    }

    pub fn len(&self) -> usize { self.by_uid.len() }
    pub fn is_empty(&self) -> bool { self.by_uid.is_empty() }

    pub fn get(&self, uid: &str) -> Option<&'a Node> {
        self.by_uid.get(uid).copied()
    }

    /// Resolve by kind, namespace (`None` for cluster-scoped) and name.
    pub fn find(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<&'a Node> {
        self.by_kind
            .get(kind)?
            .get(namespace.unwrap_or(NO_NAMESPACE))?
            .get(name)
            .copied()
    }
}

/// Identity of the node an edge function belongs to.
///
/// Edge closures capture this instead of the node itself, so every edge is
/// resolved against whatever state exists when edges are computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeSource {
    pub uid: String,
    pub kind: String,
    pub namespace: Option<String>,
}

impl EdgeSource {
    pub fn of(node: &Node) -> Self {
        Self {
            uid: node.uid.clone(),
            kind: node.kind().to_string(),
            namespace: node.namespace().map(str::to_string),
        }
    }

    pub fn edge_to(&self, dest: &Node, edge_type: EdgeType) -> Edge {
        Edge {
            source_uid: self.uid.clone(),
            dest_uid: dest.uid.clone(),
            source_kind: self.kind.clone(),
            dest_kind: dest.kind().to_string(),
            edge_type,
        }
    }

    /// Edge to a node addressed by UID; `None` when it is not in the store.
    pub fn to_uid(&self, store: &NodeStore<'_>, dest_uid: &str, edge_type: EdgeType) -> Option<Edge> {
        store.get(dest_uid).map(|dest| self.edge_to(dest, edge_type))
    }

    /// Edge to a namespaced node living in the source's namespace.
    pub fn to_named(&self, store: &NodeStore<'_>, kind: &str, name: &str, edge_type: EdgeType) -> Option<Edge> {
        store
            .find(kind, self.namespace.as_deref(), name)
            .map(|dest| self.edge_to(dest, edge_type))
    }

    /// Edge to a cluster-scoped node.
    pub fn to_cluster_scoped(&self, store: &NodeStore<'_>, kind: &str, name: &str, edge_type: EdgeType) -> Option<Edge> {
        store.find(kind, None, name).map(|dest| self.edge_to(dest, edge_type))
    }
}
