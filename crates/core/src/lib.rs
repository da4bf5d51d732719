//! Kollect core types: the normalized graph model shared by every stage.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

mod lookup;

pub use lookup::{EdgeSource, NodeStore, NO_NAMESPACE};

/// Property bag sent downstream. Keys are lowercase property names.
pub type Properties = BTreeMap<String, serde_json::Value>;

/// Operation carried by raw and normalized events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// One watched resource (or a synthetic one) in normalized form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Node {
    /// `<cluster>/<metadata.uid>`; stable across updates.
    pub uid: String,
    pub properties: Properties,
    /// Edge-computation bookkeeping (owner UID and the like). Never sent downstream.
    #[serde(skip)]
    pub metadata: BTreeMap<String, String>,
}

impl Node {
    pub fn new(uid: impl Into<String>) -> Self {
        Self { uid: uid.into(), ..Default::default() }
    }

    /// Minimal node standing in for a deleted object.
    pub fn tombstone(uid: impl Into<String>, kind: &str) -> Self {
        let mut n = Self::new(uid);
        if !kind.is_empty() {
            n.properties.insert("kind".into(), serde_json::Value::String(kind.to_string()));
        }
        n
    }

    fn str_prop(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }

    pub fn kind(&self) -> &str { self.str_prop("kind").unwrap_or("") }
    pub fn name(&self) -> &str { self.str_prop("name").unwrap_or("") }
    pub fn namespace(&self) -> Option<&str> { self.str_prop("namespace").filter(|s| !s.is_empty()) }

    pub fn with_property(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }
}

/// Relationship kinds understood by the aggregator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum EdgeType {
    OwnedBy,
    AttachedTo,
    Uses,
    RunsOn,
    PromotedTo,
    RefersTo,
    Violates,
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EdgeType::OwnedBy => "ownedBy",
            EdgeType::AttachedTo => "attachedTo",
            EdgeType::Uses => "uses",
            EdgeType::RunsOn => "runsOn",
            EdgeType::PromotedTo => "promotedTo",
            EdgeType::RefersTo => "refersTo",
            EdgeType::Violates => "violates",
        };
        f.write_str(s)
    }
}

/// Directed, typed relationship between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    #[serde(rename = "sourceUID")]
    pub source_uid: String,
    #[serde(rename = "destUID")]
    pub dest_uid: String,
    #[serde(rename = "sourceKind")]
    pub source_kind: String,
    #[serde(rename = "destKind")]
    pub dest_kind: String,
    #[serde(rename = "edgeType")]
    pub edge_type: EdgeType,
}

/// Edge computation bound to one node, evaluated against the current state.
pub type EdgeFn = Arc<dyn Fn(&NodeStore<'_>) -> Vec<Edge> + Send + Sync>;

/// Edge function for nodes without relationships.
pub fn no_edges() -> EdgeFn {
    Arc::new(|_: &NodeStore<'_>| Vec::new())
}

/// Raw watcher notification, before transformation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    /// Generation time in epoch milliseconds.
    pub time: i64,
    pub operation: Operation,
    /// Raw object (stripped of managedFields under the default feature)
    pub raw: serde_json::Value,
}

impl RawEvent {
    pub fn new(time: i64, operation: Operation, mut raw: serde_json::Value) -> Self {
        #[cfg(feature = "strip-managed-fields")]
        strip_managed_fields(&mut raw);
        Self { time, operation, raw }
    }

    pub fn kind(&self) -> &str {
        self.raw.get("kind").and_then(|v| v.as_str()).unwrap_or("")
    }

    /// API group parsed from `apiVersion`; empty for the core group.
    pub fn api_group(&self) -> &str {
        let api_version = self.raw.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
        match api_version.rsplit_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.raw
            .get("metadata")
            .and_then(|m| m.get("uid"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

#[cfg_attr(not(feature = "strip-managed-fields"), allow(dead_code))]
fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

/// Normalized event consumed by the reconciler.
#[derive(Clone)]
pub struct NodeEvent {
    /// Precedence timestamp (epoch milliseconds); not a delivery-order guarantee.
    pub time: i64,
    pub operation: Operation,
    pub node: Node,
    pub compute_edges: EdgeFn,
}

impl NodeEvent {
    pub fn new(time: i64, operation: Operation, node: Node, compute_edges: EdgeFn) -> Self {
        Self { time, operation, node, compute_edges }
    }

    pub fn uid(&self) -> &str { &self.node.uid }
}

impl fmt::Debug for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeEvent")
            .field("time", &self.time)
            .field("operation", &self.operation)
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

/// Failure inside a transform. Always recovered by dropping the event.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("malformed field {field}: {reason}")]
    Malformed { field: &'static str, reason: String },
    #[error("transform panicked: {0}")]
    Panicked(String),
}

/// Prefix a Kubernetes UID with the cluster identity.
pub fn prefixed_uid(cluster: &str, uid: &str) -> String {
    format!("{}/{}", cluster, uid)
}

pub mod prelude {
    pub use super::{
        no_edges, prefixed_uid, Edge, EdgeFn, EdgeSource, EdgeType, Node, NodeEvent, NodeStore,
        Operation, Properties, RawEvent, TransformError, NO_NAMESPACE,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn api_group_parses_core_and_named_groups() {
        let core = RawEvent::new(0, Operation::Create, json!({"apiVersion": "v1", "kind": "Pod"}));
        assert_eq!(core.api_group(), "");
        assert_eq!(core.kind(), "Pod");
        let apps = RawEvent::new(0, Operation::Create, json!({"apiVersion": "apps/v1", "kind": "Deployment"}));
        assert_eq!(apps.api_group(), "apps");
    }

    #[test]
    fn managed_fields_are_stripped() {
        let ev = RawEvent::new(
            0,
            Operation::Update,
            json!({"metadata": {"uid": "u1", "managedFields": [{"manager": "kubectl"}]}}),
        );
        assert!(ev.raw["metadata"].get("managedFields").is_none());
        assert_eq!(ev.uid(), Some("u1"));
    }

    #[test]
    fn metadata_is_not_serialized() {
        let mut n = Node::new("c/1").with_property("kind", "Pod");
        n.metadata.insert("OwnerUID".into(), "c/2".into());
        let v = serde_json::to_value(&n).unwrap();
        assert!(v.get("metadata").is_none());
        assert_eq!(v["properties"]["kind"], "Pod");
    }

    #[test]
    fn edge_serializes_with_aggregator_field_names() {
        let e = Edge {
            source_uid: "c/a".into(),
            dest_uid: "c/b".into(),
            source_kind: "Pod".into(),
            dest_kind: "Node".into(),
            edge_type: EdgeType::RunsOn,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["sourceUID"], "c/a");
        assert_eq!(v["edgeType"], "runsOn");
    }
}
