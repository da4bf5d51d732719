//! Wire format exchanged with the aggregator.

use kollect_core::{Edge, Node};
use kollect_store::{CompleteReport, DiffReport};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRef {
    pub uid: String,
}

/// One sync message. `clear_all` marks a complete snapshot that replaces
/// everything the aggregator holds for this cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    pub clear_all: bool,
    #[serde(default)]
    pub add_resources: Vec<Node>,
    #[serde(default)]
    pub update_resources: Vec<Node>,
    #[serde(default)]
    pub delete_resources: Vec<DeleteRef>,
    #[serde(default)]
    pub add_edges: Vec<Edge>,
    #[serde(default)]
    pub delete_edges: Vec<Edge>,
    pub total_resources: usize,
    pub total_edges: usize,
}

impl SyncPayload {
    /// Totals the aggregator must report back.
    pub fn expected_ack(&self) -> SyncAck {
        SyncAck { total_resources: self.total_resources, total_edges: self.total_edges }
    }

    pub fn kind(&self) -> &'static str {
        if self.clear_all { "complete" } else { "diff" }
    }
}

impl From<DiffReport> for SyncPayload {
    fn from(d: DiffReport) -> Self {
        Self {
            clear_all: false,
            add_resources: d.added_nodes,
            update_resources: d.updated_nodes,
            delete_resources: d.deleted_uids.into_iter().map(|uid| DeleteRef { uid }).collect(),
            add_edges: d.added_edges,
            delete_edges: d.deleted_edges,
            total_resources: d.total_nodes,
            total_edges: d.total_edges,
        }
    }
}

impl From<CompleteReport> for SyncPayload {
    fn from(c: CompleteReport) -> Self {
        Self {
            clear_all: true,
            add_resources: c.nodes,
            add_edges: c.edges,
            total_resources: c.total_nodes,
            total_edges: c.total_edges,
            ..Default::default()
        }
    }
}

/// Aggregator's totals after applying a payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAck {
    pub total_resources: usize,
    pub total_edges: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kollect_core::EdgeType;
    use serde_json::json;

    #[test]
    fn diff_payload_wire_shape() {
        let report = DiffReport {
            added_nodes: vec![Node::new("c/a").with_property("kind", "Pod")],
            deleted_uids: vec!["c/gone".into()],
            added_edges: vec![Edge {
                source_uid: "c/a".into(),
                dest_uid: "c/n".into(),
                source_kind: "Pod".into(),
                dest_kind: "Node".into(),
                edge_type: EdgeType::RunsOn,
            }],
            total_nodes: 2,
            total_edges: 1,
            ..Default::default()
        };
        let v = serde_json::to_value(SyncPayload::from(report)).unwrap();
        assert_eq!(v["clearAll"], false);
        assert_eq!(v["addResources"][0]["uid"], "c/a");
        assert_eq!(v["addResources"][0]["properties"]["kind"], "Pod");
        assert_eq!(v["deleteResources"], json!([{"uid": "c/gone"}]));
        assert_eq!(v["addEdges"][0]["sourceUID"], "c/a");
        assert_eq!(v["addEdges"][0]["edgeType"], "runsOn");
        assert_eq!(v["totalResources"], 2);
        assert_eq!(v["totalEdges"], 1);
    }

    #[test]
    fn complete_payload_clears() {
        let report = CompleteReport { nodes: vec![Node::new("c/a")], edges: vec![], total_nodes: 1, total_edges: 0 };
        let p = SyncPayload::from(report);
        assert!(p.clear_all);
        assert_eq!(p.kind(), "complete");
        assert!(p.update_resources.is_empty() && p.delete_resources.is_empty());
        assert_eq!(p.expected_ack(), SyncAck { total_resources: 1, total_edges: 0 });
    }

    #[test]
    fn ack_from_json() {
        let ack: SyncAck = serde_json::from_str(r#"{"totalResources": 3, "totalEdges": 4}"#).unwrap();
        assert_eq!(ack, SyncAck { total_resources: 3, total_edges: 4 });
    }
}
