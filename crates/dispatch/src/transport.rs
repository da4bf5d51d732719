//! Delivery of sync payloads.

use async_trait::async_trait;
use tracing::info;

use crate::{DispatchError, SyncAck, SyncPayload};

/// Sends one payload to the aggregator and returns its resulting totals.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, payload: &SyncPayload) -> Result<SyncAck, DispatchError>;
}

/// Logs each payload instead of sending it; acknowledges with the payload totals.
#[derive(Debug, Clone, Default)]
pub struct LogTransport {
    print_payloads: bool,
}

impl LogTransport {
    pub fn new(print_payloads: bool) -> Self {
        Self { print_payloads }
    }
}

#[async_trait]
impl Transport for LogTransport {
    async fn send(&self, payload: &SyncPayload) -> Result<SyncAck, DispatchError> {
        info!(
            kind = payload.kind(),
            add = payload.add_resources.len(),
            update = payload.update_resources.len(),
            delete = payload.delete_resources.len(),
            add_edges = payload.add_edges.len(),
            delete_edges = payload.delete_edges.len(),
            total_resources = payload.total_resources,
            total_edges = payload.total_edges,
            "sync payload"
        );
        if self.print_payloads {
            let body = serde_json::to_string(payload)?;
            info!(payload = %body, "sync payload body");
        }
        Ok(payload.expected_ack())
    }
}
