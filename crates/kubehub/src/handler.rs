//! Callbacks invoked by resource watchers.

use async_trait::async_trait;
use kollect_core::{Operation, RawEvent};
use kube::core::DynamicObject;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Add/update/delete notifications from a watcher. Shared by every watcher,
/// so implementations must tolerate concurrent calls.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn on_add(&self, obj: &DynamicObject);
    /// `previous_version` is the resourceVersion last indexed for the object.
    async fn on_update(&self, previous_version: Option<&str>, obj: &DynamicObject);
    async fn on_delete(&self, obj: &DynamicObject);
}

/// Forwards notifications as time-stamped [`RawEvent`]s into the transform pipeline.
#[derive(Clone)]
pub struct ChannelHandler {
    tx: mpsc::Sender<RawEvent>,
}

impl ChannelHandler {
    pub fn new(tx: mpsc::Sender<RawEvent>) -> Self { Self { tx } }

    async fn forward(&self, operation: Operation, obj: &DynamicObject) {
        let raw = match serde_json::to_value(obj) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, name = ?obj.metadata.name, "cannot serialize object; dropping event");
                return;
            }
        };
        let ev = RawEvent::new(chrono::Utc::now().timestamp_millis(), operation, raw);
        if self.tx.send(ev).await.is_err() {
            debug!("raw event channel closed; dropping event");
        }
    }
}

#[async_trait]
impl ResourceHandler for ChannelHandler {
    async fn on_add(&self, obj: &DynamicObject) {
        self.forward(Operation::Create, obj).await;
    }

    async fn on_update(&self, _previous_version: Option<&str>, obj: &DynamicObject) {
        self.forward(Operation::Update, obj).await;
    }

    async fn on_delete(&self, obj: &DynamicObject) {
        self.forward(Operation::Delete, obj).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{ApiResource, GroupVersionKind};

    #[tokio::test]
    async fn forwards_typed_raw_events() {
        let (tx, mut rx) = mpsc::channel(4);
        let handler = ChannelHandler::new(tx);
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("apps", "v1", "Deployment"));
        let mut obj = DynamicObject::new("web", &ar).within("shop");
        obj.metadata.uid = Some("u-1".into());
        obj.data = serde_json::json!({});

        handler.on_add(&obj).await;
        handler.on_delete(&obj).await;

        let added = rx.recv().await.unwrap();
        assert_eq!(added.operation, Operation::Create);
        assert_eq!(added.kind(), "Deployment");
        assert_eq!(added.api_group(), "apps");
        assert_eq!(added.uid(), Some("u-1"));
        assert!(added.time > 0);
        let deleted = rx.recv().await.unwrap();
        assert_eq!(deleted.operation, Operation::Delete);
    }
}
