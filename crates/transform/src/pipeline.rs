//! Worker pool turning raw watcher events into node events.

use std::any::Any;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use kollect_core::{no_edges, prefixed_uid, Node, NodeEvent, Operation, RawEvent, TransformError};
use metrics::counter;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{TransformContext, TransformRegistry};

/// One worker per available core.
pub fn default_workers() -> usize {
    std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1)
}

#[derive(Debug, Clone)]
pub struct EventPipeline {
    registry: Arc<TransformRegistry>,
    ctx: TransformContext,
    workers: usize,
}

impl EventPipeline {
    pub fn new(registry: Arc<TransformRegistry>, ctx: TransformContext) -> Self {
        Self { registry, ctx, workers: default_workers() }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Normalize one event. `None` means it was dropped.
    pub fn process(&self, ev: RawEvent) -> Option<NodeEvent> {
        if ev.operation == Operation::Delete {
            let Some(uid) = ev.uid() else {
                debug!(kind = ev.kind(), "delete without uid; dropped");
                counter!("kollect_transform_dropped_total", 1u64);
                return None;
            };
            let node = Node::tombstone(prefixed_uid(&self.ctx.cluster, uid), ev.kind());
            return Some(NodeEvent::new(ev.time, ev.operation, node, no_edges()));
        }

        let transform = self.registry.resolve(ev.api_group(), ev.kind());
        let result = catch_unwind(AssertUnwindSafe(|| transform.transform(&self.ctx, &ev.raw)))
            .unwrap_or_else(|payload| Err(TransformError::Panicked(panic_message(payload.as_ref()))));
        match result {
            Ok(out) => Some(NodeEvent::new(ev.time, ev.operation, out.node, out.edges)),
            Err(e) => {
                warn!(kind = ev.kind(), group = ev.api_group(), uid = ev.uid().unwrap_or(""), error = %e, "transform failed; event dropped");
                counter!("kollect_transform_dropped_total", 1u64);
                None
            }
        }
    }

    /// Start the workers. They share `input` and stop once it closes or
    /// `output` has no receiver.
    pub fn spawn(self, input: mpsc::Receiver<RawEvent>, output: mpsc::Sender<NodeEvent>) -> Vec<JoinHandle<()>> {
        let input = Arc::new(Mutex::new(input));
        let pipeline = Arc::new(self);
        info!(workers = pipeline.workers, "starting transform workers");
        (0..pipeline.workers)
            .map(|id| {
                let input = Arc::clone(&input);
                let output = output.clone();
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move {
                    loop {
                        let next = input.lock().await.recv().await;
                        let Some(ev) = next else { break };
                        let Some(out) = pipeline.process(ev) else { continue };
                        if output.send(out).await.is_err() {
                            debug!(worker = id, "node event receiver closed");
                            break;
                        }
                    }
                    debug!(worker = id, "transform worker stopped");
                })
            })
            .collect()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
