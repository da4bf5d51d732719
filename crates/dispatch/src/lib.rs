//! Kollect dispatch: periodic sync of the reconciled graph to an aggregator.
//!
//! The first send, and the first one after any failure, is a complete
//! snapshot; everything else is a diff against the last sync point.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kollect_store::Reconciler;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod payload;
mod transport;

pub use payload::{DeleteRef, SyncAck, SyncPayload};
pub use transport::{LogTransport, Transport};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("aggregator rejected payload: {0}")]
    Rejected(String),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("totals mismatch: sent {expected:?}, aggregator has {actual:?}")]
    TotalsMismatch { expected: SyncAck, actual: SyncAck },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Delay between successful syncs.
    pub report_interval: Duration,
    /// Delay after a failed sync.
    pub retry_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { report_interval: Duration::from_secs(5), retry_interval: Duration::from_secs(10) }
    }
}

/// Result of one successful sync round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Complete,
    Diff,
    /// Nothing changed; nothing sent.
    Skipped,
}

impl SyncOutcome {
    fn label(self) -> &'static str {
        match self {
            SyncOutcome::Complete => "complete",
            SyncOutcome::Diff => "diff",
            SyncOutcome::Skipped => "skipped",
        }
    }
}

pub struct Dispatcher {
    reconciler: Arc<Reconciler>,
    transport: Arc<dyn Transport>,
    config: DispatcherConfig,
    needs_complete: bool,
}

impl Dispatcher {
    pub fn new(reconciler: Arc<Reconciler>, transport: Arc<dyn Transport>) -> Self {
        Self { reconciler, transport, config: DispatcherConfig::default(), needs_complete: true }
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Whether the next round sends a complete snapshot.
    pub fn needs_complete(&self) -> bool {
        self.needs_complete
    }

    /// One sync round. Any error forces a complete snapshot next time, since
    /// the diff it carried is already consumed.
    pub async fn sync_once(&mut self) -> Result<SyncOutcome, DispatchError> {
        let (payload, outcome) = if self.needs_complete {
            (SyncPayload::from(self.reconciler.complete()), SyncOutcome::Complete)
        } else {
            let diff = self.reconciler.diff();
            if diff.is_empty() {
                metrics::counter!("kollect_dispatch_total", 1u64, "outcome" => "skipped");
                return Ok(SyncOutcome::Skipped);
            }
            (SyncPayload::from(diff), SyncOutcome::Diff)
        };

        let result = match self.transport.send(&payload).await {
            Ok(actual) if actual != payload.expected_ack() => {
                Err(DispatchError::TotalsMismatch { expected: payload.expected_ack(), actual })
            }
            other => other.map(|_| outcome),
        };
        match &result {
            Ok(outcome) => {
                self.needs_complete = false;
                metrics::counter!("kollect_dispatch_total", 1u64, "outcome" => outcome.label());
                debug!(kind = outcome.label(), total_resources = payload.total_resources, total_edges = payload.total_edges, "synced");
            }
            Err(e) => {
                self.needs_complete = true;
                let label = if matches!(e, DispatchError::TotalsMismatch { .. }) { "mismatch" } else { "failed" };
                metrics::counter!("kollect_dispatch_total", 1u64, "outcome" => label);
            }
        }
        result
    }

    /// Sync every report interval (retry interval after a failure) until cancelled.
    pub async fn run(mut self, token: CancellationToken) {
        info!(report_secs = self.config.report_interval.as_secs(), retry_secs = self.config.retry_interval.as_secs(), "dispatcher started");
        let mut wait = self.config.report_interval;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            wait = match self.sync_once().await {
                Ok(_) => self.config.report_interval,
                Err(e) => {
                    warn!(error = %e, retry_secs = self.config.retry_interval.as_secs(), "sync failed; next send is complete");
                    self.config.retry_interval
                }
            };
        }
        info!("dispatcher stopped");
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }
}
