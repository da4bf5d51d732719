//! Kollect store: the reconciler owning the authoritative graph state.
//!
//! One consumer task applies [`NodeEvent`]s under a single mutex; the
//! dispatcher pulls [`DiffReport`]s or [`CompleteReport`]s from the same lock,
//! so neither ever observes a half-applied event.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use kollect_core::{Edge, EdgeFn, Node, NodeEvent, NodeStore, Operation};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

mod lru;

pub use lru::RecencyCache;

/// Default capacity of the recently-deleted cache.
pub const DEFAULT_PURGE_CAPACITY: usize = 2048;

/// Edges keyed by source UID, then destination UID.
type EdgeSet = FxHashMap<String, FxHashMap<String, Edge>>;

/// What happened to one reconciled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// A pending change for the UID carries a newer time.
    Stale,
    /// The UID was deleted at the same time or later.
    Resurrection,
    /// Identical to the last published node.
    Unchanged,
}

impl Outcome {
    fn label(self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::Stale => "stale",
            Outcome::Resurrection => "resurrection",
            Outcome::Unchanged => "unchanged",
        }
    }
}

/// Changes since the previous sync point.
#[derive(Debug, Clone, Default)]
pub struct DiffReport {
    pub added_nodes: Vec<Node>,
    pub updated_nodes: Vec<Node>,
    pub deleted_uids: Vec<String>,
    pub added_edges: Vec<Edge>,
    pub deleted_edges: Vec<Edge>,
    pub total_nodes: usize,
    pub total_edges: usize,
}

impl DiffReport {
    /// True when there is nothing to announce.
    pub fn is_empty(&self) -> bool {
        self.added_nodes.is_empty()
            && self.updated_nodes.is_empty()
            && self.deleted_uids.is_empty()
            && self.added_edges.is_empty()
            && self.deleted_edges.is_empty()
    }
}

/// Full current graph.
#[derive(Debug, Clone, Default)]
pub struct CompleteReport {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub total_nodes: usize,
    pub total_edges: usize,
}

struct State {
    current: FxHashMap<String, Node>,
    previous: FxHashMap<String, Node>,
    diff: FxHashMap<String, NodeEvent>,
    /// Times of reverted updates; keeps precedence after their diff entry is gone.
    reverted: FxHashMap<String, i64>,
    edge_fns: FxHashMap<String, EdgeFn>,
    previous_edges: EdgeSet,
    purged: RecencyCache<String, NodeEvent>,
}

impl State {
    fn apply(&mut self, mut ev: NodeEvent) -> Outcome {
        let uid = ev.node.uid.clone();
        let pending_time = self.diff.get(&uid).map(|p| p.time).or_else(|| self.reverted.get(&uid).copied());
        if pending_time.map_or(false, |t| t > ev.time) {
            return Outcome::Stale;
        }
        if let Some(purged) = self.purged.get(&uid) {
            if purged.time >= ev.time {
                return Outcome::Resurrection;
            }
        }

        if ev.operation == Operation::Delete {
            self.reverted.remove(&uid);
            self.current.remove(&uid);
            self.edge_fns.remove(&uid);
            if self.previous.contains_key(&uid) {
                self.diff.insert(uid.clone(), ev.clone());
            } else {
                // Never published; nothing to announce.
                self.diff.remove(&uid);
            }
            self.purged.put(uid, ev);
            return Outcome::Applied;
        }

        match self.previous.get(&uid) {
            Some(prev) => {
                ev.operation = Operation::Update;
                if *prev == ev.node {
                    self.diff.remove(&uid);
                    self.reverted.insert(uid.clone(), ev.time);
                    // Back to the published state (e.g. an update that was reverted).
                    if self.current.get(&uid) != Some(prev) {
                        self.current.insert(uid.clone(), ev.node);
                        self.edge_fns.insert(uid, ev.compute_edges);
                    }
                    return Outcome::Unchanged;
                }
            }
            None => ev.operation = Operation::Create,
        }
        self.reverted.remove(&uid);
        self.current.insert(uid.clone(), ev.node.clone());
        self.edge_fns.insert(uid.clone(), ev.compute_edges.clone());
        self.diff.insert(uid, ev);
        Outcome::Applied
    }

    fn compute_edges(&self) -> EdgeSet {
        let t0 = Instant::now();
        let store = NodeStore::build(self.current.values());
        let mut out = EdgeSet::default();
        for compute in self.edge_fns.values() {
            for e in compute(&store) {
                // Last writer wins per (source, dest).
                out.entry(e.source_uid.clone()).or_default().insert(e.dest_uid.clone(), e);
            }
        }
        metrics::histogram!("kollect_edge_compute_ms", t0.elapsed().as_secs_f64() * 1_000.0);
        out
    }

    /// Make the current state the new sync point.
    fn reset_sync_point(&mut self, edges: EdgeSet) {
        self.previous_edges = edges;
        self.previous = self.current.clone();
        self.diff.clear();
        self.reverted.clear();
    }
}

fn count_edges(edges: &EdgeSet) -> usize {
    edges.values().map(|m| m.len()).sum()
}

fn flatten_sorted(edges: &EdgeSet) -> Vec<Edge> {
    let mut out: Vec<Edge> = edges.values().flat_map(|m| m.values().cloned()).collect();
    out.sort_unstable();
    out
}

/// Authoritative graph state machine.
pub struct Reconciler {
    state: Mutex<State>,
    total_edges: AtomicUsize,
}

impl Default for Reconciler {
    fn default() -> Self { Self::new(DEFAULT_PURGE_CAPACITY) }
}

impl Reconciler {
    pub fn new(purge_capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                current: FxHashMap::default(),
                previous: FxHashMap::default(),
                diff: FxHashMap::default(),
                reverted: FxHashMap::default(),
                edge_fns: FxHashMap::default(),
                previous_edges: EdgeSet::default(),
                purged: RecencyCache::with_capacity(purge_capacity),
            }),
            total_edges: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // State is rebuilt by relisting, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one event to the current state.
    pub fn reconcile(&self, ev: NodeEvent) -> Outcome {
        let uid_for_log = ev.node.uid.clone();
        let time = ev.time;
        let outcome = self.lock().apply(ev);
        if outcome != Outcome::Applied {
            debug!(uid = %uid_for_log, time, outcome = outcome.label(), "event discarded");
            metrics::counter!("kollect_reconcile_discarded_total", 1u64, "reason" => outcome.label());
        }
        outcome
    }

    /// Changes since the last sync point; the current state becomes the new sync point.
    pub fn diff(&self) -> DiffReport {
        let mut st = self.lock();
        let edges = st.compute_edges();
        let mut report = DiffReport::default();

        let mut pending: Vec<(String, NodeEvent)> = st.diff.drain().collect();
        pending.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        for (uid, ev) in pending {
            match ev.operation {
                Operation::Create => report.added_nodes.push(ev.node),
                Operation::Update => report.updated_nodes.push(ev.node),
                Operation::Delete => report.deleted_uids.push(uid),
            }
        }

        for (src, dests) in edges.iter() {
            let before = st.previous_edges.get(src);
            for (dst, e) in dests.iter() {
                match before.and_then(|m| m.get(dst)) {
                    Some(old) if old == e => {}
                    Some(old) => {
                        report.deleted_edges.push(old.clone());
                        report.added_edges.push(e.clone());
                    }
                    None => report.added_edges.push(e.clone()),
                }
            }
        }
        for (src, dests) in st.previous_edges.iter() {
            let after = edges.get(src);
            for (dst, e) in dests.iter() {
                if !after.map_or(false, |m| m.contains_key(dst)) {
                    report.deleted_edges.push(e.clone());
                }
            }
        }
        report.added_edges.sort_unstable();
        report.deleted_edges.sort_unstable();

        report.total_nodes = st.current.len();
        report.total_edges = count_edges(&edges);
        st.reset_sync_point(edges);
        drop(st);

        self.publish_totals(report.total_nodes, report.total_edges);
        report
    }

    /// Entire current graph, ignoring pending changes; resets the sync point like [`Reconciler::diff`].
    pub fn complete(&self) -> CompleteReport {
        let mut st = self.lock();
        let edges = st.compute_edges();
        let mut nodes: Vec<Node> = st.current.values().cloned().collect();
        nodes.sort_unstable_by(|a, b| a.uid.cmp(&b.uid));
        let report = CompleteReport {
            total_nodes: nodes.len(),
            total_edges: count_edges(&edges),
            edges: flatten_sorted(&edges),
            nodes,
        };
        st.reset_sync_point(edges);
        drop(st);

        self.publish_totals(report.total_nodes, report.total_edges);
        report
    }

    fn publish_totals(&self, nodes: usize, edges: usize) {
        self.total_edges.store(edges, Ordering::Relaxed);
        metrics::gauge!("kollect_nodes", nodes as f64);
        metrics::gauge!("kollect_edges", edges as f64);
    }

    pub fn total_nodes(&self) -> usize { self.lock().current.len() }

    /// Edge count as of the last diff/complete.
    pub fn total_edges(&self) -> usize { self.total_edges.load(Ordering::Relaxed) }

    pub fn current_node(&self, uid: &str) -> Option<Node> {
        self.lock().current.get(uid).cloned()
    }

    /// Operation pending for the next diff, if any.
    pub fn pending(&self, uid: &str) -> Option<Operation> {
        self.lock().diff.get(uid).map(|ev| ev.operation)
    }

    pub fn pending_len(&self) -> usize { self.lock().diff.len() }

    pub fn is_purged(&self, uid: &str) -> bool {
        self.lock().purged.contains(&uid.to_string())
    }
}

/// Spawn the single consumer applying node events. Exits when all senders are dropped.
pub fn spawn_reconciler(reconciler: Arc<Reconciler>, mut rx: mpsc::Receiver<NodeEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut applied = 0u64;
        while let Some(ev) = rx.recv().await {
            if reconciler.reconcile(ev) == Outcome::Applied {
                applied += 1;
            }
        }
        info!(applied, "node event channel closed; reconciler stopped");
    })
}
