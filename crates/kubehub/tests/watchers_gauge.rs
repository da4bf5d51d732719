#![forbid(unsafe_code)]

// Own test binary: the metrics recorder is process-global.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use common::{FakeSource, RecordingHandler};
use kollect_kubehub::{ResourceDiscovery, ResourceSource, ResourceType, SourceFactory, WatchSupervisor};
use metrics::{Counter, Gauge, GaugeFn, Histogram, Key, KeyName, Recorder, SharedString, Unit};

type Values = Arc<Mutex<HashMap<String, f64>>>;

struct Slot {
    name: String,
    values: Values,
}

impl GaugeFn for Slot {
    fn increment(&self, value: f64) {
        *self.values.lock().unwrap().entry(self.name.clone()).or_default() += value;
    }
    fn decrement(&self, value: f64) {
        *self.values.lock().unwrap().entry(self.name.clone()).or_default() -= value;
    }
    fn set(&self, value: f64) {
        self.values.lock().unwrap().insert(self.name.clone(), value);
    }
}

/// Keeps the last value of every gauge; ignores everything else.
struct GaugeRecorder {
    values: Values,
}

impl Recorder for GaugeRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, _: &Key) -> Counter {
        Counter::noop()
    }

    fn register_gauge(&self, key: &Key) -> Gauge {
        Gauge::from_arc(Arc::new(Slot { name: key.name().to_string(), values: Arc::clone(&self.values) }))
    }

    fn register_histogram(&self, _: &Key) -> Histogram {
        Histogram::noop()
    }
}

struct FixedDiscovery(Vec<ResourceType>);

#[async_trait]
impl ResourceDiscovery for FixedDiscovery {
    async fn discover(&self) -> Result<Vec<ResourceType>> {
        Ok(self.0.clone())
    }
}

struct EmptySources;

impl SourceFactory for EmptySources {
    fn source_for(&self, _: &ResourceType) -> Arc<dyn ResourceSource> {
        FakeSource::empty()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watcher_gauge_drops_to_zero_on_shutdown() {
    let values: Values = Arc::default();
    metrics::set_boxed_recorder(Box::new(GaugeRecorder { values: Arc::clone(&values) })).unwrap();
    let gauge = |values: &Values| values.lock().unwrap().get("kollect_watchers").copied();

    let discovery = FixedDiscovery(vec![
        ResourceType::new("", "v1", "Pod", "pods", true),
        ResourceType::new("", "v1", "Service", "services", true),
    ]);
    let mut sup = WatchSupervisor::new(Arc::new(discovery), Arc::new(EmptySources), Arc::new(RecordingHandler::default()));
    sup.sync_watchers().await.unwrap();
    assert_eq!(gauge(&values), Some(2.0));

    sup.shutdown();
    assert_eq!(gauge(&values), Some(0.0));
}
