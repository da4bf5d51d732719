#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use kollect_kubehub::{ListPage, ResourceHandler, ResourceSource, ResourceType, WatchEvent};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use tokio::sync::mpsc;

pub fn pods() -> ResourceType {
    ResourceType::new("", "v1", "Pod", "pods", true)
}

pub fn obj(uid: &str, rv: &str) -> DynamicObject {
    let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "Pod"));
    let mut o = DynamicObject::new(uid, &ar).within("default");
    o.metadata.uid = Some(uid.to_string());
    o.metadata.resource_version = Some(rv.to_string());
    o.data = serde_json::json!({});
    o
}

/// Scripted list results and one optional live watch channel.
pub struct FakeSource {
    lists: Mutex<VecDeque<Vec<DynamicObject>>>,
    last_list: Mutex<Vec<DynamicObject>>,
    watch_rx: Mutex<Option<mpsc::UnboundedReceiver<WatchEvent>>>,
    watches_opened: Mutex<usize>,
    /// First-page list attempts, failed or not.
    list_attempts: Mutex<Vec<tokio::time::Instant>>,
    failing_lists: Mutex<usize>,
}

impl FakeSource {
    /// Each call to list serves the next scripted result; the last one repeats.
    pub fn new(lists: Vec<Vec<DynamicObject>>) -> (Arc<Self>, mpsc::UnboundedSender<WatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let src = Arc::new(Self {
            lists: Mutex::new(lists.into()),
            last_list: Mutex::new(Vec::new()),
            watch_rx: Mutex::new(Some(rx)),
            watches_opened: Mutex::new(0),
            list_attempts: Mutex::new(Vec::new()),
            failing_lists: Mutex::new(0),
        });
        (src, tx)
    }

    pub fn empty() -> Arc<Self> {
        Self::new(vec![Vec::new()]).0
    }

    /// The next `n` list calls fail.
    pub fn fail_lists(&self, n: usize) {
        *self.failing_lists.lock().unwrap() = n;
    }

    pub fn list_attempts(&self) -> Vec<tokio::time::Instant> {
        self.list_attempts.lock().unwrap().clone()
    }

    pub fn watches_opened(&self) -> usize {
        *self.watches_opened.lock().unwrap()
    }

    fn current_list(&self, first_page: bool) -> Vec<DynamicObject> {
        if first_page {
            if let Some(next) = self.lists.lock().unwrap().pop_front() {
                *self.last_list.lock().unwrap() = next;
            }
        }
        self.last_list.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResourceSource for FakeSource {
    async fn list_page(&self, limit: u32, continue_token: Option<String>) -> Result<ListPage> {
        let offset: usize = match continue_token.as_deref() {
            Some(t) => t.parse().map_err(|_| anyhow!("bad continue token"))?,
            None => 0,
        };
        if offset == 0 {
            self.list_attempts.lock().unwrap().push(tokio::time::Instant::now());
        }
        {
            let mut failing = self.failing_lists.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(anyhow!("connection refused"));
            }
        }
        let all = self.current_list(offset == 0);
        let end = (offset + limit as usize).min(all.len());
        let items = all[offset..end].to_vec();
        let continue_token = if end < all.len() { Some(end.to_string()) } else { None };
        Ok(ListPage { items, continue_token, resource_version: Some("100".into()) })
    }

    async fn watch<'a>(&'a self, _resource_version: &'a str) -> Result<BoxStream<'a, Result<WatchEvent>>> {
        *self.watches_opened.lock().unwrap() += 1;
        let rx = self.watch_rx.lock().unwrap().take();
        match rx {
            Some(rx) => Ok(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|ev| (Ok::<_, anyhow::Error>(ev), rx))
            })
            .boxed()),
            None => Ok(stream::pending().boxed()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Add(String),
    Update(String, Option<String>),
    Delete(String, String),
}

/// Records every callback.
#[derive(Default)]
pub struct RecordingHandler {
    pub seen: Mutex<Vec<Seen>>,
}

impl RecordingHandler {
    pub fn adds(&self) -> usize {
        self.seen.lock().unwrap().iter().filter(|s| matches!(s, Seen::Add(_))).count()
    }

    pub fn deletes(&self) -> Vec<(String, String)> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| match s {
                Seen::Delete(uid, kind) => Some((uid.clone(), kind.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn updates(&self) -> usize {
        self.seen.lock().unwrap().iter().filter(|s| matches!(s, Seen::Update(..))).count()
    }
}

fn uid_of(obj: &DynamicObject) -> String {
    obj.metadata.uid.clone().unwrap_or_default()
}

#[async_trait]
impl ResourceHandler for RecordingHandler {
    async fn on_add(&self, obj: &DynamicObject) {
        self.seen.lock().unwrap().push(Seen::Add(uid_of(obj)));
    }

    async fn on_update(&self, previous_version: Option<&str>, obj: &DynamicObject) {
        self.seen
            .lock()
            .unwrap()
            .push(Seen::Update(uid_of(obj), previous_version.map(str::to_string)));
    }

    async fn on_delete(&self, obj: &DynamicObject) {
        let kind = obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default();
        self.seen.lock().unwrap().push(Seen::Delete(uid_of(obj), kind));
    }
}

/// Poll `cond` every 10ms until it holds or `within` elapses.
pub async fn eventually<F: Fn() -> bool>(within: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
