#![forbid(unsafe_code)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, obj, pods, FakeSource, RecordingHandler, Seen};
use kollect_kubehub::{ResourceWatcher, WatchEvent, WatcherConfig};
use tokio_util::sync::CancellationToken;

fn fast_config(page_size: u32) -> WatcherConfig {
    WatcherConfig {
        page_size,
        backoff_step: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn list_then_watch_adds_and_deletes() {
    let initial: Vec<_> = (1..=5).map(|i| obj(&format!("id-{:03}", i), "1")).collect();
    let (source, watch_tx) = FakeSource::new(vec![initial]);
    let handler = Arc::new(RecordingHandler::default());
    let handle = ResourceWatcher::new(pods(), source.clone(), handler.clone())
        .with_config(fast_config(2))
        .spawn(CancellationToken::new());

    assert!(handle.wait_until_initialized(Duration::from_secs(2)).await);
    assert_eq!(handler.adds(), 5);
    assert_eq!(handle.indexed(), 5);
    assert!(eventually(Duration::from_secs(2), || source.watches_opened() == 1).await);

    watch_tx.send(WatchEvent::Added(obj("id-006", "2"))).unwrap();
    assert!(eventually(Duration::from_secs(2), || handler.adds() == 6).await);

    watch_tx.send(WatchEvent::Deleted(obj("id-002", "3"))).unwrap();
    assert!(eventually(Duration::from_secs(2), || handler.deletes().len() == 1).await);
    assert_eq!(handler.deletes()[0].0, "id-002");
    assert!(eventually(Duration::from_secs(2), || handle.indexed() == 5).await);

    handle.stop();
    tokio::time::timeout(Duration::from_secs(2), handle.join()).await.expect("watcher did not stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn modified_reports_previous_version_and_skips_duplicates() {
    let (source, watch_tx) = FakeSource::new(vec![vec![obj("a", "1")]]);
    let handler = Arc::new(RecordingHandler::default());
    let handle = ResourceWatcher::new(pods(), source.clone(), handler.clone())
        .with_config(fast_config(250))
        .spawn(CancellationToken::new());
    assert!(handle.wait_until_initialized(Duration::from_secs(2)).await);
    assert!(eventually(Duration::from_secs(2), || source.watches_opened() == 1).await);

    watch_tx.send(WatchEvent::Modified(obj("a", "1"))).unwrap(); // same version as listed
    watch_tx.send(WatchEvent::Modified(obj("a", "2"))).unwrap();
    assert!(eventually(Duration::from_secs(2), || handler.updates() == 1).await);
    let seen = handler.seen.lock().unwrap().clone();
    assert!(seen.contains(&Seen::Update("a".into(), Some("1".into()))));
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_error_relists_and_resyncs_deletions() {
    let first = vec![obj("a", "1"), obj("b", "1"), obj("c", "1")];
    let second = vec![obj("a", "1"), obj("c", "2")];
    let (source, watch_tx) = FakeSource::new(vec![first, second]);
    let handler = Arc::new(RecordingHandler::default());
    let handle = ResourceWatcher::new(pods(), source.clone(), handler.clone())
        .with_config(fast_config(250))
        .spawn(CancellationToken::new());
    assert!(handle.wait_until_initialized(Duration::from_secs(2)).await);

    watch_tx.send(WatchEvent::Error("Expired (410): too old resource version".into())).unwrap();

    assert!(eventually(Duration::from_secs(2), || handler.deletes().len() == 1).await);
    assert_eq!(handler.deletes()[0], ("b".to_string(), "Pod".to_string()));
    assert_eq!(handler.adds(), 5);
    assert!(eventually(Duration::from_secs(2), || handle.indexed() == 2).await);
    assert!(eventually(Duration::from_secs(2), || source.watches_opened() == 2).await);
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_token_stops_watcher() {
    let (source, _watch_tx) = FakeSource::new(vec![vec![obj("a", "1")]]);
    let handler = Arc::new(RecordingHandler::default());
    let token = CancellationToken::new();
    let handle = ResourceWatcher::new(pods(), source, handler)
        .with_config(fast_config(250))
        .spawn(token.clone());
    assert!(handle.wait_until_initialized(Duration::from_secs(2)).await);
    token.cancel();
    assert!(handle.is_stopped());
    tokio::time::timeout(Duration::from_secs(2), handle.join()).await.expect("watcher did not stop");
}

fn gaps(attempts: &[tokio::time::Instant]) -> Vec<Duration> {
    attempts.windows(2).map(|w| w[1] - w[0]).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_lists_back_off_linearly_up_to_the_cap() {
    let (source, _watch_tx) = FakeSource::new(vec![vec![obj("a", "1")]]);
    source.fail_lists(5);
    let handler = Arc::new(RecordingHandler::default());
    let cfg = WatcherConfig {
        page_size: 250,
        backoff_step: Duration::from_millis(50),
        backoff_max: Duration::from_millis(150),
    };
    let handle = ResourceWatcher::new(pods(), source.clone(), handler.clone())
        .with_config(cfg)
        .spawn(CancellationToken::new());

    assert!(handle.wait_until_initialized(Duration::from_secs(3)).await);
    assert_eq!(handler.adds(), 1);
    let attempts = source.list_attempts();
    assert_eq!(attempts.len(), 6);
    let gaps = gaps(&attempts);
    let expected = [50u64, 100, 150, 150, 150];
    for (gap, want) in gaps.iter().zip(expected) {
        assert!(*gap >= Duration::from_millis(want), "gap {:?} shorter than {}ms", gap, want);
    }
    // uncapped, the last delay would have been 250ms
    assert!(gaps[4] < Duration::from_millis(230), "last gap {:?} not capped", gaps[4]);
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn opened_watch_resets_the_retry_count() {
    let (source, watch_tx) = FakeSource::new(vec![vec![obj("a", "1")]]);
    source.fail_lists(4);
    let handler = Arc::new(RecordingHandler::default());
    let cfg = WatcherConfig {
        page_size: 250,
        backoff_step: Duration::from_millis(50),
        backoff_max: Duration::from_millis(150),
    };
    let handle = ResourceWatcher::new(pods(), source.clone(), handler.clone())
        .with_config(cfg)
        .spawn(CancellationToken::new());
    assert!(handle.wait_until_initialized(Duration::from_secs(3)).await);
    assert!(eventually(Duration::from_secs(2), || source.watches_opened() == 1).await);

    let failed_at = tokio::time::Instant::now();
    watch_tx.send(WatchEvent::Error("Expired (410): too old resource version".into())).unwrap();
    assert!(eventually(Duration::from_secs(2), || source.list_attempts().len() == 6).await);
    let relist_gap = source.list_attempts()[5] - failed_at;
    // one retry after the reset is one step; without the reset it would be the 150ms cap
    assert!(relist_gap >= Duration::from_millis(50), "relisted after {:?}", relist_gap);
    assert!(relist_gap < Duration::from_millis(130), "relisted after {:?}", relist_gap);
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_backoff_exits_promptly() {
    let (source, _watch_tx) = FakeSource::new(vec![vec![obj("a", "1")]]);
    source.fail_lists(usize::MAX);
    let handler = Arc::new(RecordingHandler::default());
    let token = CancellationToken::new();
    let handle = ResourceWatcher::new(pods(), source.clone(), handler)
        .with_config(WatcherConfig {
            page_size: 250,
            backoff_step: Duration::from_secs(30),
            backoff_max: Duration::from_secs(120),
        })
        .spawn(token.clone());

    assert!(eventually(Duration::from_secs(2), || source.list_attempts().len() == 1).await);
    assert!(!handle.wait_until_initialized(Duration::from_millis(50)).await);
    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle.join()).await.expect("watcher stuck in backoff");
    assert_eq!(source.list_attempts().len(), 1);
}
