use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use futures::future::BoxFuture;
use naragaiden_client::{
    clock::ManualClock,
    fetch::{FetchError, FetchResult, Fetcher},
    refresh::{RefreshCoordinator, RefreshOutcome, WidgetEvent},
    store::{CachedState, FileStore, MAX_STATE_BYTES, MemoryStore, SnapshotStore},
};
use naragaiden_core::{STATUS_LOADING, STATUS_READY, UPDATED_PLACEHOLDER, ViewModel};
use tokio::sync::{Notify, mpsc};

const NOW: i64 = 1_735_000_000_000;
const PAYLOAD: &str = r#"{
    "generatedAt": 1734999900000,
    "children": [{
        "id": "c1",
        "name": "Ava",
        "feed": {"label": "Bottle", "beginDt": 1734998800000},
        "diaper": {"label": "Wet", "beginDt": 1734996400000}
    }]
}"#;

/// Answers every fetch with the same body or HTTP status, optionally waiting on a gate first.
struct ScriptedFetcher {
    reply: Result<String, u16>,
    gate: Option<Arc<Notify>>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    fn body(body: &str) -> Self {
        Self {
            reply: Ok(body.to_owned()),
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn status(code: u16) -> Self {
        Self {
            reply: Err(code),
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn gated(body: &str, gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::body(body)
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch(&self) -> BoxFuture<'_, Result<FetchResult, FetchError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            match &self.reply {
                Ok(body) => Ok(FetchResult::from_body(body.clone())),
                Err(code) => Err(FetchError::Status(*code)),
            }
        })
    }
}

struct Harness {
    coordinator: Arc<RefreshCoordinator>,
    store: Arc<SnapshotStore>,
    clock: Arc<ManualClock>,
    events: mpsc::UnboundedReceiver<WidgetEvent>,
}

fn harness(fetcher: Arc<ScriptedFetcher>, store: SnapshotStore) -> Harness {
    let store = Arc::new(store);
    let clock = Arc::new(ManualClock::new(NOW));
    let (tx, events) = mpsc::unbounded_channel();
    let coordinator = Arc::new(RefreshCoordinator::new(
        fetcher,
        Arc::clone(&store),
        clock.clone(),
        tx,
    ));
    Harness {
        coordinator,
        store,
        clock,
        events,
    }
}

fn drain(events: &mut mpsc::UnboundedReceiver<WidgetEvent>) -> Vec<WidgetEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn rendered(event: &WidgetEvent) -> &ViewModel {
    match event {
        WidgetEvent::Render(view) => view,
        other => panic!("expected a render, got {other:?}"),
    }
}

fn cached_five_minutes_ago() -> SnapshotStore {
    SnapshotStore::new(MemoryStore::with_state(CachedState {
        raw_payload: Some(PAYLOAD.to_owned()),
        updated_label: Some("Updated: 3:07 PM".to_owned()),
        last_success_ms: NOW - 5 * 60_000,
        last_error: false,
        armed_at_ms: 0,
    }))
}

#[tokio::test]
async fn success_shows_loading_then_fresh_rows() {
    let fetcher = Arc::new(ScriptedFetcher::body(PAYLOAD));
    let mut h = harness(fetcher.clone(), SnapshotStore::in_memory());

    assert_eq!(h.coordinator.refresh().await, RefreshOutcome::Success);

    let events = drain(&mut h.events);
    assert_eq!(events.len(), 3);

    let loading = rendered(&events[0]);
    assert_eq!(loading.status_line, STATUS_LOADING);
    assert_eq!(loading.updated_line, UPDATED_PLACEHOLDER);
    assert!(loading.is_empty());

    let ready = rendered(&events[1]);
    assert_eq!(ready.status_line, STATUS_READY);
    assert_eq!(
        ready.updated_line,
        FetchResult::from_body(PAYLOAD.to_owned()).updated_label
    );
    assert_eq!(ready.rows.len(), 1);
    assert_eq!(ready.rows[0].name, "Ava");
    assert_eq!(ready.rows[0].feed_relative, "20 mins ago");
    assert_eq!(ready.rows[0].diaper_relative, "1 hour ago");

    assert_eq!(events[2], WidgetEvent::DataChanged);

    let state = h.store.load();
    assert_eq!(state.raw_payload.as_deref(), Some(PAYLOAD));
    assert_eq!(state.last_success_ms, NOW);
    assert!(!state.last_error);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn failure_keeps_cache_and_marks_it_stale() {
    let fetcher = Arc::new(ScriptedFetcher::status(500));
    let mut h = harness(fetcher, cached_five_minutes_ago());

    assert_eq!(
        h.coordinator.refresh().await,
        RefreshOutcome::Failure("HTTP 500".to_owned())
    );

    let events = drain(&mut h.events);
    assert_eq!(events.len(), 2);
    assert_eq!(rendered(&events[0]).status_line, STATUS_LOADING);

    let failed = rendered(&events[1]);
    assert_eq!(failed.status_line, "Error: HTTP 500");
    assert_eq!(failed.updated_line, "Updated: 3:07 PM (5 mins old)");
    assert_eq!(failed.rows.len(), 1);

    let state = h.store.load();
    assert!(state.last_error);
    assert_eq!(state.raw_payload.as_deref(), Some(PAYLOAD));
    assert_eq!(state.updated_label.as_deref(), Some("Updated: 3:07 PM"));
    assert_eq!(state.last_success_ms, NOW - 5 * 60_000);
}

#[tokio::test]
async fn unparseable_body_counts_as_failure() {
    let fetcher = Arc::new(ScriptedFetcher::body("[1, 2, 3]"));
    let mut h = harness(fetcher, SnapshotStore::in_memory());

    let outcome = h.coordinator.refresh().await;
    assert!(matches!(outcome, RefreshOutcome::Failure(_)));

    let events = drain(&mut h.events);
    let last = rendered(events.last().expect("a render"));
    assert!(last.status_line.starts_with("Error: "));
    assert!(last.is_empty());
    assert!(!events.contains(&WidgetEvent::DataChanged));

    let state = h.store.load();
    assert!(state.last_error);
    assert_eq!(state.raw_payload, None);
}

#[tokio::test]
async fn concurrent_refresh_is_dropped() {
    let gate = Arc::new(Notify::new());
    let fetcher = Arc::new(ScriptedFetcher::gated(PAYLOAD, gate.clone()));
    let h = harness(fetcher.clone(), SnapshotStore::in_memory());

    let first = h.coordinator.spawn_refresh();
    while !h.coordinator.is_refreshing() {
        tokio::task::yield_now().await;
    }

    assert_eq!(h.coordinator.refresh().await, RefreshOutcome::Skipped);
    assert_eq!(h.coordinator.refresh().await, RefreshOutcome::Skipped);

    gate.notify_one();
    assert_eq!(first.await.expect("refresh task"), RefreshOutcome::Success);
    assert!(!h.coordinator.is_refreshing());
    assert_eq!(fetcher.calls(), 1);

    gate.notify_one();
    assert_eq!(h.coordinator.refresh().await, RefreshOutcome::Success);
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn refresh_clears_launch_arm() {
    let fetcher = Arc::new(ScriptedFetcher::body(PAYLOAD));
    let h = harness(fetcher, SnapshotStore::in_memory());
    h.store.set_armed(NOW - 500).expect("arm");

    h.coordinator.refresh().await;
    assert_eq!(h.store.load().armed_at_ms, 0);
}

#[tokio::test]
async fn idle_repaint_marks_staleness_only_after_failure() {
    let fetcher = Arc::new(ScriptedFetcher::status(503));
    let mut h = harness(fetcher, cached_five_minutes_ago());

    h.coordinator.publish_cached();
    let quiet = drain(&mut h.events);
    assert_eq!(rendered(&quiet[0]).updated_line, "Updated: 3:07 PM");
    assert_eq!(rendered(&quiet[0]).status_line, "");

    h.coordinator.refresh().await;
    drain(&mut h.events);

    h.clock.set(NOW + 60_000);
    h.coordinator.publish_cached();
    let stale = drain(&mut h.events);
    assert_eq!(rendered(&stale[0]).updated_line, "Updated: 3:07 PM (6 mins old)");
}

#[tokio::test]
async fn cached_view_always_carries_age() {
    let fetcher = Arc::new(ScriptedFetcher::body(PAYLOAD));
    let h = harness(fetcher, cached_five_minutes_ago());

    let view = h.coordinator.cached_view();
    assert_eq!(view.status_line, STATUS_READY);
    assert_eq!(view.updated_line, "Updated: 3:07 PM (5 mins old)");
    assert_eq!(view.rows.len(), 1);
    assert!(!view.armed);

    h.store.set_armed(NOW - 1_000).expect("arm");
    assert!(h.coordinator.cached_view().armed);

    let empty = harness(
        Arc::new(ScriptedFetcher::body(PAYLOAD)),
        SnapshotStore::in_memory(),
    );
    let view = empty.coordinator.cached_view();
    assert_eq!(view.status_line, "");
    assert_eq!(view.updated_line, UPDATED_PLACEHOLDER);
    assert_eq!(view.updated_line, "as of --");
    assert!(view.is_empty());
}

#[tokio::test]
async fn payload_too_large_to_store_keeps_previous_cache() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("state.json");
    let store = SnapshotStore::new(FileStore::new(&path));
    store
        .save_success(PAYLOAD, "Updated: 3:07 PM", NOW - 60_000)
        .expect("seed cache");

    let huge = format!(
        r#"{{"generatedAt": 1734999900000, "children": [], "pad": "{}"}}"#,
        "x".repeat(MAX_STATE_BYTES as usize)
    );
    let mut h = harness(Arc::new(ScriptedFetcher::body(&huge)), store);

    match h.coordinator.refresh().await {
        RefreshOutcome::Failure(message) => assert!(message.starts_with("storage: ")),
        other => panic!("expected a storage failure, got {other:?}"),
    }

    let events = drain(&mut h.events);
    let last = rendered(events.last().expect("a render"));
    assert!(last.status_line.starts_with("Error: storage: "));
    assert!(!events.contains(&WidgetEvent::DataChanged));

    let state = h.store.load();
    assert_eq!(state.raw_payload.as_deref(), Some(PAYLOAD));
    assert_eq!(state.last_success_ms, NOW - 60_000);
    assert!(state.last_error);
}
