use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use futures::FutureExt;
use naragaiden_core::{
    STATUS_LOADING, STATUS_READY, UPDATED_PLACEHOLDER, ViewModel, build_rows, error_status,
    parse_snapshot, rows_from_cache, stale_suffix,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    fetch::{FetchError, FetchResult, Fetcher},
    store::{CachedState, SnapshotStore, StoreSaveError},
};

/// Messages for whatever owns the render step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetEvent {
    Render(ViewModel),
    /// Stored data changed; cached views should be rebuilt.
    DataChanged,
    /// Replace only the status line.
    Prompt(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Another refresh was already in flight.
    Skipped,
    Success,
    Failure(String),
}

struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Fetches, caches and publishes widget contents, one fetch at a time.
pub struct RefreshCoordinator {
    fetcher: Arc<dyn Fetcher>,
    store: Arc<SnapshotStore>,
    clock: Arc<dyn Clock>,
    events: mpsc::UnboundedSender<WidgetEvent>,
    in_flight: AtomicBool,
}

impl RefreshCoordinator {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        store: Arc<SnapshotStore>,
        clock: Arc<dyn Clock>,
        events: mpsc::UnboundedSender<WidgetEvent>,
    ) -> Self {
        Self {
            fetcher,
            store,
            clock,
            events,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Runs [`Self::refresh`] on the runtime, away from the render loop.
    pub fn spawn_refresh(self: &Arc<Self>) -> JoinHandle<RefreshOutcome> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.refresh().await })
    }

    /// Fetches a new payload, or serves the cache marked stale when that fails.
    ///
    /// Returns [`RefreshOutcome::Skipped`] without touching the network when a refresh is
    /// already running.
    pub async fn refresh(&self) -> RefreshOutcome {
        let Some(_guard) = self.try_begin() else {
            debug!("refresh already in flight, dropping request");
            return RefreshOutcome::Skipped;
        };

        if let Err(err) = self.write_store(|store| store.set_armed(0)).await {
            warn!("failed to clear launch arm: {}", err);
        }

        let cached = self.store.load();
        let now_ms = self.clock.now_ms();
        self.publish(WidgetEvent::Render(cached_view(
            &cached,
            STATUS_LOADING,
            true,
            false,
            now_ms,
        )));

        let started = Instant::now();
        let fetched = AssertUnwindSafe(self.fetcher.fetch())
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(FetchError::Transport("fetch panicked".to_owned())));

        let outcome = match fetched {
            Ok(result) => self.apply_fetched(result).await,
            Err(err) => self.apply_failure(&err.to_string()).await,
        };
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            ?outcome,
            "refresh finished"
        );
        outcome
    }

    /// Repaints from cache without fetching; staleness shows only after a failed refresh.
    pub fn publish_cached(&self) {
        let now_ms = self.clock.now_ms();
        let armed = self.store.check_armed(now_ms);
        let cached = self.store.load();
        let include_stale = cached.last_error;
        self.publish(WidgetEvent::Render(cached_view(
            &cached,
            "",
            include_stale,
            armed,
            now_ms,
        )));
    }

    /// The companion-app view of the cache, always annotated with its age.
    pub fn cached_view(&self) -> ViewModel {
        let now_ms = self.clock.now_ms();
        let armed = self.store.check_armed(now_ms);
        let cached = self.store.load();
        let status = if cached.raw_payload.is_some() {
            STATUS_READY
        } else {
            ""
        };
        cached_view(&cached, status, true, armed, now_ms)
    }

    fn try_begin(&self) -> Option<InFlightGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard {
                flag: &self.in_flight,
            })
    }

    async fn apply_fetched(&self, result: FetchResult) -> RefreshOutcome {
        let snapshot = match parse_snapshot(&result.body) {
            Ok(snapshot) => snapshot,
            Err(err) => return self.apply_failure(&err.to_string()).await,
        };

        let now_ms = self.clock.now_ms();
        let rows = build_rows(&snapshot, now_ms);
        let body = result.body.clone();
        let label = result.updated_label.clone();
        let saved = self
            .write_store(move |store| store.save_success(&body, &label, now_ms))
            .await;
        if let Err(err) = saved {
            warn!("failed to persist payload: {}", err);
            let message = format!("storage: {err}");
            if let Err(err) = self.write_store(move |store| store.save_failure(now_ms)).await {
                warn!("failed to record refresh failure: {}", err);
            }
            self.publish(WidgetEvent::Render(ViewModel {
                status_line: error_status(&message),
                updated_line: result.updated_label,
                rows,
                armed: false,
            }));
            return RefreshOutcome::Failure(message);
        }

        info!(children = snapshot.children.len(), "refresh succeeded");
        self.publish(WidgetEvent::Render(ViewModel {
            status_line: STATUS_READY.to_owned(),
            updated_line: result.updated_label,
            rows,
            armed: false,
        }));
        self.publish(WidgetEvent::DataChanged);
        RefreshOutcome::Success
    }

    async fn apply_failure(&self, message: &str) -> RefreshOutcome {
        warn!("refresh failed: {}", message);
        let now_ms = self.clock.now_ms();
        if let Err(err) = self.write_store(move |store| store.save_failure(now_ms)).await {
            warn!("failed to record refresh failure: {}", err);
        }

        let cached = self.store.load();
        self.publish(WidgetEvent::Render(cached_view(
            &cached,
            &error_status(message),
            true,
            false,
            now_ms,
        )));
        RefreshOutcome::Failure(message.to_owned())
    }

    /// Runs a store write on the blocking pool, since file saves may sleep between retries.
    async fn write_store<T, F>(&self, op: F) -> Result<T, StoreSaveError>
    where
        T: Send + 'static,
        F: FnOnce(&SnapshotStore) -> Result<T, StoreSaveError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || op(&store)).await {
            Ok(result) => result,
            Err(err) => Err(StoreSaveError::Background(err.to_string())),
        }
    }

    fn publish(&self, event: WidgetEvent) {
        if self.events.send(event).is_err() {
            debug!("renderer gone, dropping widget event");
        }
    }
}

fn cached_view(
    cached: &CachedState,
    status_line: &str,
    include_stale: bool,
    armed: bool,
    now_ms: i64,
) -> ViewModel {
    let label = cached
        .updated_label
        .as_deref()
        .unwrap_or(UPDATED_PLACEHOLDER);
    ViewModel {
        status_line: status_line.to_owned(),
        updated_line: stale_suffix(label, cached.last_success_ms, include_stale, now_ms),
        rows: rows_from_cache(cached.raw_payload.as_deref(), now_ms),
        armed,
    }
}
