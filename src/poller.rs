//! Fixed-interval REST re-fetch.
//!
//! Each invocation of the fetch function is stamped with a token from a
//! monotonically increasing counter. A response is applied only when its
//! token is newer than the last applied one and not below the floor, which
//! is raised to the next unissued token whenever the poller is cancelled or
//! restarted. Responses that lose the race are dropped.

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::api::ApiClient;
use crate::config::TimeWindow;
use crate::error::ApiError;
use crate::logging::{log, log_poll_result, obj, v_str, Domain, Level};
use crate::types::{AnomalyParameter, ClassificationType, TimeSeriesPoint};

pub type FetchFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, ApiError>> + Send + Sync>;

pub fn fetch_fn<T, F, Fut>(f: F) -> FetchFn<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollState<T> {
    /// Last successful response; overwritten, never merged
    pub data: Option<T>,
    pub loading: bool,
    pub error: Option<String>,
    /// Consecutive failures since the last success
    pub retry_count: u32,
    pub last_update: Option<DateTime<Utc>>,
    pub applied_token: u64,
}

impl<T> Default for PollState<T> {
    fn default() -> Self {
        Self {
            data: None,
            loading: false,
            error: None,
            retry_count: 0,
            last_update: None,
            applied_token: 0,
        }
    }
}

struct Shared<T> {
    name: String,
    tx: watch::Sender<PollState<T>>,
    next_token: AtomicU64,
    floor: AtomicU64,
}

impl<T: Send + Sync + 'static> Shared<T> {
    fn fire(self: &Arc<Self>, fetch: &FetchFn<T>) {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.tx.send_modify(|s| s.loading = true);
        let fut = fetch();
        let shared = self.clone();
        tokio::spawn(async move {
            let result = fut.await;
            shared.apply(token, result);
        });
    }

    fn apply(&self, token: u64, result: Result<T, ApiError>) {
        let floor = self.floor.load(Ordering::SeqCst);
        let mut outcome = "stale";
        self.tx.send_if_modified(|s| {
            if token < floor || token <= s.applied_token {
                return false;
            }
            s.applied_token = token;
            s.loading = false;
            match result {
                Ok(data) => {
                    s.data = Some(data);
                    s.error = None;
                    s.retry_count = 0;
                    s.last_update = Some(Utc::now());
                    outcome = "applied";
                }
                Err(err) => {
                    s.error = Some(err.to_string());
                    s.retry_count += 1;
                    outcome = "failed";
                }
            }
            true
        });
        log_poll_result(&self.name, token, outcome);
    }

    /// Invalidate every token issued so far.
    fn raise_floor(&self) {
        let next = self.next_token.load(Ordering::SeqCst);
        self.floor.store(next, Ordering::SeqCst);
        self.tx.send_modify(|s| s.loading = false);
    }
}

/// Shortest schedule accepted; `tokio::time::interval` rejects zero.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Owner's side of a running poll loop. Dropping it cancels the loop.
pub struct Poller<T> {
    shared: Arc<Shared<T>>,
    fetch: FetchFn<T>,
    period: Duration,
    task: Option<JoinHandle<()>>,
}

impl<T: Send + Sync + 'static> Poller<T> {
    /// Fetch immediately, then every `period`. Must be called inside a tokio
    /// runtime.
    pub fn start(name: &str, fetch: FetchFn<T>, period: Duration) -> Self {
        let (tx, _) = watch::channel(PollState::default());
        let shared = Arc::new(Shared {
            name: name.to_string(),
            tx,
            next_token: AtomicU64::new(1),
            floor: AtomicU64::new(1),
        });
        let mut poller = Self { shared, fetch, period: period.max(MIN_PERIOD), task: None };
        poller.spawn();
        poller
    }

    fn spawn(&mut self) {
        let shared = self.shared.clone();
        let fetch = self.fetch.clone();
        let period = self.period;
        log(
            Level::Info,
            Domain::Poll,
            "start",
            obj(&[
                ("poller", v_str(&self.shared.name)),
                ("interval_ms", serde_json::json!(period.as_millis() as u64)),
            ]),
        );
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                shared.fire(&fetch);
            }
        }));
    }

    /// Replace the fetch function and period. The old interval stops, any of
    /// its in-flight responses are discarded, and the new one fetches at once.
    pub fn restart(&mut self, fetch: FetchFn<T>, period: Duration) {
        self.cancel();
        self.fetch = fetch;
        self.period = period.max(MIN_PERIOD);
        self.spawn();
    }

    /// Fetch now, outside the regular schedule. No-op once cancelled.
    pub fn refresh(&self) {
        if self.is_running() {
            self.shared.fire(&self.fetch);
        }
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.shared.raise_floor();
            log(Level::Info, Domain::Poll, "cancel", obj(&[("poller", v_str(&self.shared.name))]));
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn subscribe(&self) -> watch::Receiver<PollState<T>> {
        self.shared.tx.subscribe()
    }
}

impl<T: Clone + Send + Sync + 'static> Poller<T> {
    pub fn snapshot(&self) -> PollState<T> {
        self.shared.tx.borrow().clone()
    }
}

impl<T> Drop for Poller<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let next = self.shared.next_token.load(Ordering::SeqCst);
            self.shared.floor.store(next, Ordering::SeqCst);
        }
    }
}

pub type FetchFactory<K, T> = Arc<dyn Fn(K) -> (FetchFn<T>, Duration) + Send + Sync>;

/// A poller whose fetch depends on a user-selected key (time window,
/// classification type). Changing the key restarts the schedule.
pub struct KeyedPoller<K, T> {
    key: K,
    poller: Poller<T>,
    factory: FetchFactory<K, T>,
}

impl<K, T> KeyedPoller<K, T>
where
    K: Copy + PartialEq + std::fmt::Debug,
    T: Send + Sync + 'static,
{
    pub fn start(name: &str, key: K, factory: FetchFactory<K, T>) -> Self {
        let (fetch, period) = factory(key);
        Self {
            key,
            poller: Poller::start(name, fetch, period),
            factory,
        }
    }

    pub fn key(&self) -> K {
        self.key
    }

    /// Returns whether the schedule was restarted.
    pub fn set_key(&mut self, key: K) -> bool {
        if key == self.key {
            return false;
        }
        log(
            Level::Info,
            Domain::Poll,
            "key_changed",
            obj(&[
                ("poller", v_str(&self.poller.shared.name)),
                ("from", v_str(&format!("{:?}", self.key))),
                ("to", v_str(&format!("{:?}", key))),
            ]),
        );
        let (fetch, period) = (self.factory)(key);
        self.poller.restart(fetch, period);
        self.key = key;
        true
    }

    pub fn poller(&self) -> &Poller<T> {
        &self.poller
    }

    pub fn poller_mut(&mut self) -> &mut Poller<T> {
        &mut self.poller
    }
}

/// Time-series chart data, refreshed per the selected window.
pub fn time_series_poller(api: ApiClient, window: TimeWindow) -> KeyedPoller<TimeWindow, Vec<TimeSeriesPoint>> {
    let factory: FetchFactory<TimeWindow, Vec<TimeSeriesPoint>> = Arc::new(move |w: TimeWindow| {
        let api = api.clone();
        let fetch = fetch_fn(move || {
            let api = api.clone();
            async move { api.fetch_time_series(w).await }
        });
        (fetch, w.refresh_interval())
    });
    KeyedPoller::start("time_series", window, factory)
}

/// Most recent anomaly parameters of the selected type.
pub fn anomaly_poller(
    api: ApiClient,
    classification: ClassificationType,
    limit: usize,
    period: Duration,
) -> KeyedPoller<ClassificationType, Vec<AnomalyParameter>> {
    let factory: FetchFactory<ClassificationType, Vec<AnomalyParameter>> =
        Arc::new(move |ct: ClassificationType| {
            let api = api.clone();
            let fetch = fetch_fn(move || {
                let api = api.clone();
                async move { api.fetch_anomalies(ct, limit).await }
            });
            (fetch, period)
        });
    KeyedPoller::start("anomalies", classification, factory)
}
