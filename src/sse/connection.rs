//! Server-push connection manager.
//!
//! A connection moves through `Connecting -> Open`, and on failure either
//! back to `Connecting` (an open stream broke; the transport re-establishes
//! it after the server's `retry:` hint, like a browser EventSource) or to
//! `Closed` (the server could not be reached or refused the stream). What
//! happens after `Closed` is the error policy's call: by default the
//! connection is reopened with identical arguments after a fixed delay,
//! forever.

use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::Config;
use crate::logging::{
    log, log_reconnect_scheduled, log_stream_closed, log_stream_error, log_stream_open, obj, v_str,
    Domain, Level,
};
use crate::sse::parser::{SseEvent, SseParser};
use crate::sse::transport::{ByteStream, EventTransport, HttpTransport, StreamError};

/// Used when an open stream breaks and the server never sent `retry:`
pub const DEFAULT_RETRY: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closed,
}

impl ReadyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadyState::Connecting => "connecting",
            ReadyState::Open => "open",
            ReadyState::Closed => "closed",
        }
    }
}

/// Delay before reopening a closed connection. `attempt` counts consecutive
/// failures, starting at 1.
pub trait ReconnectPolicy: Send + Sync + 'static {
    fn delay(&self, attempt: u64) -> Duration;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay(pub Duration);

impl Default for FixedDelay {
    fn default() -> Self {
        FixedDelay(Duration::from_secs(5))
    }
}

impl ReconnectPolicy for FixedDelay {
    fn delay(&self, _attempt: u64) -> Duration {
        self.0
    }
}

pub type Listener = Box<dyn FnMut(&SseEvent) + Send>;
pub type ErrorHandler = Box<dyn FnMut(&StreamError) + Send>;

/// One listener per expected event type.
#[derive(Default)]
pub struct Listeners {
    by_event: HashMap<String, Listener>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, event: &str, listener: F) -> Self
    where
        F: FnMut(&SseEvent) + Send + 'static,
    {
        self.by_event.insert(event.to_string(), Box::new(listener));
        self
    }

    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.by_event.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    fn dispatch(&mut self, event: &SseEvent) -> bool {
        match self.by_event.get_mut(&event.event) {
            Some(listener) => {
                listener(event);
                true
            }
            None => false,
        }
    }
}

/// What to do when a connection fails.
pub enum OnError {
    /// Reopen closed connections after the reconnect policy's delay
    Reconnect,
    /// Hand the error to the caller; a closed connection stays closed
    Custom(ErrorHandler),
    /// Hand the error to the caller and still reopen closed connections
    Observe(ErrorHandler),
}

impl From<Option<ErrorHandler>> for OnError {
    fn from(handler: Option<ErrorHandler>) -> Self {
        match handler {
            Some(h) => OnError::Custom(h),
            None => OnError::Reconnect,
        }
    }
}

/// Opens server-push connections against one backend.
#[derive(Clone)]
pub struct StreamClient {
    base_url: String,
    transport: Arc<dyn EventTransport>,
    policy: Arc<dyn ReconnectPolicy>,
}

impl StreamClient {
    pub fn new(cfg: &Config) -> Result<Self, StreamError> {
        let transport = HttpTransport::new(cfg.http_timeout())?;
        Ok(Self::with_transport(
            &cfg.backend_url,
            Arc::new(transport),
            Arc::new(FixedDelay(cfg.reconnect_delay())),
        ))
    }

    pub fn with_transport(
        base_url: &str,
        transport: Arc<dyn EventTransport>,
        policy: Arc<dyn ReconnectPolicy>,
    ) -> Self {
        Self {
            base_url: crate::config::normalize_base_url(base_url),
            transport,
            policy,
        }
    }

    /// Open `endpoint` with an optional custom error handler. Returns `None`
    /// when the connection cannot be constructed; callers treat that as "no
    /// stream available".
    pub fn open(
        &self,
        endpoint: &str,
        listeners: Listeners,
        on_error: Option<ErrorHandler>,
    ) -> Option<StreamHandle> {
        self.open_with(endpoint, listeners, on_error.into())
    }

    pub fn open_with(
        &self,
        endpoint: &str,
        listeners: Listeners,
        on_error: OnError,
    ) -> Option<StreamHandle> {
        let url = format!("{}{}", self.base_url, endpoint);
        if let Err(err) = url::Url::parse(&url) {
            construct_failed(&url, &err.to_string());
            return None;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(rt) => rt,
            Err(err) => {
                construct_failed(&url, &err.to_string());
                return None;
            }
        };

        let shared = Arc::new(Shared {
            state: Mutex::new(ReadyState::Connecting),
            closed: AtomicBool::new(false),
        });
        let conn = Connection {
            url: url.clone(),
            transport: self.transport.clone(),
            policy: self.policy.clone(),
            listeners,
            on_error,
            shared: shared.clone(),
            last_event_id: None,
            retry: DEFAULT_RETRY,
        };
        let task = runtime.spawn(conn.run());
        Some(StreamHandle { url, shared, task })
    }
}

fn construct_failed(url: &str, error: &str) {
    log(
        Level::Error,
        Domain::Stream,
        "construct_failed",
        obj(&[("endpoint", v_str(url)), ("error", v_str(error))]),
    );
}

struct Shared {
    state: Mutex<ReadyState>,
    closed: AtomicBool,
}

impl Shared {
    fn set(&self, next: ReadyState) {
        if let Ok(mut state) = self.state.lock() {
            *state = if self.closed.load(Ordering::SeqCst) { ReadyState::Closed } else { next };
        }
    }

    fn get(&self) -> ReadyState {
        self.state.lock().map(|s| *s).unwrap_or(ReadyState::Closed)
    }
}

/// Owner's side of a connection. Dropping it closes the connection.
pub struct StreamHandle {
    url: String,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn ready_state(&self) -> ReadyState {
        self.shared.get()
    }

    /// Stop the connection and any pending reconnect. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.set(ReadyState::Closed);
        self.task.abort();
        log_stream_closed(&self.url);
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

struct Connection {
    url: String,
    transport: Arc<dyn EventTransport>,
    policy: Arc<dyn ReconnectPolicy>,
    listeners: Listeners,
    on_error: OnError,
    shared: Arc<Shared>,
    last_event_id: Option<String>,
    retry: Duration,
}

impl Connection {
    async fn run(mut self) {
        let mut failures: u64 = 0;
        loop {
            self.shared.set(ReadyState::Connecting);
            let err = match self.transport.connect(&self.url, self.last_event_id.as_deref()).await {
                Ok(body) => {
                    failures = 0;
                    self.shared.set(ReadyState::Open);
                    log_stream_open(&self.url);
                    let err = self.pump(body).await;
                    self.shared.set(ReadyState::Connecting);
                    err
                }
                Err(err) => {
                    self.shared.set(ReadyState::Closed);
                    err
                }
            };

            let ready = self.shared.get();
            log_stream_error(&self.url, &err.to_string(), ready.as_str());

            let reopen = match &mut self.on_error {
                OnError::Reconnect => true,
                OnError::Custom(handler) => {
                    handler(&err);
                    false
                }
                OnError::Observe(handler) => {
                    handler(&err);
                    true
                }
            };

            if err.is_interruption() {
                sleep(self.retry).await;
                continue;
            }
            if !reopen {
                return;
            }

            failures += 1;
            let delay = self.policy.delay(failures);
            log_reconnect_scheduled(&self.url, delay.as_millis() as u64, failures);
            sleep(delay).await;
        }
    }

    async fn pump(&mut self, mut body: ByteStream) -> StreamError {
        let mut parser = SseParser::new();
        let outcome = loop {
            match body.next().await {
                Some(Ok(chunk)) => {
                    for event in parser.feed(&chunk) {
                        if !self.listeners.dispatch(&event) {
                            log(
                                Level::Debug,
                                Domain::Stream,
                                "unhandled_event",
                                obj(&[("endpoint", v_str(&self.url)), ("event_type", v_str(&event.event))]),
                            );
                        }
                    }
                }
                Some(Err(err)) => break err,
                None => break StreamError::Ended,
            }
        };
        if let Some(id) = parser.last_event_id() {
            self.last_event_id = Some(id.to_string());
        }
        if let Some(retry) = parser.retry() {
            self.retry = retry;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::transport::ScriptedTransport;
    use bytes::Bytes;

    const BASE: &str = "http://backend:8000/";

    fn client(transport: &ScriptedTransport) -> StreamClient {
        StreamClient::with_transport(BASE, Arc::new(transport.clone()), Arc::new(FixedDelay::default()))
    }

    fn collect(event: &str, sink: &Arc<Mutex<Vec<String>>>) -> Listeners {
        let sink = sink.clone();
        Listeners::new().on(event, move |ev| sink.lock().unwrap().push(ev.data.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_policy_reconnects_after_exactly_five_seconds() {
        let transport = ScriptedTransport::new();
        transport.push_failure(StreamError::Status(502));
        let handle = client(&transport).open("/api/logs/stream", Listeners::new(), None).unwrap();

        sleep(Duration::from_millis(4_999)).await;
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(handle.ready_state(), ReadyState::Closed);

        sleep(Duration::from_millis(2)).await;
        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].at - calls[0].at, Duration::from_millis(5_000));
        assert_eq!(calls[0].url, "http://backend:8000/api/logs/stream");
        assert_eq!(calls[0].url, calls[1].url);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_indefinitely() {
        let transport = ScriptedTransport::new();
        let _handle = client(&transport).open("/api/statistics/stream", Listeners::new(), None).unwrap();
        sleep(Duration::from_secs(60) + Duration::from_millis(1)).await;
        let calls = transport.calls();
        assert_eq!(calls.len(), 13);
        for pair in calls.windows(2) {
            assert_eq!(pair[1].at - pair[0].at, Duration::from_secs(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_handler_owns_policy() {
        let transport = ScriptedTransport::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let handler: ErrorHandler = Box::new(move |e: &StreamError| sink.lock().unwrap().push(e.clone()));
        let handle = client(&transport)
            .open("/api/logs/stream", Listeners::new(), Some(handler))
            .unwrap();

        sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(handle.ready_state(), ReadyState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observe_handler_still_reconnects() {
        let transport = ScriptedTransport::new();
        let errors = Arc::new(Mutex::new(0u32));
        let sink = errors.clone();
        let _handle = client(&transport)
            .open_with(
                "/api/logs/stream",
                Listeners::new(),
                OnError::Observe(Box::new(move |_: &StreamError| *sink.lock().unwrap() += 1)),
            )
            .unwrap();
        sleep(Duration::from_millis(10_001)).await;
        assert_eq!(transport.calls().len(), 3);
        assert_eq!(*errors.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatches_by_event_type_in_order() {
        let transport = ScriptedTransport::new();
        transport.push_open_body(
            "event: ping\ndata: {\"status\":\"connected\"}\n\n\
             event: log\ndata: 1\n\n\
             event: other\ndata: x\n\n\
             event: log\ndata: 2\n\n",
        );
        let logs = Arc::new(Mutex::new(Vec::new()));
        let pings = Arc::new(Mutex::new(Vec::new()));
        let listeners = collect("log", &logs);
        let pings_sink = pings.clone();
        let listeners = listeners.on("ping", move |ev| pings_sink.lock().unwrap().push(ev.data.clone()));
        let handle = client(&transport).open("/api/logs/stream", listeners, None).unwrap();

        sleep(Duration::from_millis(10)).await;
        assert_eq!(*logs.lock().unwrap(), vec!["1".to_string(), "2".to_string()]);
        assert_eq!(pings.lock().unwrap().len(), 1);
        assert_eq!(handle.ready_state(), ReadyState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_stream_resumes_with_retry_hint_and_last_id() {
        let transport = ScriptedTransport::new();
        transport.push_body("retry: 1000\nid: 17\nevent: log\ndata: a\n\n");
        transport.push_open_body("event: log\ndata: b\n\n");
        let logs = Arc::new(Mutex::new(Vec::new()));
        let handle = client(&transport).open("/api/logs/stream", collect("log", &logs), None).unwrap();

        sleep(Duration::from_millis(1_001)).await;
        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].at - calls[0].at, Duration::from_millis(1_000));
        assert_eq!(calls[1].last_event_id.as_deref(), Some("17"));
        assert_eq!(*logs.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(handle.ready_state(), ReadyState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mid_stream_failure_resumes_after_default_retry() {
        let transport = ScriptedTransport::new();
        transport.push_chunks(vec![
            Ok(Bytes::from_static(b"id: 4\nevent: log\ndata: a\n\n")),
            Err(StreamError::Interrupted("connection reset".into())),
        ]);
        transport.push_open_body("event: log\ndata: b\n\n");
        let logs = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let handle = client(&transport)
            .open_with(
                "/api/logs/stream",
                collect("log", &logs),
                OnError::Observe(Box::new(move |e: &StreamError| sink.lock().unwrap().push(e.clone()))),
            )
            .unwrap();

        sleep(DEFAULT_RETRY + Duration::from_millis(1)).await;
        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].at - calls[0].at, DEFAULT_RETRY);
        assert_eq!(calls[1].last_event_id.as_deref(), Some("4"));
        let errors = errors.lock().unwrap().clone();
        assert_eq!(errors, vec![StreamError::Interrupted("connection reset".into())]);
        assert!(errors[0].is_interruption());
        assert!(!StreamError::Status(502).is_interruption());
        assert_eq!(*logs.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(handle.ready_state(), ReadyState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_reconnect() {
        let transport = ScriptedTransport::new();
        let handle = client(&transport).open("/api/logs/stream", Listeners::new(), None).unwrap();
        sleep(Duration::from_millis(100)).await;
        handle.close();
        handle.close();
        sleep(Duration::from_secs(20)).await;
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(handle.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_unparseable_url_yields_no_handle() {
        let transport = ScriptedTransport::new();
        let c = StreamClient::with_transport("not a url", Arc::new(transport), Arc::new(FixedDelay::default()));
        assert!(c.open("/api/logs/stream", Listeners::new(), None).is_none());
    }

    #[test]
    fn test_no_runtime_yields_no_handle() {
        let transport = ScriptedTransport::new();
        assert!(client(&transport).open("/api/logs/stream", Listeners::new(), None).is_none());
    }

    #[test]
    fn test_listener_registration() {
        let l = Listeners::new().on("ping", |_| {}).on("log", |_| {});
        assert_eq!(l.event_types(), vec!["log", "ping"]);
    }
}
