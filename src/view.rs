//! Dashboard view model: (DashboardState, ViewEvent) -> DashboardState
//!
//! Stream listeners never touch state. They forward raw events over a
//! channel to one dispatcher task, which applies `reduce` and publishes
//! the result on a `watch` channel.

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::buffer::LogBuffer;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::sse::{
    decode, decode_ping, Decoded, ErrorHandler, Listeners, OnError, ReadyState, SseEvent,
    StreamClient, StreamError, StreamHandle, LOGS_STREAM, LOG_EVENT, PING_EVENT, STATISTICS_EVENT,
    STATISTICS_STREAM,
};
use crate::stats::{from_payload, StatisticsSnapshot};
use crate::types::{LogRecord, StatisticsPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Logs,
    Statistics,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::Logs, StreamKind::Statistics];

    pub fn endpoint(&self) -> &'static str {
        match self {
            StreamKind::Logs => LOGS_STREAM,
            StreamKind::Statistics => STATISTICS_STREAM,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Logs => "logs",
            StreamKind::Statistics => "statistics",
        }
    }

    fn data_event(&self) -> &'static str {
        match self {
            StreamKind::Logs => LOG_EVENT,
            StreamKind::Statistics => STATISTICS_EVENT,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ViewEvent {
    Sse(StreamKind, SseEvent),
    StreamError(StreamKind, String),
    SetFilter(String),
}

#[derive(Debug, Clone, Default)]
pub struct DashboardState {
    pub logs: LogBuffer,
    pub stats: StatisticsSnapshot,
    /// Set on a stream error; cleared by valid data or any ping
    pub logs_error: Option<String>,
    pub stats_error: Option<String>,
    pub last_ping: Option<Value>,
    pub pings: u64,
    /// Log records accepted since start, including ones since evicted
    pub received: u64,
    /// Read-time filter over the log buffer
    pub filter: String,
}

impl DashboardState {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            logs: LogBuffer::with_capacity(capacity),
            ..Self::default()
        }
    }

    pub fn visible_logs(&self) -> Vec<&LogRecord> {
        self.logs.filter(&self.filter)
    }

    /// Visible records that arrived after the first `seen` arrivals.
    pub fn visible_since(&self, seen: u64) -> Vec<&LogRecord> {
        let fresh = self.received.saturating_sub(seen).min(self.logs.len() as u64) as usize;
        self.logs.filter_newest(fresh, &self.filter)
    }

    pub fn error(&self, kind: StreamKind) -> Option<&str> {
        match kind {
            StreamKind::Logs => self.logs_error.as_deref(),
            StreamKind::Statistics => self.stats_error.as_deref(),
        }
    }

    fn error_slot(&mut self, kind: StreamKind) -> &mut Option<String> {
        match kind {
            StreamKind::Logs => &mut self.logs_error,
            StreamKind::Statistics => &mut self.stats_error,
        }
    }
}

/// Apply one event. Returns whether the state changed.
pub fn reduce(state: &mut DashboardState, event: ViewEvent) -> bool {
    match event {
        ViewEvent::Sse(kind, ev) if ev.event == PING_EVENT => {
            // liveness even when the payload does not decode
            state.last_ping = decode_ping(&ev).or(state.last_ping.take());
            state.pings += 1;
            *state.error_slot(kind) = None;
            true
        }
        ViewEvent::Sse(StreamKind::Logs, ev) if ev.event == LOG_EVENT => {
            match decode::<LogRecord>(&ev) {
                Decoded::Value(record) => {
                    state.logs = state.logs.append(record);
                    state.received += 1;
                    state.logs_error = None;
                    true
                }
                Decoded::Empty | Decoded::Malformed(_) => false,
            }
        }
        ViewEvent::Sse(StreamKind::Statistics, ev) if ev.event == STATISTICS_EVENT => {
            match decode::<StatisticsPayload>(&ev) {
                Decoded::Value(payload) => {
                    state.stats = from_payload(&payload);
                    state.stats_error = None;
                    true
                }
                Decoded::Empty | Decoded::Malformed(_) => false,
            }
        }
        ViewEvent::Sse(kind, ev) => {
            log(
                Level::Debug,
                Domain::View,
                "ignored_event",
                obj(&[("stream", v_str(kind.as_str())), ("event_type", v_str(&ev.event))]),
            );
            false
        }
        ViewEvent::StreamError(kind, message) => {
            let slot = state.error_slot(kind);
            if slot.as_deref() == Some(message.as_str()) {
                return false;
            }
            *slot = Some(message);
            true
        }
        ViewEvent::SetFilter(filter) => {
            if state.filter == filter {
                return false;
            }
            state.filter = filter;
            true
        }
    }
}

/// Live view over both server-push streams.
pub struct Dashboard {
    streams: Vec<(StreamKind, StreamHandle)>,
    events: mpsc::UnboundedSender<ViewEvent>,
    state: watch::Receiver<DashboardState>,
    dispatcher: JoinHandle<()>,
}

impl Dashboard {
    /// Open both streams and start the dispatcher. Must be called inside a
    /// tokio runtime. A stream that cannot be constructed shows up as an
    /// error in the state instead of failing the whole view.
    pub fn start(client: &StreamClient, capacity: usize) -> Self {
        let (events, mut rx) = mpsc::unbounded_channel::<ViewEvent>();
        let (state_tx, state) = watch::channel(DashboardState::with_capacity(capacity));

        let dispatcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                state_tx.send_if_modified(|s| reduce(s, event));
            }
        });

        let mut streams = Vec::new();
        for kind in StreamKind::ALL {
            match open_stream(client, kind, events.clone()) {
                Some(handle) => streams.push((kind, handle)),
                None => {
                    let _ = events.send(ViewEvent::StreamError(kind, "stream unavailable".to_string()));
                }
            }
        }
        log(
            Level::Info,
            Domain::View,
            "started",
            obj(&[("streams", serde_json::json!(streams.len())), ("capacity", serde_json::json!(capacity))]),
        );

        Self { streams, events, state, dispatcher }
    }

    pub fn snapshot(&self) -> DashboardState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DashboardState> {
        self.state.clone()
    }

    pub fn set_filter(&self, filter: &str) {
        let _ = self.events.send(ViewEvent::SetFilter(filter.to_string()));
    }

    pub fn ready_state(&self, kind: StreamKind) -> ReadyState {
        self.streams
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, h)| h.ready_state())
            .unwrap_or(ReadyState::Closed)
    }

    pub fn close(&self) {
        for (_, handle) in &self.streams {
            handle.close();
        }
        self.dispatcher.abort();
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_stream(
    client: &StreamClient,
    kind: StreamKind,
    events: mpsc::UnboundedSender<ViewEvent>,
) -> Option<StreamHandle> {
    let forward = |events: mpsc::UnboundedSender<ViewEvent>| {
        move |ev: &SseEvent| {
            let _ = events.send(ViewEvent::Sse(kind, ev.clone()));
        }
    };
    let listeners = Listeners::new()
        .on(kind.data_event(), forward(events.clone()))
        .on(PING_EVENT, forward(events.clone()));
    let on_error: ErrorHandler = Box::new(move |err: &StreamError| {
        let _ = events.send(ViewEvent::StreamError(kind, err.to_string()));
    });
    client.open_with(kind.endpoint(), listeners, OnError::Observe(on_error))
}
