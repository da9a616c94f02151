//! Structured logging for the dashboard client.
//!
//! Every record is a single JSON line:
//! 1. Multi-level granularity (TRACE → FATAL), gated by `LOG_LEVEL`
//! 2. Domain categories for filtering, gated by `LOG_DOMAINS`
//! 3. Monotonic sequence numbers so interleaved stream/poll output can be ordered
//! 4. Optional JSONL sink under `LOG_DIR/<run_id>/` for later inspection

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Stream,  // SSE connect, reconnect, teardown
    Decode,  // Event payload parsing
    Poll,    // Periodic REST re-fetch
    Report,  // Test-run orchestration
    Api,     // Individual REST requests
    View,    // Dashboard state transitions
    System,  // Startup, shutdown
    Profile, // Request timing
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Stream => "stream",
            Domain::Decode => "decode",
            Domain::Poll => "poll",
            Domain::Report => "report",
            Domain::Api => "api",
            Domain::View => "view",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS is a comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Sequence counter and run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static PROFILE_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let events = std::env::var("LOG_DIR")
            .ok()
            .and_then(|base| open_run_sink(PathBuf::from(base), &run_id));
        RunContext { run_id, events }
    })
}

/// Create `<base>/<run_id>/events.jsonl` plus a small manifest.
fn open_run_sink(base: PathBuf, run_id: &str) -> Option<Mutex<BufWriter<File>>> {
    let run_dir = base.join(run_id);
    if let Err(err) = create_dir_all(&run_dir) {
        eprintln!("[log] failed to create run dir: {}", err);
        return None;
    }
    let _ = std::fs::write(
        run_dir.join("manifest.json"),
        json!({
            "run_id": run_id,
            "ts": ts_now(),
            "pid": process::id(),
            "log_dir": run_dir.to_string_lossy(),
        })
        .to_string(),
    );
    match File::create(run_dir.join("events.jsonl")) {
        Ok(file) => Some(Mutex::new(BufWriter::new(file))),
        Err(err) => {
            eprintln!("[log] failed to create events log: {}", err);
            None
        }
    }
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["authorization", "Authorization", "cookie", "Cookie", "token"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["endpoint", "event_type", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Mutex<BufWriter<File>>, line: &str) {
    if let Ok(mut w) = writer.lock() {
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }

    emit_record(level, domain.as_str(), event, fields);
}

fn build_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) -> Value {
    let ctx = ensure_run_context();
    let fields = sanitize_fields(fields);
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));
    Value::Object(entry)
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let line = build_record(level, component, event, fields).to_string();
    if let Some(events) = &ensure_run_context().events {
        write_line(events, &line);
    }
    match level {
        Level::Warn | Level::Error | Level::Fatal => eprintln!("{}", line),
        _ => println!("{}", line),
    }
}

// =============================================================================
// Stream Logs
// =============================================================================

pub fn log_stream_open(url: &str) {
    agg_increment("stream_open");
    log(
        Level::Info,
        Domain::Stream,
        "open",
        obj(&[("endpoint", v_str(url)), ("msg", v_str("connected to SSE endpoint"))]),
    );
}

pub fn log_stream_error(url: &str, error: &str, ready_state: &str) {
    agg_increment("stream_error");
    log(
        Level::Error,
        Domain::Stream,
        "error",
        obj(&[
            ("endpoint", v_str(url)),
            ("error", v_str(error)),
            ("ready_state", v_str(ready_state)),
        ]),
    );
}

pub fn log_reconnect_scheduled(url: &str, delay_ms: u64, attempt: u64) {
    agg_increment("reconnect");
    log(
        Level::Info,
        Domain::Stream,
        "reconnect_scheduled",
        obj(&[
            ("endpoint", v_str(url)),
            ("delay_ms", json!(delay_ms)),
            ("attempt", json!(attempt)),
        ]),
    );
}

pub fn log_stream_closed(url: &str) {
    log(
        Level::Info,
        Domain::Stream,
        "closed",
        obj(&[("endpoint", v_str(url))]),
    );
}

// =============================================================================
// Decode Logs
// =============================================================================

pub fn log_empty_payload(event_type: &str) {
    agg_increment("event_skipped");
    log(
        Level::Warn,
        Domain::Decode,
        "empty_payload",
        obj(&[
            ("event_type", v_str(event_type)),
            ("msg", v_str("received empty data")),
        ]),
    );
}

pub fn log_decode_error(event_type: &str, error: &str, payload: &str) {
    agg_increment("event_skipped");
    log(
        Level::Error,
        Domain::Decode,
        "malformed_payload",
        obj(&[
            ("event_type", v_str(event_type)),
            ("error", v_str(error)),
            ("payload", v_str(&truncate(payload, 256))),
        ]),
    );
}

pub fn log_event_received(event_type: &str) {
    agg_increment("event_received");
    log(
        Level::Trace,
        Domain::Decode,
        "received",
        obj(&[("event_type", v_str(event_type))]),
    );
}

// =============================================================================
// Poll / Report Logs
// =============================================================================

pub fn log_poll_result(poller: &str, token: u64, outcome: &str) {
    log(
        Level::Debug,
        Domain::Poll,
        "result",
        obj(&[
            ("poller", v_str(poller)),
            ("token", json!(token)),
            ("outcome", v_str(outcome)),
        ]),
    );
}

pub fn log_report_transition(from: &str, to: &str, detail: &str) {
    log(
        Level::Info,
        Domain::Report,
        "transition",
        obj(&[("from", v_str(from)), ("to", v_str(to)), ("msg", v_str(detail))]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Profiling scope that emits structured timing on drop.
pub struct ProfileScope {
    label: &'static str,
    context: Option<Map<String, Value>>,
    started: Instant,
    enabled: bool,
}

impl ProfileScope {
    pub fn new(label: &'static str) -> Self {
        Self::with_context(label, &[])
    }

    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        let enabled = Self::should_sample();
        Self {
            label,
            context: if enabled { Some(obj(fields)) } else { None },
            started: Instant::now(),
            enabled,
        }
    }

    fn should_sample() -> bool {
        std::env::var("PROFILE_SAMPLE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .map(|p| {
                if p >= 1.0 {
                    true
                } else if p <= 0.0 {
                    false
                } else {
                    let seq = PROFILE_SEQ.fetch_add(1, Ordering::SeqCst);
                    let bucket = (seq % 10_000) as f64 / 10_000.0;
                    bucket < p
                }
            })
            .unwrap_or(true)
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = self.context.take().unwrap_or_default();
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

// =============================================================================
// Log Aggregator for Periodic Summaries
// =============================================================================

static AGGREGATOR: OnceLock<Mutex<LogAggregator>> = OnceLock::new();

fn get_aggregator() -> &'static Mutex<LogAggregator> {
    AGGREGATOR.get_or_init(|| Mutex::new(LogAggregator::new()))
}

struct LogAggregator {
    opens: u64,
    errors: u64,
    reconnects: u64,
    received: u64,
    skipped: u64,
    last_flush: Instant,
    flush_interval_secs: u64,
}

impl LogAggregator {
    fn new() -> Self {
        Self {
            opens: 0,
            errors: 0,
            reconnects: 0,
            received: 0,
            skipped: 0,
            last_flush: Instant::now(),
            flush_interval_secs: std::env::var("LOG_FLUSH_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        }
    }

    fn increment(&mut self, event: &str) {
        match event {
            "stream_open" => self.opens += 1,
            "stream_error" => self.errors += 1,
            "reconnect" => self.reconnects += 1,
            "event_received" => self.received += 1,
            "event_skipped" => self.skipped += 1,
            _ => {}
        }
    }

    fn maybe_flush(&mut self) -> Option<Map<String, Value>> {
        if self.last_flush.elapsed().as_secs() < self.flush_interval_secs {
            return None;
        }
        let fields = obj(&[
            ("stream_opens", json!(self.opens)),
            ("stream_errors", json!(self.errors)),
            ("reconnects", json!(self.reconnects)),
            ("events_received", json!(self.received)),
            ("events_skipped", json!(self.skipped)),
        ]);
        self.opens = 0;
        self.errors = 0;
        self.reconnects = 0;
        self.received = 0;
        self.skipped = 0;
        self.last_flush = Instant::now();
        Some(fields)
    }
}

/// Call periodically to emit aggregated stream counters
pub fn tick_aggregator() {
    let flushed = match get_aggregator().lock() {
        Ok(mut agg) => agg.maybe_flush(),
        Err(_) => None,
    };
    if let Some(fields) = flushed {
        log(Level::Info, Domain::System, "aggregated_stats", fields);
    }
}

/// Increment a counter in the aggregator
pub fn agg_increment(event: &str) {
    if let Ok(mut agg) = get_aggregator().lock() {
        agg.increment(event);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }

    #[test]
    fn test_record_shape() {
        let rec = build_record(
            Level::Warn,
            "decode",
            "empty_payload",
            obj(&[
                ("event_type", v_str("log")),
                ("msg", v_str("received empty data")),
                ("token", v_str("secret")),
            ]),
        );
        assert_eq!(rec["lvl"], "WARN");
        assert_eq!(rec["component"], "decode");
        assert_eq!(rec["event_type"], "log");
        assert_eq!(rec["msg"], "received empty data");
        assert_eq!(rec["data"]["token"], "[REDACTED]");
    }

    #[test]
    fn test_run_sink_writes_manifest_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let sink = open_run_sink(dir.path().to_path_buf(), "r-test").unwrap();
        let line = build_record(Level::Info, "stream", "open", obj(&[("endpoint", v_str("/api/logs/stream"))]));
        write_line(&sink, &line.to_string());

        let run_dir = dir.path().join("r-test");
        let manifest: Value =
            serde_json::from_str(&std::fs::read_to_string(run_dir.join("manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest["run_id"], "r-test");
        let events = std::fs::read_to_string(run_dir.join("events.jsonl")).unwrap();
        let rec: Value = serde_json::from_str(events.lines().next().unwrap()).unwrap();
        assert_eq!(rec["event"], "open");
        assert_eq!(rec["endpoint"], "/api/logs/stream");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("héllo wörld", 5), "héllo...");
    }
}
