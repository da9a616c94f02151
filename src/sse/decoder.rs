use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::logging::{log_decode_error, log_empty_payload, log_event_received};
use crate::sse::parser::SseEvent;

pub const LOG_EVENT: &str = "log";
pub const STATISTICS_EVENT: &str = "statistics";
pub const PING_EVENT: &str = "ping";

/// Outcome of decoding one event payload. Only `Value` carries data; the
/// other two are skipped by callers and never end the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    Value(T),
    Empty,
    Malformed(String),
}

impl<T> Decoded<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            Decoded::Value(v) => Some(v),
            _ => None,
        }
    }
}

pub fn decode<T: DeserializeOwned>(event: &SseEvent) -> Decoded<T> {
    log_event_received(&event.event);
    if event.data.trim().is_empty() {
        log_empty_payload(&event.event);
        return Decoded::Empty;
    }
    match serde_json::from_str::<T>(&event.data) {
        Ok(v) => Decoded::Value(v),
        Err(err) => {
            log_decode_error(&event.event, &err.to_string(), &event.data);
            Decoded::Malformed(err.to_string())
        }
    }
}

/// Keepalive payloads are informational; any content proves liveness.
pub fn decode_ping(event: &SseEvent) -> Option<Value> {
    decode::<Value>(event).into_value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogRecord;

    #[test]
    fn test_valid_payload() {
        let ev = SseEvent::new(
            LOG_EVENT,
            r#"{"timestamp":"2025-01-01T00:00:00","log_level":"INFO","message":"ok"}"#,
        );
        let rec = decode::<LogRecord>(&ev).into_value().unwrap();
        assert_eq!(rec.message, "ok");
    }

    #[test]
    fn test_empty_payload_skipped() {
        assert_eq!(decode::<LogRecord>(&SseEvent::new(LOG_EVENT, "")), Decoded::Empty);
        assert_eq!(decode::<LogRecord>(&SseEvent::new(LOG_EVENT, "  ")), Decoded::Empty);
    }

    #[test]
    fn test_malformed_payload_skipped() {
        let d = decode::<LogRecord>(&SseEvent::new(LOG_EVENT, "{not json"));
        assert!(matches!(d, Decoded::Malformed(_)));
        // valid JSON, wrong shape
        let d = decode::<LogRecord>(&SseEvent::new(LOG_EVENT, r#"{"status":"connected"}"#));
        assert!(matches!(d, Decoded::Malformed(_)));
    }

    #[test]
    fn test_ping_best_effort() {
        let ev = SseEvent::new(PING_EVENT, r#"{"status":"connected"}"#);
        assert_eq!(decode_ping(&ev).unwrap()["status"], "connected");
        assert!(decode_ping(&SseEvent::new(PING_EVENT, "ping")).is_none());
    }
}
