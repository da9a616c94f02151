//! Incremental `text/event-stream` parser.
//!
//! Bytes arrive in arbitrary chunks; lines may be split anywhere, including
//! between the CR and LF of a CRLF terminator.

use std::time::Duration;

pub const DEFAULT_EVENT_TYPE: &str = "message";

/// Longest line kept; the rest of a longer line is discarded with it.
pub const MAX_LINE_BYTES: usize = 1 << 20;
/// Largest `data` accumulated for one event; bigger events are dropped.
pub const MAX_EVENT_BYTES: usize = 4 << 20;

const BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    pub fn new(event: &str, data: &str) -> Self {
        Self { event: event.to_string(), data: data.to_string(), id: None }
    }
}

#[derive(Debug, Default)]
pub struct SseParser {
    line: Vec<u8>,
    line_too_long: bool,
    skip_lf: bool,
    bom_checked: bool,
    event_type: String,
    data: String,
    has_data: bool,
    data_too_long: bool,
    last_event_id: Option<String>,
    retry_ms: Option<u64>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last `id:` seen, kept across events (and across reconnects by the caller).
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Reconnection time requested by the server with `retry:`.
    pub fn retry(&self) -> Option<Duration> {
        self.retry_ms.map(Duration::from_millis)
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut out = Vec::new();
        for &b in chunk {
            if !self.bom_checked {
                // `line` holds the BOM prefix matched so far
                if self.line.len() < BOM.len() && b == BOM[self.line.len()] {
                    self.line.push(b);
                    if self.line.len() == BOM.len() {
                        self.line.clear();
                        self.bom_checked = true;
                    }
                    continue;
                }
                self.bom_checked = true;
            }
            if self.skip_lf {
                self.skip_lf = false;
                if b == b'\n' {
                    continue;
                }
            }
            match b {
                b'\r' => {
                    self.skip_lf = true;
                    self.end_line(&mut out);
                }
                b'\n' => self.end_line(&mut out),
                _ if self.line_too_long => {}
                _ if self.line.len() >= MAX_LINE_BYTES => {
                    self.line.clear();
                    self.line_too_long = true;
                }
                _ => self.line.push(b),
            }
        }
        out
    }

    fn end_line(&mut self, out: &mut Vec<SseEvent>) {
        if self.line_too_long {
            self.line_too_long = false;
            return;
        }
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();

        if line.is_empty() {
            if let Some(ev) = self.dispatch() {
                out.push(ev);
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line.as_str(), ""),
        };

        match field {
            "event" => self.event_type = value.to_string(),
            "data" => {
                self.has_data = true;
                if self.data.len() + value.len() >= MAX_EVENT_BYTES {
                    self.data.clear();
                    self.data_too_long = true;
                }
                if !self.data_too_long {
                    self.data.push_str(value);
                    self.data.push('\n');
                }
            }
            "id" if !value.contains('\0') => self.last_event_id = Some(value.to_string()),
            "retry" if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) => {
                self.retry_ms = value.parse().ok();
            }
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event_type = std::mem::take(&mut self.event_type);
        if !self.has_data {
            return None;
        }
        self.has_data = false;
        let mut data = std::mem::take(&mut self.data);
        if std::mem::take(&mut self.data_too_long) {
            return None;
        }
        if data.ends_with('\n') {
            data.pop();
        }
        Some(SseEvent {
            event: if event_type.is_empty() { DEFAULT_EVENT_TYPE.to_string() } else { event_type },
            data,
            id: self.last_event_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_event() {
        let mut p = SseParser::new();
        let evs = p.feed(b"event: log\ndata: {\"message\":\"hi\"}\nid: 42\n\n");
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].event, "log");
        assert_eq!(evs[0].data, "{\"message\":\"hi\"}");
        assert_eq!(evs[0].id.as_deref(), Some("42"));
        assert_eq!(p.last_event_id(), Some("42"));
    }

    #[test]
    fn test_chunk_split_mid_line_and_crlf() {
        let mut p = SseParser::new();
        assert!(p.feed(b"event: pi").is_empty());
        assert!(p.feed(b"ng\r").is_empty());
        assert!(p.feed(b"\ndata: {}\r").is_empty());
        let evs = p.feed(b"\n\r\n");
        assert_eq!(evs, vec![SseEvent::new("ping", "{}")]);
    }

    #[test]
    fn test_multiline_data_and_default_type() {
        let mut p = SseParser::new();
        let evs = p.feed(b"data: a\ndata:b\n\n");
        assert_eq!(evs[0].event, DEFAULT_EVENT_TYPE);
        assert_eq!(evs[0].data, "a\nb");
    }

    #[test]
    fn test_comments_and_blank_blocks_ignored() {
        let mut p = SseParser::new();
        let evs = p.feed(b": keepalive\n\nevent: log\n\n");
        assert!(evs.is_empty());
        // event type does not leak into the next block
        let evs = p.feed(b"data: x\n\n");
        assert_eq!(evs[0].event, DEFAULT_EVENT_TYPE);
    }

    #[test]
    fn test_empty_data_field_still_dispatches() {
        let mut p = SseParser::new();
        let evs = p.feed(b"event: log\ndata:\n\n");
        assert_eq!(evs, vec![SseEvent::new("log", "")]);
    }

    #[test]
    fn test_retry_field() {
        let mut p = SseParser::new();
        p.feed(b"retry: 1500\n\nretry: soon\n\n");
        assert_eq!(p.retry(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_leading_bom_is_stripped_even_when_split() {
        let mut p = SseParser::new();
        assert!(p.feed(b"\xEF\xBB").is_empty());
        let evs = p.feed(b"\xBFevent: log\ndata: x\n\n");
        assert_eq!(evs, vec![SseEvent::new("log", "x")]);

        // only the first one counts
        let evs = p.feed(b"\xEF\xBB\xBFdata: y\n\n");
        assert!(evs.is_empty());
    }

    #[test]
    fn test_overlong_line_is_discarded_and_parsing_continues() {
        let mut p = SseParser::new();
        let mut body = b"event: log\ndata: ".to_vec();
        body.extend(std::iter::repeat(b'a').take(MAX_LINE_BYTES + 10));
        assert!(p.feed(&body).is_empty());
        assert!(p.line.len() <= MAX_LINE_BYTES);

        let evs = p.feed(b"\ndata: ok\n\n");
        assert_eq!(evs, vec![SseEvent::new("log", "ok")]);
    }

    #[test]
    fn test_oversized_event_is_dropped() {
        let mut p = SseParser::new();
        let line = format!("data: {}\n", "b".repeat(MAX_LINE_BYTES - 16));
        let mut body = String::from("event: log\n");
        for _ in 0..5 {
            body.push_str(&line);
        }
        body.push('\n');
        assert!(p.feed(body.as_bytes()).is_empty());
        assert!(p.data.is_empty());

        let evs = p.feed(b"event: log\ndata: small\n\n");
        assert_eq!(evs, vec![SseEvent::new("log", "small")]);
    }
}
