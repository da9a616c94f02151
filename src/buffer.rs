use std::sync::Arc;

use crate::types::LogRecord;

/// Maximum number of log records kept for display
pub const DEFAULT_CAPACITY: usize = 100;

/// Most recent log records in arrival order.
///
/// `append` returns a new buffer and leaves `self` untouched, so a snapshot
/// handed to a renderer never changes underneath it when the next event
/// arrives. Records are shared between snapshots through `Arc`.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    records: Vec<Arc<LogRecord>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append one record, dropping the oldest ones beyond capacity.
    pub fn append(&self, record: LogRecord) -> LogBuffer {
        let keep = self.capacity.saturating_sub(1).min(self.records.len());
        let start = self.records.len() - keep;
        let mut records = Vec::with_capacity(keep + 1);
        records.extend(self.records[start..].iter().cloned());
        if self.capacity > 0 {
            records.push(Arc::new(record));
        }
        LogBuffer { records, capacity: self.capacity }
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogRecord> {
        self.records.iter().map(|r| r.as_ref())
    }

    pub fn latest(&self) -> Option<&LogRecord> {
        self.records.last().map(|r| r.as_ref())
    }

    /// Records whose JSON form contains `needle`, ignoring case.
    /// An empty needle matches everything.
    pub fn filter(&self, needle: &str) -> Vec<&LogRecord> {
        self.filter_newest(self.records.len(), needle)
    }

    /// `filter` restricted to the newest `count` records.
    pub fn filter_newest(&self, count: usize, needle: &str) -> Vec<&LogRecord> {
        let needle = needle.to_lowercase();
        let skip = self.records.len().saturating_sub(count);
        self.iter()
            .skip(skip)
            .filter(|r| needle.is_empty() || contains_ignore_case(r, &needle))
            .collect()
    }
}

fn contains_ignore_case(record: &LogRecord, needle: &str) -> bool {
    serde_json::to_string(record)
        .map(|s| s.to_lowercase().contains(needle))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(i: usize) -> LogRecord {
        LogRecord {
            id: Some(i as i64),
            timestamp: Utc.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap(),
            log_level: if i % 2 == 0 { "INFO" } else { "ERROR" }.to_string(),
            message: format!("PacketResponder {} for block blk_{}", i, 1000 + i),
        }
    }

    #[test]
    fn test_length_is_min_of_capacity_and_appended() {
        let mut buf = LogBuffer::new();
        for i in 0..250 {
            buf = buf.append(record(i));
            assert_eq!(buf.len(), (i + 1).min(DEFAULT_CAPACITY));
        }
    }

    #[test]
    fn test_keeps_last_hundred_in_arrival_order() {
        let mut buf = LogBuffer::new();
        for i in 0..130 {
            buf = buf.append(record(i));
        }
        let ids: Vec<i64> = buf.iter().map(|r| r.id.unwrap()).collect();
        let expected: Vec<i64> = (30..130).collect();
        assert_eq!(ids, expected);
        assert_eq!(buf.latest().unwrap().id, Some(129));
    }

    #[test]
    fn test_append_leaves_snapshot_untouched() {
        let a = LogBuffer::with_capacity(2).append(record(1)).append(record(2));
        let b = a.append(record(3));
        assert_eq!(a.iter().map(|r| r.id.unwrap()).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(b.iter().map(|r| r.id.unwrap()).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_zero_capacity_stays_empty() {
        let buf = LogBuffer::with_capacity(0).append(record(1));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_filter_is_case_insensitive_and_read_only() {
        let mut buf = LogBuffer::new();
        for i in 0..10 {
            buf = buf.append(record(i));
        }
        let errors = buf.filter("error");
        assert_eq!(errors.len(), 5);
        let one = buf.filter("BLK_1003");
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].id, Some(3));
        assert_eq!(buf.filter("").len(), 10);
        assert!(buf.filter("no such text").is_empty());
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn test_filter_newest_only_looks_at_tail() {
        let mut buf = LogBuffer::new();
        for i in 0..10 {
            buf = buf.append(record(i));
        }
        let ids = |v: Vec<&LogRecord>| v.iter().map(|r| r.id.unwrap()).collect::<Vec<_>>();
        assert_eq!(ids(buf.filter_newest(3, "")), vec![7, 8, 9]);
        assert_eq!(ids(buf.filter_newest(3, "error")), vec![7, 9]);
        assert!(buf.filter_newest(0, "").is_empty());
        assert_eq!(buf.filter_newest(50, "").len(), 10);
    }
}
