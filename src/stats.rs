use serde::Serialize;

use crate::types::{RawCounts, StatisticsPayload, SummaryStatistics};

/// Counts plus per-category percentages, replaced wholesale on every update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatisticsSnapshot {
    #[serde(flatten)]
    pub counts: RawCounts,
    pub total_events: u64,
    pub normal_percent: f64,
    pub anomaly_percent: f64,
    pub unidentified_percent: f64,
}

impl StatisticsSnapshot {
    pub fn percent_sum(&self) -> f64 {
        self.normal_percent + self.anomaly_percent + self.unidentified_percent
    }
}

/// Per-category rounding can push a valid sum this far past 100.
const ROUNDING_SLACK: f64 = 0.15;

/// Round to one decimal place.
pub fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

fn percent(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        round1(count as f64 / total as f64 * 100.0)
    }
}

/// Percentages from raw counts; all zero when there are no events.
pub fn derive(raw: RawCounts) -> StatisticsSnapshot {
    let total = raw.total();
    StatisticsSnapshot {
        counts: raw,
        total_events: total,
        normal_percent: percent(raw.normal_count, total),
        anomaly_percent: percent(raw.anomaly_count, total),
        unidentified_percent: percent(raw.unidentified_count, total),
    }
}

/// Snapshot for a `statistics` event. Server percentages win when all three
/// are present and sum to at most 100; otherwise every percentage is derived
/// from the counts.
pub fn from_payload(payload: &StatisticsPayload) -> StatisticsSnapshot {
    match (
        payload.normal_percent,
        payload.anomaly_percent,
        payload.unidentified_percent,
    ) {
        (Some(n), Some(a), Some(u))
            if [n, a, u].iter().all(|p| p.is_finite() && *p >= 0.0)
                && n + a + u <= 100.0 + ROUNDING_SLACK =>
        {
            StatisticsSnapshot {
                counts: payload.counts,
                total_events: payload.counts.total(),
                normal_percent: round1(n),
                anomaly_percent: round1(a),
                unidentified_percent: round1(u),
            }
        }
        _ => derive(payload.counts),
    }
}

pub fn from_summary(summary: &SummaryStatistics) -> StatisticsSnapshot {
    let mut snap = from_payload(&summary.payload);
    if summary.total_events > 0 {
        snap.total_events = summary.total_events;
    }
    snap
}
