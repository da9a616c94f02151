//! Wire types shared by the REST client, the SSE decoder and the view model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// One log line as pushed on the `log` event or returned by `/api/logs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub message: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

/// Log row returned by `/hdfs/logs/{blockId}`, carrying the parsed HDFS columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HdfsLogEntry {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub message: String,
    #[serde(default)]
    pub hdfs_date: Option<String>,
    #[serde(default)]
    pub hdfs_time: Option<String>,
    #[serde(default)]
    pub thread_id: Option<i64>,
    #[serde(default)]
    pub hdfs_component: Option<String>,
    #[serde(default)]
    pub block_id: Option<String>,
}

/// Bare classification counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCounts {
    #[serde(default)]
    pub normal_count: u64,
    #[serde(default)]
    pub anomaly_count: u64,
    #[serde(default)]
    pub unidentified_count: u64,
}

impl RawCounts {
    pub fn new(normal_count: u64, anomaly_count: u64, unidentified_count: u64) -> Self {
        Self { normal_count, anomaly_count, unidentified_count }
    }

    pub fn total(&self) -> u64 {
        self.normal_count
            .saturating_add(self.anomaly_count)
            .saturating_add(self.unidentified_count)
    }
}

/// Payload of a `statistics` event. Some producers include percentages,
/// some only counts; percentages may arrive as numbers or numeric strings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StatisticsPayload {
    #[serde(flatten)]
    pub counts: RawCounts,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub normal_percent: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub anomaly_percent: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub unidentified_percent: Option<f64>,
}

/// `/api/statistics/summary` response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SummaryStatistics {
    #[serde(default)]
    pub total_events: u64,
    #[serde(flatten)]
    pub payload: StatisticsPayload,
    #[serde(default)]
    pub time_period_hours: Option<u32>,
}

/// Row of `/api/statistics/classifications`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClassificationRow {
    pub id: i64,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub counts: RawCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationType {
    Anomaly,
    Unidentified,
}

impl ClassificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationType::Anomaly => "anomaly",
            ClassificationType::Unidentified => "unidentified",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anomaly" => Some(ClassificationType::Anomaly),
            "unidentified" => Some(ClassificationType::Unidentified),
            _ => None,
        }
    }
}

impl fmt::Display for ClassificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The backend stores parameter values as text; some producers send numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Number(n) => write!(f, "{}", n),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyParameter {
    pub id: i64,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub param_value: ParamValue,
    pub classification_type: ClassificationType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub normal_count: u64,
    #[serde(default)]
    pub anomaly_count: u64,
    #[serde(default)]
    pub unidentified_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub filename: String,
    /// Relative to the backend base URL
    pub path: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl TestReport {
    /// Newest report by `created_at`, independent of the server's ordering.
    pub fn latest(reports: &[TestReport]) -> Option<&TestReport> {
        reports.iter().max_by_key(|r| r.created_at)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunTestsResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub report: Option<TestReport>,
}

/// `/hdfs/blocks` rows are free-form objects.
pub type HdfsBlock = Map<String, Value>;

/// Parse backend timestamps: RFC 3339, or naive ISO-8601 taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    use chrono::{NaiveDateTime, TimeZone};

    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

pub mod timestamp {
    use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Millis(i64),
    }

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Text(s) => super::parse_timestamp(&s)
                .ok_or_else(|| de::Error::custom(format!("invalid timestamp: {}", s))),
            Raw::Millis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {}", ms))),
        }
    }
}

mod lenient {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrText {
        Num(f64),
        Text(String),
    }

    pub fn opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(match Option::<NumOrText>::deserialize(d)? {
            Some(NumOrText::Num(n)) => Some(n),
            Some(NumOrText::Text(s)) => s.trim().parse().ok(),
            None => None,
        })
    }
}
