//! Typed REST client for the classification backend.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

use crate::config::{Config, TimeWindow};
use crate::error::ApiError;
use crate::hdfs::is_block_id;
use crate::logging::{log, obj, ts_epoch_ms, v_str, Domain, Level, ProfileScope};
use crate::types::{
    AnomalyParameter, ClassificationRow, ClassificationType, HdfsBlock,
    HdfsLogEntry, LogRecord, RunTestsResponse, SummaryStatistics, TestReport, TimeSeriesPoint,
};

/// Paging and time-range filters shared by `/api/logs` and
/// `/api/statistics/classifications`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListQuery {
    pub skip: Option<u32>,
    pub limit: Option<u32>,
    pub log_level: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl ListQuery {
    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        if let Some(skip) = self.skip {
            out.push(("skip", skip.to_string()));
        }
        if let Some(limit) = self.limit {
            out.push(("limit", limit.to_string()));
        }
        if let Some(level) = &self.log_level {
            out.push(("log_level", level.clone()));
        }
        if let Some(start) = self.start_time {
            out.push(("start_time", start.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        if let Some(end) = self.end_time {
            out.push(("end_time", end.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        out
    }
}

/// Report endpoints, behind a trait so the orchestrator can run against a
/// scripted backend.
#[async_trait]
pub trait ReportApi: Send + Sync {
    async fn run_tests(&self) -> Result<RunTestsResponse, ApiError>;
    async fn list_reports(&self) -> Result<Vec<TestReport>, ApiError>;
    async fn latest_report(&self) -> Result<TestReport, ApiError>;
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base: String,
    run_timeout: Duration,
}

impl ApiClient {
    pub fn new(cfg: &Config) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(cfg.http_timeout())
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self {
            client,
            base: cfg.backend_url.clone(),
            run_timeout: cfg.run_tests_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn send(&self, path: &str, req: RequestBuilder) -> Result<Value, ApiError> {
        let _scope = ProfileScope::with_context("api.request", &[("endpoint", v_str(path))]);
        let result = Self::read(req).await;
        if let Err(err) = &result {
            log(
                Level::Error,
                Domain::Api,
                "request_failed",
                obj(&[
                    ("endpoint", v_str(path)),
                    ("kind", v_str(err.kind())),
                    ("retryable", serde_json::json!(err.is_retryable())),
                    ("error", v_str(&err.to_string())),
                ]),
            );
        }
        result
    }

    async fn read(req: RequestBuilder) -> Result<Value, ApiError> {
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(body));
        }
        if !status.is_success() {
            return Err(ApiError::Status { status: status.as_u16(), body });
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, ApiError> {
        let req = self.client.get(self.url(path)).query(query);
        let value = self.send(path, req).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn fetch_logs(&self, query: &ListQuery) -> Result<Vec<LogRecord>, ApiError> {
        self.get("/api/logs", &query.params()).await
    }

    pub async fn fetch_classifications(&self, query: &ListQuery) -> Result<Vec<ClassificationRow>, ApiError> {
        self.get("/api/statistics/classifications", &query.params()).await
    }

    /// One page of parameters; never more than `limit` entries.
    pub async fn fetch_anomalies(
        &self,
        classification: ClassificationType,
        limit: usize,
    ) -> Result<Vec<AnomalyParameter>, ApiError> {
        let mut page: Vec<AnomalyParameter> = self
            .get(
                "/api/anomalies/",
                &[
                    ("classification_type", classification.as_str().to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        page.truncate(limit);
        Ok(page)
    }

    pub async fn fetch_time_series(&self, window: TimeWindow) -> Result<Vec<TimeSeriesPoint>, ApiError> {
        let interval = window.interval_minutes().to_string();
        self.get(
            "/api/statistics/time-series",
            &[
                ("hours", window.hours().to_string()),
                ("interval", interval.clone()),
                ("interval_minutes", interval),
            ],
        )
        .await
    }

    pub async fn fetch_summary(&self, hours: u32) -> Result<SummaryStatistics, ApiError> {
        self.get("/api/statistics/summary", &[("hours", hours.to_string())]).await
    }

    /// Block statistics. A body that is not a JSON array counts as no blocks.
    pub async fn fetch_blocks(&self, limit: u32, min_logs: u32, hours: u32) -> Result<Vec<HdfsBlock>, ApiError> {
        let value: Value = self
            .get(
                "/hdfs/blocks",
                &[
                    ("limit", limit.to_string()),
                    ("min_logs", min_logs.to_string()),
                    ("hours", hours.to_string()),
                ],
            )
            .await?;
        Ok(blocks_from_value(value))
    }

    pub async fn fetch_block_logs(&self, block_id: &str, limit: u32) -> Result<Vec<HdfsLogEntry>, ApiError> {
        if !is_block_id(block_id) {
            return Err(ApiError::InvalidRequest(format!("invalid block ID format: {}", block_id)));
        }
        let mut url = url::Url::parse(&self.url("/hdfs/logs/"))?;
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidRequest("base URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .push(block_id);
        let path = url.path().to_string();
        let req = self.client.get(url).query(&[("limit", limit.to_string())]);
        let value = self.send(&path, req).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Absolute URL of a report file, with a cache-busting `t` parameter.
    pub fn report_url(&self, report: &TestReport) -> String {
        report_url_at(&self.base, report, ts_epoch_ms())
    }
}

#[async_trait]
impl ReportApi for ApiClient {
    async fn run_tests(&self) -> Result<RunTestsResponse, ApiError> {
        let path = "/api/test-reports/run";
        let req = self.client.post(self.url(path)).timeout(self.run_timeout);
        let value = self.send(path, req).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn list_reports(&self) -> Result<Vec<TestReport>, ApiError> {
        self.get("/api/test-reports/list", &[]).await
    }

    async fn latest_report(&self) -> Result<TestReport, ApiError> {
        self.get("/api/test-reports/latest", &[]).await
    }
}

pub fn blocks_from_value(value: Value) -> Vec<HdfsBlock> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

pub fn report_url_at(base: &str, report: &TestReport, epoch_ms: u64) -> String {
    let sep = if report.path.contains('?') { '&' } else { '?' };
    format!("{}{}{}t={}", base, report.path, sep, epoch_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn report(path: &str) -> TestReport {
        TestReport {
            filename: "api_test_report_1.html".into(),
            path: path.into(),
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            size_bytes: Some(1024),
        }
    }

    #[test]
    fn test_report_url_cache_buster() {
        assert_eq!(
            report_url_at("http://api:8000", &report("/reports/a.html"), 42),
            "http://api:8000/reports/a.html?t=42"
        );
        assert_eq!(
            report_url_at("http://api:8000", &report("/reports/a.html?v=2"), 42),
            "http://api:8000/reports/a.html?v=2&t=42"
        );
    }

    #[test]
    fn test_non_array_blocks_are_empty() {
        assert!(blocks_from_value(json!({"detail": "oops"})).is_empty());
        assert!(blocks_from_value(Value::Null).is_empty());
        let blocks = blocks_from_value(json!([{"block_id": "blk_1", "log_count": 3}, 7]));
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0]["block_id"], "blk_1");
    }

    #[test]
    fn test_list_query_params() {
        let q = ListQuery {
            limit: Some(50),
            log_level: Some("ERROR".into()),
            start_time: Some(Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap()),
            ..Default::default()
        };
        assert_eq!(
            q.params(),
            vec![
                ("limit", "50".to_string()),
                ("log_level", "ERROR".to_string()),
                ("start_time", "2025-01-02T03:04:05Z".to_string()),
            ]
        );
        assert!(ListQuery::default().params().is_empty());
    }

    #[tokio::test]
    async fn test_block_logs_rejects_bad_id_without_request() {
        let api = ApiClient::new(&Config::with_backend("http://127.0.0.1:9")).unwrap();
        let err = api.fetch_block_logs("block_1", 10).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest(_)));
    }
}
