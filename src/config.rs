use std::time::Duration;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";

/// Process-wide settings, read once at startup and passed into each component.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend base URL with any trailing slash removed
    pub backend_url: String,
    pub http_timeout_secs: u64,
    pub run_tests_timeout_secs: u64,
    pub reconnect_secs: u64,
    pub log_buffer_capacity: usize,
    pub anomaly_limit: usize,
    pub anomaly_refresh_secs: u64,
    pub report_poll_secs: u64,
    pub report_poll_attempts: u32,
    pub time_window: TimeWindow,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            http_timeout_secs: 10,
            run_tests_timeout_secs: 60,
            reconnect_secs: 5,
            log_buffer_capacity: 100,
            anomaly_limit: 20,
            anomaly_refresh_secs: 10,
            report_poll_secs: 5,
            report_poll_attempts: 12,
            time_window: TimeWindow::OneHour,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            backend_url: normalize_base_url(
                &std::env::var("BACKEND_URL").unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string()),
            ),
            http_timeout_secs: std::env::var("HTTP_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.http_timeout_secs),
            run_tests_timeout_secs: std::env::var("RUN_TESTS_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.run_tests_timeout_secs),
            reconnect_secs: std::env::var("RECONNECT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.reconnect_secs),
            log_buffer_capacity: std::env::var("LOG_BUFFER_CAPACITY").ok().and_then(|v| v.parse().ok()).unwrap_or(d.log_buffer_capacity),
            anomaly_limit: std::env::var("ANOMALY_LIMIT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.anomaly_limit),
            anomaly_refresh_secs: std::env::var("ANOMALY_REFRESH_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.anomaly_refresh_secs),
            report_poll_secs: std::env::var("REPORT_POLL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.report_poll_secs),
            report_poll_attempts: std::env::var("REPORT_POLL_ATTEMPTS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.report_poll_attempts),
            time_window: std::env::var("TIME_WINDOW").ok().and_then(|v| TimeWindow::parse(&v)).unwrap_or(d.time_window),
        }
    }

    /// Same settings against a different backend, mostly for tests.
    pub fn with_backend(backend_url: &str) -> Self {
        Self {
            backend_url: normalize_base_url(backend_url),
            ..Self::default()
        }
    }

    /// Resolve an absolute endpoint path (starting with '/') against the backend.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.backend_url, path)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn run_tests_timeout(&self) -> Duration {
        Duration::from_secs(self.run_tests_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_secs)
    }

    pub fn report_poll_interval(&self) -> Duration {
        Duration::from_secs(self.report_poll_secs)
    }

    pub fn anomaly_refresh(&self) -> Duration {
        Duration::from_secs(self.anomaly_refresh_secs)
    }
}

pub fn normalize_base_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

/// User-selectable window for the time-series chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeWindow {
    FiveMinutes,
    OneHour,
    SixHours,
    TwelveHours,
}

impl TimeWindow {
    pub const ALL: [TimeWindow; 4] = [
        TimeWindow::FiveMinutes,
        TimeWindow::OneHour,
        TimeWindow::SixHours,
        TimeWindow::TwelveHours,
    ];

    pub fn parse(label: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|w| w.label().eq_ignore_ascii_case(label.trim()))
    }

    pub fn label(&self) -> &'static str {
        match self {
            TimeWindow::FiveMinutes => "5M",
            TimeWindow::OneHour => "1H",
            TimeWindow::SixHours => "6H",
            TimeWindow::TwelveHours => "12H",
        }
    }

    /// `hours` query parameter; the backend accepts one hour at minimum.
    pub fn hours(&self) -> u32 {
        match self {
            TimeWindow::FiveMinutes | TimeWindow::OneHour => 1,
            TimeWindow::SixHours => 6,
            TimeWindow::TwelveHours => 12,
        }
    }

    /// Bucket width in minutes (`interval` query parameter).
    pub fn interval_minutes(&self) -> u32 {
        match self {
            TimeWindow::FiveMinutes => 1,
            TimeWindow::OneHour => 5,
            TimeWindow::SixHours => 15,
            TimeWindow::TwelveHours => 30,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        match self {
            TimeWindow::FiveMinutes => Duration::from_secs(60),
            _ => Duration::from_secs(3600),
        }
    }
}
