//! Remote test-run driver: `Idle -> Running -> {Completed, TimedOut, Failed}`.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::api::ReportApi;
use crate::config::Config;
use crate::error::ApiError;
use crate::logging::{log, log_report_transition, obj, v_str, Domain, Level};
use crate::types::TestReport;

pub const RUNNING_MESSAGE: &str = "API tests are running. This may take a minute or more...";
pub const COMPLETED_MESSAGE: &str = "API tests completed successfully!";
pub const RECOVERED_WARNING: &str =
    "There was an error communicating with the server, but a new report was found.";
pub const STILL_RUNNING_MESSAGE: &str =
    "Tests may still be running. Please refresh in a minute to check for new reports.";
pub const POLL_FAILED_MESSAGE: &str = "Failed to check for new test reports. Please refresh manually.";
pub const RUN_FAILED_MESSAGE: &str = "An error occurred while running API tests. Please try again.";

#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    Idle,
    Running { started_at: DateTime<Utc> },
    Completed { report: TestReport, warning: Option<String> },
    TimedOut { message: String },
    Failed { message: String },
}

impl RunState {
    pub fn name(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Running { .. } => "running",
            RunState::Completed { .. } => "completed",
            RunState::TimedOut { .. } => "timed_out",
            RunState::Failed { .. } => "failed",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, RunState::Running { .. })
    }

    /// User-facing notification for this state.
    pub fn message(&self) -> &str {
        match self {
            RunState::Idle => "",
            RunState::Running { .. } => RUNNING_MESSAGE,
            RunState::Completed { warning: Some(w), .. } => w.as_str(),
            RunState::Completed { warning: None, .. } => COMPLETED_MESSAGE,
            RunState::TimedOut { message } | RunState::Failed { message } => message.as_str(),
        }
    }
}

/// Outcome of loading the newest report on startup.
#[derive(Debug, Clone, PartialEq)]
pub enum LatestReport {
    Found(TestReport),
    NoReports,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollBudget {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollBudget {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            interval: cfg.report_poll_interval(),
            max_attempts: cfg.report_poll_attempts,
        }
    }
}

impl Default for PollBudget {
    fn default() -> Self {
        Self { interval: Duration::from_secs(5), max_attempts: 12 }
    }
}

pub struct TestRunOrchestrator<A: ReportApi> {
    api: Arc<A>,
    clock: Arc<dyn Clock>,
    budget: PollBudget,
    state: watch::Sender<RunState>,
}

impl<A: ReportApi> TestRunOrchestrator<A> {
    pub fn new(api: Arc<A>, budget: PollBudget) -> Self {
        Self::with_clock(api, budget, Arc::new(SystemClock))
    }

    pub fn with_clock(api: Arc<A>, budget: PollBudget, clock: Arc<dyn Clock>) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self { api, clock, budget, state }
    }

    pub fn state(&self) -> RunState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    fn transition(&self, next: RunState) -> RunState {
        let from = self.state.borrow().name();
        log_report_transition(from, next.name(), next.message());
        self.state.send_replace(next.clone());
        next
    }

    /// Trigger a run and drive it to a terminal state. A second trigger
    /// while one is running returns the running state untouched.
    pub async fn run(&self) -> RunState {
        let started_at = self.clock.now();
        let mut busy: Option<RunState> = None;
        let mut from = "";
        // check and claim under one lock so concurrent triggers start one run
        self.state.send_if_modified(|s| {
            if s.is_running() {
                busy = Some(s.clone());
                return false;
            }
            from = s.name();
            *s = RunState::Running { started_at };
            true
        });
        if let Some(current) = busy {
            return current;
        }
        log_report_transition(from, "running", RUNNING_MESSAGE);

        let next = match self.api.run_tests().await {
            Ok(resp) if !resp.success => RunState::Failed {
                message: format!(
                    "Failed to run tests: {}",
                    resp.message.as_deref().unwrap_or("unknown error")
                ),
            },
            Ok(resp) => match resp.report {
                Some(report) => RunState::Completed { report, warning: None },
                None => self.poll_for_report(started_at).await,
            },
            Err(err) if err.is_timeout() => {
                log(
                    Level::Warn,
                    Domain::Report,
                    "run_timeout",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
                self.poll_for_report(started_at).await
            }
            Err(err) => self.recover(started_at, &err).await,
        };
        self.transition(next)
    }

    async fn poll_for_report(&self, started_at: DateTime<Utc>) -> RunState {
        let mut last_error: Option<ApiError> = None;
        for attempt in 1..=self.budget.max_attempts {
            sleep(self.budget.interval).await;
            log(
                Level::Debug,
                Domain::Report,
                "poll_attempt",
                obj(&[
                    ("attempt", serde_json::json!(attempt)),
                    ("max_attempts", serde_json::json!(self.budget.max_attempts)),
                ]),
            );
            match self.api.list_reports().await {
                Ok(reports) => {
                    last_error = None;
                    if let Some(report) = newer_report(&reports, started_at) {
                        return RunState::Completed { report, warning: None };
                    }
                }
                Err(err) => last_error = Some(err),
            }
        }
        let message = match last_error {
            Some(_) => POLL_FAILED_MESSAGE,
            None => STILL_RUNNING_MESSAGE,
        };
        RunState::TimedOut { message: message.to_string() }
    }

    /// One best-effort look for a report after a non-timeout failure.
    async fn recover(&self, started_at: DateTime<Utc>, err: &ApiError) -> RunState {
        log(
            Level::Error,
            Domain::Report,
            "run_failed",
            obj(&[("error", v_str(&err.to_string()))]),
        );
        match self.api.list_reports().await {
            Ok(reports) => match newer_report(&reports, started_at) {
                Some(report) => RunState::Completed {
                    report,
                    warning: Some(RECOVERED_WARNING.to_string()),
                },
                None => RunState::Failed { message: RUN_FAILED_MESSAGE.to_string() },
            },
            Err(_) => RunState::Failed { message: RUN_FAILED_MESSAGE.to_string() },
        }
    }

    pub async fn load_latest(&self) -> Result<LatestReport, ApiError> {
        match self.api.latest_report().await {
            Ok(report) => Ok(LatestReport::Found(report)),
            Err(err) if err.is_not_found() => {
                log(Level::Info, Domain::Report, "no_reports", obj(&[]));
                Ok(LatestReport::NoReports)
            }
            Err(err) => Err(err),
        }
    }
}

fn newer_report(reports: &[TestReport], started_at: DateTime<Utc>) -> Option<TestReport> {
    TestReport::latest(reports)
        .filter(|r| r.created_at > started_at)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[derive(Default)]
    struct MockApi {
        run: Mutex<Option<Result<crate::types::RunTestsResponse, ApiError>>>,
        run_calls: Mutex<u32>,
        lists: Mutex<VecDeque<Result<Vec<TestReport>, ApiError>>>,
        list_calls: Mutex<Vec<Instant>>,
        latest: Mutex<Option<Result<TestReport, ApiError>>>,
    }

    #[async_trait]
    impl ReportApi for MockApi {
        async fn run_tests(&self) -> Result<crate::types::RunTestsResponse, ApiError> {
            *self.run_calls.lock().unwrap() += 1;
            self.run.lock().unwrap().take().unwrap()
        }

        async fn list_reports(&self) -> Result<Vec<TestReport>, ApiError> {
            self.list_calls.lock().unwrap().push(Instant::now());
            self.lists.lock().unwrap().pop_front().unwrap_or(Ok(vec![]))
        }

        async fn latest_report(&self) -> Result<TestReport, ApiError> {
            self.latest.lock().unwrap().take().unwrap()
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn report(secs_after_start: i64) -> TestReport {
        TestReport {
            filename: format!("api_test_report_{}.html", secs_after_start),
            path: format!("/test-reports/api_test_report_{}.html", secs_after_start),
            created_at: t0() + chrono::Duration::seconds(secs_after_start),
            size_bytes: None,
        }
    }

    fn accepted() -> Result<crate::types::RunTestsResponse, ApiError> {
        Ok(crate::types::RunTestsResponse { success: true, message: None, report: None })
    }

    fn orchestrator(api: MockApi) -> (Arc<MockApi>, TestRunOrchestrator<MockApi>) {
        let api = Arc::new(api);
        let orch = TestRunOrchestrator::with_clock(api.clone(), PollBudget::default(), Arc::new(FixedClock(t0())));
        (api, orch)
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_on_third_poll() {
        let api = MockApi::default();
        *api.run.lock().unwrap() = Some(accepted());
        api.lists.lock().unwrap().extend([
            Ok(vec![report(-600)]),
            Ok(vec![report(-600)]),
            Ok(vec![report(-600), report(20)]),
        ]);
        let (api, orch) = orchestrator(api);
        let origin = Instant::now();

        let state = orch.run().await;
        assert_eq!(state, RunState::Completed { report: report(20), warning: None });
        let calls = api.list_calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0] - origin, Duration::from_secs(5));
        assert_eq!(calls[2] - origin, Duration::from_secs(15));
        assert_eq!(orch.state().message(), COMPLETED_MESSAGE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_after_budget() {
        let api = MockApi::default();
        *api.run.lock().unwrap() = Some(Err(ApiError::Timeout("timeout of 60000ms exceeded".into())));
        for _ in 0..20 {
            api.lists.lock().unwrap().push_back(Ok(vec![report(-60)]));
        }
        let (api, orch) = orchestrator(api);
        let origin = Instant::now();

        let state = orch.run().await;
        assert_eq!(state, RunState::TimedOut { message: STILL_RUNNING_MESSAGE.into() });
        assert_eq!(Instant::now() - origin, Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.list_calls.lock().unwrap().len(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_poll_error_changes_timeout_message() {
        let api = MockApi::default();
        *api.run.lock().unwrap() = Some(accepted());
        for _ in 0..12 {
            api.lists.lock().unwrap().push_back(Err(ApiError::Transport("refused".into())));
        }
        let (_, orch) = orchestrator(api);
        let state = orch.run().await;
        assert_eq!(state, RunState::TimedOut { message: POLL_FAILED_MESSAGE.into() });
    }

    #[tokio::test(start_paused = true)]
    async fn test_embedded_report_completes_without_polling() {
        let api = MockApi::default();
        *api.run.lock().unwrap() = Some(Ok(crate::types::RunTestsResponse {
            success: true,
            message: Some("done".into()),
            report: Some(report(3)),
        }));
        let (api, orch) = orchestrator(api);
        assert_eq!(orch.run().await, RunState::Completed { report: report(3), warning: None });
        assert!(api.list_calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsuccessful_run_fails_with_server_message() {
        let api = MockApi::default();
        *api.run.lock().unwrap() = Some(Ok(crate::types::RunTestsResponse {
            success: false,
            message: Some("pytest not installed".into()),
            report: None,
        }));
        let (_, orch) = orchestrator(api);
        assert_eq!(
            orch.run().await,
            RunState::Failed { message: "Failed to run tests: pytest not installed".into() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_error_recovers_newer_report() {
        let api = MockApi::default();
        *api.run.lock().unwrap() = Some(Err(ApiError::Status { status: 502, body: "bad gateway".into() }));
        api.lists.lock().unwrap().push_back(Ok(vec![report(45), report(-10)]));
        let (api, orch) = orchestrator(api);
        let state = orch.run().await;
        assert_eq!(
            state,
            RunState::Completed { report: report(45), warning: Some(RECOVERED_WARNING.into()) }
        );
        assert_eq!(api.list_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_error_without_newer_report_fails() {
        let api = MockApi::default();
        *api.run.lock().unwrap() = Some(Err(ApiError::Transport("reset".into())));
        api.lists.lock().unwrap().push_back(Ok(vec![report(-10)]));
        let (_, orch) = orchestrator(api);
        assert_eq!(orch.run().await, RunState::Failed { message: RUN_FAILED_MESSAGE.into() });
    }

    #[tokio::test]
    async fn test_load_latest_distinguishes_empty_from_error() {
        let api = MockApi::default();
        *api.latest.lock().unwrap() = Some(Err(ApiError::NotFound("No test reports found".into())));
        let (api, orch) = orchestrator(api);
        assert_eq!(orch.load_latest().await.unwrap(), LatestReport::NoReports);

        *api.latest.lock().unwrap() = Some(Err(ApiError::Status { status: 500, body: String::new() }));
        assert!(orch.load_latest().await.is_err());

        *api.latest.lock().unwrap() = Some(Ok(report(1)));
        assert_eq!(orch.load_latest().await.unwrap(), LatestReport::Found(report(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_observers_see_running() {
        let api = MockApi::default();
        *api.run.lock().unwrap() = Some(accepted());
        api.lists.lock().unwrap().push_back(Ok(vec![report(1)]));
        let (_, orch) = orchestrator(api);
        let mut rx = orch.subscribe();
        let run = orch.run();
        tokio::pin!(run);
        tokio::select! {
            _ = &mut run => panic!("finished before first poll"),
            _ = rx.changed() => {}
        }
        assert!(rx.borrow().is_running());
        assert!(matches!(run.await, RunState::Completed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_triggers_start_one_run() {
        let api = MockApi::default();
        *api.run.lock().unwrap() = Some(accepted());
        api.lists.lock().unwrap().push_back(Ok(vec![report(1)]));
        let (api, orch) = orchestrator(api);

        let (first, second) = tokio::join!(orch.run(), orch.run());
        assert!(matches!(first, RunState::Completed { .. }));
        assert_eq!(second, RunState::Running { started_at: t0() });
        assert_eq!(*api.run_calls.lock().unwrap(), 1);
        assert_eq!(api.list_calls.lock().unwrap().len(), 1);
    }
}
