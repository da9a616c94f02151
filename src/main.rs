use anyhow::{anyhow, Context, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use logdash::api::{ApiClient, ListQuery};
use logdash::config::{Config, TimeWindow};
use logdash::hdfs::{block_ids, parse_line};
use logdash::logging::{log, obj, tick_aggregator, v_num, v_str, Domain, Level};
use logdash::orchestrator::{LatestReport, PollBudget, RunState, TestRunOrchestrator};
use logdash::poller::{anomaly_poller, time_series_poller};
use logdash::sse::StreamClient;
use logdash::stats::from_summary;
use logdash::types::{ClassificationType, LogRecord};
use logdash::view::{Dashboard, StreamKind};

fn print_usage() {
    eprintln!("Usage: logdash <command> [options]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  watch [--filter=<text>] [--seconds=<n>]    Follow the log and statistics streams");
    eprintln!("  logs [--level=<lvl>] [--limit=<n>]         Fetch stored log records");
    eprintln!("  summary [--hours=<n>]                      Classification summary");
    eprintln!("  anomalies [--type=anomaly|unidentified] [--limit=<n>] [--watch]");
    eprintln!("  timeseries [--window=5M|1H|6H|12H] [--watch]");
    eprintln!("  run-tests                                  Trigger a test run and wait for its report");
    eprintln!("  latest-report                              Show the newest test report");
    eprintln!("  blocks [--limit=<n>] [--min-logs=<n>] [--hours=<n>]");
    eprintln!("  block-logs <block_id> [--limit=<n>]");
    eprintln!();
    eprintln!("Environment: BACKEND_URL (default http://localhost:8000), LOG_LEVEL, LOG_DOMAINS, LOG_DIR");
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    let prefix = format!("--{}=", name);
    args.iter().find_map(|a| a.strip_prefix(prefix.as_str()))
}

fn flag_num<T: std::str::FromStr>(args: &[String], name: &str, default: T) -> Result<T> {
    match flag(args, name) {
        Some(raw) => raw.parse().map_err(|_| anyhow!("invalid --{} value '{}'", name, raw)),
        None => Ok(default),
    }
}

fn has_flag(args: &[String], name: &str) -> bool {
    let wanted = format!("--{}", name);
    args.iter().any(|a| *a == wanted)
}

fn emit(event: &str, payload: serde_json::Value) {
    log(Level::Info, Domain::View, event, obj(&[("payload", payload)]));
}

fn emit_log_record(record: &LogRecord) {
    let line = parse_line(&record.message);
    log(
        Level::Info,
        Domain::View,
        "log_record",
        obj(&[
            ("timestamp", json!(record.timestamp.to_rfc3339())),
            ("log_level", v_str(&record.log_level)),
            ("component", json!(line.component)),
            ("block_ids", json!(block_ids(&record.message))),
            ("message", v_str(&line.message)),
        ]),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }
    let cfg = Config::from_env();
    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[("backend_url", v_str(&cfg.backend_url)), ("command", v_str(&args[1]))]),
    );

    let rest = &args[2..];
    match args[1].as_str() {
        "watch" => cmd_watch(&cfg, rest).await,
        "logs" => cmd_logs(&cfg, rest).await,
        "summary" => cmd_summary(&cfg, rest).await,
        "anomalies" => cmd_anomalies(&cfg, rest).await,
        "timeseries" => cmd_timeseries(&cfg, rest).await,
        "run-tests" => cmd_run_tests(&cfg).await,
        "latest-report" => cmd_latest_report(&cfg).await,
        "blocks" => cmd_blocks(&cfg, rest).await,
        "block-logs" => cmd_block_logs(&cfg, rest).await,
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            std::process::exit(1);
        }
    }
}

async fn cmd_watch(cfg: &Config, args: &[String]) -> Result<()> {
    let client = StreamClient::new(cfg).context("building stream client")?;
    let dashboard = Dashboard::start(&client, cfg.log_buffer_capacity);
    if let Some(filter) = flag(args, "filter") {
        dashboard.set_filter(filter);
    }
    let deadline = match flag(args, "seconds") {
        Some(raw) => Some(tokio::time::Instant::now() + Duration::from_secs(raw.parse()?)),
        None => None,
    };

    let mut updates = dashboard.subscribe();
    let mut seen = 0u64;
    let mut last_stats = dashboard.snapshot().stats;
    let mut housekeeping = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = updates.borrow_and_update().clone();
                for record in state.visible_since(seen) {
                    emit_log_record(record);
                }
                seen = state.received;
                if state.stats != last_stats {
                    last_stats = state.stats;
                    emit("statistics", json!(last_stats));
                }
                for kind in StreamKind::ALL {
                    if let Some(err) = state.error(kind) {
                        log(
                            Level::Warn,
                            Domain::View,
                            "connection_error",
                            obj(&[("stream", v_str(kind.as_str())), ("error", v_str(err))]),
                        );
                    }
                }
            }
            _ = housekeeping.tick() => {
                tick_aggregator();
                if deadline.map_or(false, |d| tokio::time::Instant::now() >= d) {
                    break;
                }
            }
        }
    }
    dashboard.close();
    Ok(())
}

async fn cmd_logs(cfg: &Config, args: &[String]) -> Result<()> {
    let api = ApiClient::new(cfg)?;
    let query = ListQuery {
        limit: Some(flag_num(args, "limit", 100u32)?),
        skip: Some(flag_num(args, "skip", 0u32)?),
        log_level: flag(args, "level").map(str::to_string),
        ..Default::default()
    };
    for record in api.fetch_logs(&query).await? {
        emit_log_record(&record);
    }
    Ok(())
}

async fn cmd_summary(cfg: &Config, args: &[String]) -> Result<()> {
    let api = ApiClient::new(cfg)?;
    let summary = api.fetch_summary(flag_num(args, "hours", 24u32)?).await?;
    let snapshot = from_summary(&summary);
    emit(
        "summary",
        json!({
            "time_period_hours": summary.time_period_hours,
            "statistics": snapshot,
        }),
    );
    Ok(())
}

async fn cmd_anomalies(cfg: &Config, args: &[String]) -> Result<()> {
    let api = ApiClient::new(cfg)?;
    let classification = match flag(args, "type") {
        Some(raw) => ClassificationType::parse(raw).ok_or_else(|| anyhow!("unknown classification type '{}'", raw))?,
        None => ClassificationType::Anomaly,
    };
    let limit = flag_num(args, "limit", cfg.anomaly_limit)?;

    if !has_flag(args, "watch") {
        let page = api.fetch_anomalies(classification, limit).await?;
        emit("anomalies", json!({ "classification_type": classification.as_str(), "items": page }));
        return Ok(());
    }

    let poller = anomaly_poller(api, classification, limit, cfg.anomaly_refresh());
    let mut updates = poller.poller().subscribe();
    while updates.changed().await.is_ok() {
        let state = updates.borrow_and_update().clone();
        if state.loading {
            continue;
        }
        match (&state.data, &state.error) {
            (_, Some(err)) => log(
                Level::Warn,
                Domain::Poll,
                "anomalies_failed",
                obj(&[("error", v_str(err)), ("retry_count", v_num(state.retry_count as f64))]),
            ),
            (Some(items), None) => emit("anomalies", json!({ "classification_type": classification.as_str(), "items": items })),
            (None, None) => {}
        }
    }
    Ok(())
}

async fn cmd_timeseries(cfg: &Config, args: &[String]) -> Result<()> {
    let api = ApiClient::new(cfg)?;
    let window = match flag(args, "window") {
        Some(raw) => TimeWindow::parse(raw).ok_or_else(|| anyhow!("unknown time window '{}'", raw))?,
        None => cfg.time_window,
    };

    if !has_flag(args, "watch") {
        let points = api.fetch_time_series(window).await?;
        emit("time_series", json!({ "window": window.label(), "points": points }));
        return Ok(());
    }

    let poller = time_series_poller(api, window);
    let mut updates = poller.poller().subscribe();
    while updates.changed().await.is_ok() {
        let state = updates.borrow_and_update().clone();
        if let (Some(points), false) = (&state.data, state.loading) {
            emit("time_series", json!({ "window": window.label(), "points": points }));
        }
    }
    Ok(())
}

async fn cmd_run_tests(cfg: &Config) -> Result<()> {
    let api = Arc::new(ApiClient::new(cfg)?);
    let orchestrator = TestRunOrchestrator::new(api.clone(), PollBudget::from_config(cfg));
    match orchestrator.run().await {
        RunState::Completed { report, warning } => {
            emit(
                "test_report",
                json!({
                    "report": report,
                    "url": api.report_url(&report),
                    "warning": warning,
                }),
            );
            Ok(())
        }
        other => Err(anyhow!("{}", other.message())),
    }
}

async fn cmd_latest_report(cfg: &Config) -> Result<()> {
    let api = Arc::new(ApiClient::new(cfg)?);
    let orchestrator = TestRunOrchestrator::new(api.clone(), PollBudget::from_config(cfg));
    match orchestrator.load_latest().await? {
        LatestReport::Found(report) => emit(
            "test_report",
            json!({ "report": report, "url": api.report_url(&report) }),
        ),
        LatestReport::NoReports => emit(
            "test_report",
            json!({ "report": null, "msg": "No test reports available. Run tests to generate a report." }),
        ),
    }
    Ok(())
}

async fn cmd_blocks(cfg: &Config, args: &[String]) -> Result<()> {
    let api = ApiClient::new(cfg)?;
    let blocks = api
        .fetch_blocks(
            flag_num(args, "limit", 20u32)?,
            flag_num(args, "min-logs", 5u32)?,
            flag_num(args, "hours", 24u32)?,
        )
        .await?;
    emit("blocks", json!(blocks));
    Ok(())
}

async fn cmd_block_logs(cfg: &Config, args: &[String]) -> Result<()> {
    let block_id = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .ok_or_else(|| anyhow!("Usage: logdash block-logs <block_id> [--limit=<n>]"))?;
    let api = ApiClient::new(cfg)?;
    let entries = api.fetch_block_logs(block_id, flag_num(args, "limit", 100u32)?).await?;
    emit("block_logs", json!({ "block_id": block_id, "entries": entries }));
    Ok(())
}
