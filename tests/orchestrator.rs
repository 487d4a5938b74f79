use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::NaiveDate;

use wx_backfill::catalog::{Catalog, CatalogLoader};
use wx_backfill::config::RunConfig;
use wx_backfill::domain::{Period, ProgressStatus, ProviderKind, TargetId, Tier};
use wx_backfill::fetch::{HttpRequest, HttpResponse, Transport, TransportError};
use wx_backfill::orchestrator::{
    CancelFlag, Orchestrator, ProgressSink, StopReason, UnitEvent, UnitOutcome,
};
use wx_backfill::providers::{NoaaProvider, OpenMeteoProvider, Provider};
use wx_backfill::rate_limit::Sleeper;
use wx_backfill::store::Store;

#[derive(Clone)]
enum Reply {
    Archive,
    Status(u16, &'static str),
    Reset,
}

struct ScriptedTransport {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    calls: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    fn new(script: Vec<Reply>) -> Self {
        Self::with_fallback(script, Reply::Archive)
    }

    fn with_fallback(script: Vec<Reply>, fallback: Reply) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

/// Two days of data at the start of the requested year.
fn archive_body(request: &HttpRequest) -> String {
    let start = request.query_value("start_date").unwrap();
    let year = &start[..4];
    format!(
        r#"{{
            "daily": {{
                "time": ["{year}-01-01", "{year}-01-02"],
                "snowfall_sum": [2.5, null],
                "temperature_2m_max": [-3.0, 1.5],
                "temperature_2m_min": [-11.0, -6.5],
                "precipitation_sum": [2.1, 0.0]
            }}
        }}"#
    )
}

impl Transport for ScriptedTransport {
    fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.calls.lock().unwrap().push(request.clone());
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match reply {
            Reply::Archive => Ok(HttpResponse {
                status: 200,
                body: archive_body(request),
            }),
            Reply::Status(status, body) => Ok(HttpResponse {
                status,
                body: body.to_string(),
            }),
            Reply::Reset => Err(TransportError::Connect("connection reset by peer".to_string())),
        }
    }
}

#[derive(Default)]
struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<UnitEvent>>,
    cancel_on_event: Option<CancelFlag>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: UnitEvent) {
        if let Some(flag) = &self.cancel_on_event {
            flag.cancel();
        }
        self.events.lock().unwrap().push(event);
    }
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
}

fn unit_cost() -> f64 {
    OpenMeteoProvider::new().cost_model().unit_cost()
}

fn config(start_year: i32, budget: f64) -> RunConfig {
    let mut config = RunConfig::for_provider(ProviderKind::OpenMeteo, today());
    config.start_year = start_year;
    config.budget = budget;
    config.rate_limit = Duration::ZERO;
    config
}

fn catalog(groups: &[(&str, &[&str])]) -> Catalog {
    let groups: Vec<serde_json::Value> = groups
        .iter()
        .map(|(name, ids)| {
            let targets: Vec<serde_json::Value> = ids
                .iter()
                .enumerate()
                .map(|(idx, id)| serde_json::json!([id, 45.0 + idx as f64, -89.0, id.to_uppercase()]))
                .collect();
            serde_json::json!({ "name": name, "targets": targets })
        })
        .collect();
    let file = serde_json::json!({ "schema_version": 1, "groups": groups });
    CatalogLoader::parse(&file.to_string()).unwrap()
}

fn orchestrator<'a>(
    config: RunConfig,
    catalog: &Catalog,
    store: Store,
    transport: &'a ScriptedTransport,
    sleeper: &'a RecordingSleeper,
) -> Orchestrator<OpenMeteoProvider, &'a ScriptedTransport, &'a RecordingSleeper> {
    Orchestrator::new(
        config,
        catalog,
        store,
        OpenMeteoProvider::new(),
        transport,
        sleeper,
    )
}

fn id(value: &str) -> TargetId {
    value.parse().unwrap()
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[test]
fn budget_for_two_units_stops_after_two_attempts() {
    let catalog = catalog(&[("Northwoods", &["a", "b", "c"])]);
    let transport = ScriptedTransport::new(vec![]);
    let sleeper = RecordingSleeper::default();
    let sink = RecordingSink::default();
    let mut orchestrator = orchestrator(
        config(2025, 2.0 * unit_cost()),
        &catalog,
        Store::open_in_memory().unwrap(),
        &transport,
        &sleeper,
    );

    let summary = orchestrator.run(&sink).unwrap();

    assert_eq!(summary.stop_reason, StopReason::BudgetExhausted);
    assert_eq!(summary.queue_len, 6);
    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.observations_written, 4);
    assert!(close(summary.spent, 2.0 * unit_cost()));
    assert!(summary.spent <= summary.cap);
    assert_eq!(summary.untouched_targets, vec![id("c")]);
    assert_eq!(transport.call_count(), 2);

    let store = orchestrator.store();
    assert_matches!(
        store.outcome(&id("a"), Period::year(2026)).unwrap(),
        Some(record) if record.status == ProgressStatus::Completed && record.units_written == 2
    );
    assert_eq!(store.outcome(&id("c"), Period::year(2026)).unwrap(), None);
}

#[test]
fn zero_budget_fetches_nothing() {
    let catalog = catalog(&[("Northwoods", &["a"])]);
    let transport = ScriptedTransport::new(vec![]);
    let sleeper = RecordingSleeper::default();
    let mut orchestrator = orchestrator(
        config(2026, 0.0),
        &catalog,
        Store::open_in_memory().unwrap(),
        &transport,
        &sleeper,
    );
    let summary = orchestrator.run(&RecordingSink::default()).unwrap();
    assert_eq!(summary.stop_reason, StopReason::BudgetExhausted);
    assert_eq!(summary.attempted, 0);
    assert_eq!(transport.call_count(), 0);
}

#[test]
fn second_run_resumes_without_refetching() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = Utf8PathBuf::from_path_buf(dir.path().join("weather.db")).unwrap();
    let catalog = catalog(&[("Northwoods", &["a", "b"])]);
    let sleeper = RecordingSleeper::default();

    let first = ScriptedTransport::new(vec![]);
    let summary = orchestrator(
        config(2025, 1000.0),
        &catalog,
        Store::open(&db_path).unwrap(),
        &first,
        &sleeper,
    )
    .run(&RecordingSink::default())
    .unwrap();
    assert_eq!(summary.stop_reason, StopReason::QueueDrained);
    assert_eq!(summary.completed, 4);
    assert_eq!(first.call_count(), 4);

    let second = ScriptedTransport::new(vec![]);
    let summary = orchestrator(
        config(2025, 1000.0),
        &catalog,
        Store::open(&db_path).unwrap(),
        &second,
        &sleeper,
    )
    .run(&RecordingSink::default())
    .unwrap();
    assert_eq!(summary.stop_reason, StopReason::QueueDrained);
    assert_eq!(summary.queue_len, 0);
    assert_eq!(summary.attempted, 0);
    assert_eq!(second.call_count(), 0);
}

#[test]
fn targets_are_served_round_robin() {
    let catalog = catalog(&[("North", &["a", "b"]), ("South", &["c", "d"])]);
    let transport = ScriptedTransport::new(vec![]);
    let sleeper = RecordingSleeper::default();
    let sink = RecordingSink::default();
    let mut orchestrator = orchestrator(
        config(2024, 10_000.0),
        &catalog,
        Store::open_in_memory().unwrap(),
        &transport,
        &sleeper,
    );
    orchestrator.run(&sink).unwrap();

    let order: Vec<(String, i32)> = sink
        .events
        .lock()
        .unwrap()
        .iter()
        .map(|event| (event.target_id.to_string(), event.period.value()))
        .collect();
    let mut expected = Vec::new();
    for year in [2026, 2025, 2024] {
        for target in ["a", "b", "c", "d"] {
            expected.push((target.to_string(), year));
        }
    }
    assert_eq!(order, expected);
}

#[test]
fn rate_limited_three_times_then_success_is_charged_once() {
    let catalog = catalog(&[("Northwoods", &["a"])]);
    let transport = ScriptedTransport::new(vec![
        Reply::Status(429, "slow down"),
        Reply::Status(429, "slow down"),
        Reply::Status(429, "slow down"),
    ]);
    let sleeper = RecordingSleeper::default();
    let mut orchestrator = orchestrator(
        config(2026, 1000.0),
        &catalog,
        Store::open_in_memory().unwrap(),
        &transport,
        &sleeper,
    );

    let summary = orchestrator.run(&RecordingSink::default()).unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.rate_limited, 0);
    assert!(close(summary.spent, unit_cost()));
    assert_eq!(transport.call_count(), 4);
    assert_eq!(
        *sleeper.sleeps.lock().unwrap(),
        vec![
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(15)
        ]
    );
}

#[test]
fn five_consecutive_rate_limits_trip_the_breaker() {
    let catalog = catalog(&[("Northwoods", &["a", "b"])]);
    let transport = ScriptedTransport::with_fallback(vec![], Reply::Status(429, ""));
    let sleeper = RecordingSleeper::default();
    let mut orchestrator = orchestrator(
        config(2026, 1000.0),
        &catalog,
        Store::open_in_memory().unwrap(),
        &transport,
        &sleeper,
    );

    let summary = orchestrator.run(&RecordingSink::default()).unwrap();

    assert_eq!(summary.stop_reason, StopReason::CircuitBreakerTripped);
    assert_eq!(summary.attempted, 0);
    assert!(close(summary.spent, 0.0));
    assert_eq!(transport.call_count(), 5);
    assert_eq!(summary.untouched_targets, vec![id("a"), id("b")]);
    assert_eq!(
        orchestrator.store().outcome(&id("a"), Period::year(2026)).unwrap(),
        None
    );
}

#[test]
fn exhausted_rate_limit_retries_fail_the_unit_without_charge() {
    let catalog = catalog(&[("Northwoods", &["a", "b"])]);
    let transport = ScriptedTransport::new(vec![
        Reply::Status(429, ""),
        Reply::Status(429, ""),
        Reply::Status(429, ""),
    ]);
    let sleeper = RecordingSleeper::default();
    let mut config = config(2026, 1000.0);
    config.fetch.max_rate_limit_retries = 2;
    config.fetch.circuit_breaker_threshold = 10;
    let sink = RecordingSink::default();
    let mut orchestrator = orchestrator(
        config,
        &catalog,
        Store::open_in_memory().unwrap(),
        &transport,
        &sleeper,
    );

    let summary = orchestrator.run(&sink).unwrap();

    assert_eq!(summary.stop_reason, StopReason::QueueDrained);
    assert_eq!(summary.rate_limited, 1);
    assert_eq!(summary.completed, 1);
    assert!(close(summary.spent, unit_cost()));

    let events = sink.events.lock().unwrap();
    assert_matches!(&events[0].outcome, UnitOutcome::RateLimited { .. });
    assert!(close(events[0].charged, 0.0));

    let record = orchestrator
        .store()
        .outcome(&id("a"), Period::year(2026))
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ProgressStatus::Failed);
    assert!(record.error_message.unwrap().contains("rate limited"));
}

#[test]
fn transport_errors_are_retried_then_failed_and_charged() {
    let catalog = catalog(&[("Northwoods", &["a", "b"])]);
    let transport = ScriptedTransport::new(vec![Reply::Reset, Reply::Reset, Reply::Reset]);
    let sleeper = RecordingSleeper::default();
    let mut orchestrator = orchestrator(
        config(2026, 1000.0),
        &catalog,
        Store::open_in_memory().unwrap(),
        &transport,
        &sleeper,
    );

    let summary = orchestrator.run(&RecordingSink::default()).unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.completed, 1);
    assert!(close(summary.spent, 2.0 * unit_cost()));
    assert_eq!(transport.call_count(), 4);
    assert_eq!(
        *sleeper.sleeps.lock().unwrap(),
        vec![Duration::from_secs(1), Duration::from_secs(1)]
    );
    let record = orchestrator
        .store()
        .outcome(&id("a"), Period::year(2026))
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ProgressStatus::Failed);
}

#[test]
fn client_errors_fail_without_retry() {
    let catalog = catalog(&[("Northwoods", &["a"])]);
    let transport = ScriptedTransport::new(vec![Reply::Status(400, "bad coordinates")]);
    let sleeper = RecordingSleeper::default();
    let mut orchestrator = orchestrator(
        config(2026, 1000.0),
        &catalog,
        Store::open_in_memory().unwrap(),
        &transport,
        &sleeper,
    );
    let summary = orchestrator.run(&RecordingSink::default()).unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(transport.call_count(), 1);
    assert!(sleeper.sleeps.lock().unwrap().is_empty());
    assert!(close(summary.spent, unit_cost()));
}

#[test]
fn empty_payload_is_terminal_no_data() {
    let catalog = catalog(&[("Northwoods", &["a"])]);
    let transport = ScriptedTransport::new(vec![Reply::Status(200, r#"{"daily": {"time": []}}"#)]);
    let sleeper = RecordingSleeper::default();
    let mut orchestrator = orchestrator(
        config(2026, 1000.0),
        &catalog,
        Store::open_in_memory().unwrap(),
        &transport,
        &sleeper,
    );
    let summary = orchestrator.run(&RecordingSink::default()).unwrap();
    assert_eq!(summary.no_data, 1);
    assert!(close(summary.spent, unit_cost()));

    let terminal = orchestrator.store().terminal_periods(&id("a")).unwrap();
    assert!(terminal.contains(&Period::year(2026)));
}

#[test]
fn malformed_payload_fails_the_unit() {
    let catalog = catalog(&[("Northwoods", &["a"])]);
    let transport = ScriptedTransport::new(vec![Reply::Status(200, "<html>maintenance</html>")]);
    let sleeper = RecordingSleeper::default();
    let mut orchestrator = orchestrator(
        config(2026, 1000.0),
        &catalog,
        Store::open_in_memory().unwrap(),
        &transport,
        &sleeper,
    );
    let summary = orchestrator.run(&RecordingSink::default()).unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(transport.call_count(), 1);
    assert!(close(summary.spent, unit_cost()));
    assert!(
        orchestrator
            .store()
            .terminal_periods(&id("a"))
            .unwrap()
            .is_empty()
    );
}

#[test]
fn cancellation_stops_after_the_in_flight_unit() {
    let catalog = catalog(&[("Northwoods", &["a", "b", "c"])]);
    let transport = ScriptedTransport::new(vec![]);
    let sleeper = RecordingSleeper::default();
    let cancel = CancelFlag::new();
    let sink = RecordingSink {
        cancel_on_event: Some(cancel.clone()),
        ..RecordingSink::default()
    };
    let mut orchestrator = orchestrator(
        config(2026, 1000.0),
        &catalog,
        Store::open_in_memory().unwrap(),
        &transport,
        &sleeper,
    )
    .with_cancel_flag(cancel);

    let summary = orchestrator.run(&sink).unwrap();

    assert_eq!(summary.stop_reason, StopReason::Cancelled);
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.untouched_targets, vec![id("b"), id("c")]);
    let store = orchestrator.store();
    assert_matches!(
        store.outcome(&id("a"), Period::year(2026)).unwrap(),
        Some(record) if record.status == ProgressStatus::Completed
    );
    assert_eq!(store.outcome(&id("b"), Period::year(2026)).unwrap(), None);
}

#[test]
fn dry_run_prices_the_queue_without_fetching() {
    let catalog = catalog(&[("Northwoods", &["a", "b"])]);
    let transport = ScriptedTransport::new(vec![]);
    let sleeper = RecordingSleeper::default();
    let orchestrator = orchestrator(
        config(2025, 2.0 * unit_cost()),
        &catalog,
        Store::open_in_memory().unwrap(),
        &transport,
        &sleeper,
    );

    let plan = orchestrator.dry_run().unwrap();

    assert_eq!(plan.total_units, 4);
    assert_eq!(plan.periods, 2);
    assert_eq!(plan.preview.len(), 4);
    assert_eq!(plan.preview[0].target_id, id("a"));
    assert_eq!(plan.preview[1].target_id, id("b"));
    assert_eq!(plan.tiers[0].tier, Tier::Cold);
    assert_eq!(plan.tiers[0].units, 4);
    assert!(close(plan.total_cost, 4.0 * unit_cost()));
    assert!(close(plan.days_to_complete.unwrap(), 2.0));
    assert_eq!(transport.call_count(), 0);
    assert!(orchestrator.store().progress_records().unwrap().is_empty());
}

#[test]
fn partially_covered_targets_wait_behind_cold_ones() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = Utf8PathBuf::from_path_buf(dir.path().join("weather.db")).unwrap();
    let catalog = catalog(&[("Northwoods", &["a", "b", "c"])]);
    let transport = ScriptedTransport::new(vec![]);
    let sleeper = RecordingSleeper::default();

    orchestrator(
        config(2026, unit_cost()),
        &catalog,
        Store::open(&db_path).unwrap(),
        &transport,
        &sleeper,
    )
    .run(&RecordingSink::default())
    .unwrap();

    let plan = orchestrator(
        config(2025, 1000.0),
        &catalog,
        Store::open(&db_path).unwrap(),
        &transport,
        &sleeper,
    )
    .dry_run()
    .unwrap();

    let order: Vec<(String, i32, Tier)> = plan
        .preview
        .iter()
        .map(|unit| (unit.target_id.to_string(), unit.period.value(), unit.tier))
        .collect();
    assert_eq!(
        order,
        vec![
            ("b".to_string(), 2026, Tier::Cold),
            ("c".to_string(), 2026, Tier::Cold),
            ("b".to_string(), 2025, Tier::Cold),
            ("c".to_string(), 2025, Tier::Cold),
            ("a".to_string(), 2025, Tier::Partial),
        ]
    );
}

#[test]
fn status_reports_progress_by_group() {
    let catalog = catalog(&[("North", &["a"]), ("South", &["b"])]);
    let transport = ScriptedTransport::new(vec![Reply::Status(404, "missing")]);
    let sleeper = RecordingSleeper::default();
    let mut orchestrator = orchestrator(
        config(2025, 3.0 * unit_cost()),
        &catalog,
        Store::open_in_memory().unwrap(),
        &transport,
        &sleeper,
    );
    let summary = orchestrator.run(&RecordingSink::default()).unwrap();
    assert_eq!(summary.stop_reason, StopReason::BudgetExhausted);

    let report = orchestrator.status().unwrap();

    assert_eq!(report.total_units, 4);
    assert_eq!(report.counts.completed, 2);
    assert_eq!(report.counts.failed, 1);
    assert_eq!(report.remaining, 1);
    assert!(close(report.percent_done, 50.0));
    assert!(close(report.days_remaining.unwrap(), 2.0 / 3.0));
    assert_eq!(report.groups.len(), 2);
    assert_eq!(report.groups[0].group, "North");
    assert_eq!(report.groups[0].terminal_units, 1);
    assert_eq!(report.groups[1].terminal_units, 1);
    assert!(close(report.groups[1].percent_done, 50.0));
}

#[test]
fn budget_for_exactly_seven_units_serves_all_seven_targets() {
    let ids = ["a", "b", "c", "d", "e", "f", "g"];
    let catalog = catalog(&[("Northwoods", &ids)]);
    let transport = ScriptedTransport::new(vec![]);
    let sleeper = RecordingSleeper::default();
    let mut orchestrator = orchestrator(
        config(2026, 7.0 * unit_cost()),
        &catalog,
        Store::open_in_memory().unwrap(),
        &transport,
        &sleeper,
    );

    let summary = orchestrator.run(&RecordingSink::default()).unwrap();

    assert_eq!(summary.stop_reason, StopReason::QueueDrained);
    assert_eq!(summary.attempted, 7);
    assert!(summary.untouched_targets.is_empty());
    assert!(close(summary.spent, 7.0 * unit_cost()));
}

/// Drops the progress table behind the orchestrator's back after the first unit.
struct TableDroppingSink {
    db_path: Utf8PathBuf,
    seen: Mutex<usize>,
}

impl ProgressSink for TableDroppingSink {
    fn event(&self, _event: UnitEvent) {
        let mut seen = self.seen.lock().unwrap();
        *seen += 1;
        if *seen == 1 {
            let conn = rusqlite::Connection::open(self.db_path.as_std_path()).unwrap();
            conn.execute_batch("DROP TABLE backfill_progress").unwrap();
        }
    }
}

#[test]
fn storage_failure_mid_run_still_returns_the_summary() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = Utf8PathBuf::from_path_buf(dir.path().join("weather.db")).unwrap();
    let catalog = catalog(&[("Northwoods", &["a", "b", "c"])]);
    let transport = ScriptedTransport::new(vec![]);
    let sleeper = RecordingSleeper::default();
    let sink = TableDroppingSink {
        db_path: db_path.clone(),
        seen: Mutex::new(0),
    };
    let mut orchestrator = orchestrator(
        config(2026, 1000.0),
        &catalog,
        Store::open(&db_path).unwrap(),
        &transport,
        &sleeper,
    );

    let summary = orchestrator.run(&sink).unwrap();

    assert_eq!(summary.stop_reason, StopReason::StorageFailed);
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.observations_written, 2);
    assert!(summary.error.unwrap().contains("backfill_progress"));
    assert_eq!(summary.untouched_targets, vec![id("b"), id("c")]);

    let counts = orchestrator.store().observation_counts().unwrap();
    assert_eq!(counts.get(&id("a")), Some(&2));
    assert_eq!(counts.get(&id("b")), None);
}

const NOAA_FIRST_PAGE: &str = r#"{
    "metadata": {"resultset": {"offset": 1, "count": 2000, "limit": 1000}},
    "results": [{"date": "2026-01-05T00:00:00", "datatype": "SNOW", "value": 30.0}]
}"#;

#[test]
fn rate_limit_after_a_served_page_is_charged() {
    let catalog = CatalogLoader::parse(
        r#"{"groups": [{"name": "Upper Peninsula", "targets": [
            {"id": "marquette_mi", "latitude": 46.54, "longitude": -87.40,
             "name": "Marquette, MI", "station_ref": "USW00014838"}
        ]}]}"#,
    )
    .unwrap();
    let transport = ScriptedTransport::with_fallback(
        vec![Reply::Status(200, NOAA_FIRST_PAGE)],
        Reply::Status(429, ""),
    );
    let sleeper = RecordingSleeper::default();
    let mut config = RunConfig::for_provider(ProviderKind::Noaa, today());
    config.start_year = 2026;
    config.rate_limit = Duration::ZERO;
    config.fetch.max_rate_limit_retries = 0;
    config.fetch.circuit_breaker_threshold = 10;
    let provider = NoaaProvider::with_base_url("https://cdo.test/data", "token-123");
    let per_unit = provider.cost_model().unit_cost();
    let sink = RecordingSink::default();
    let mut orchestrator = Orchestrator::new(
        config,
        &catalog,
        Store::open_in_memory().unwrap(),
        provider,
        &transport,
        &sleeper,
    );

    let summary = orchestrator.run(&sink).unwrap();

    assert_eq!(transport.call_count(), 2);
    assert_eq!(summary.rate_limited, 1);
    assert!(close(summary.spent, per_unit));
    let events = sink.events.lock().unwrap();
    assert_matches!(&events[0].outcome, UnitOutcome::RateLimited { .. });
    assert!(close(events[0].charged, per_unit));
}
