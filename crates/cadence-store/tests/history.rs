use cadence_core::{Execution, ExecutionStatus, Report};
use cadence_store::{ExecutionFilter, ExecutionStore, SqliteStore};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn record(task: &str, minute: i64, status: ExecutionStatus) -> Execution {
    let mut execution = Execution::begin(task, 1, None);
    execution.started_at = base() + Duration::minutes(minute);
    execution.finished_at = Some(execution.started_at + Duration::seconds(1));
    execution.status = status;
    execution
}

#[test]
fn listing_is_ordered_and_filtered() {
    let store = SqliteStore::open_in_memory().unwrap();
    // Inserted out of order on purpose.
    for (task, minute, status) in [
        ("b", 3, ExecutionStatus::Failed),
        ("a", 1, ExecutionStatus::Succeeded),
        ("a", 2, ExecutionStatus::TimedOut),
        ("b", 0, ExecutionStatus::Succeeded),
    ] {
        store.put(&record(task, minute, status)).unwrap();
    }

    let all: Vec<Execution> = store
        .list(ExecutionFilter::default())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    let minutes: Vec<i64> = all
        .iter()
        .map(|e| (e.started_at - base()).num_minutes())
        .collect();
    assert_eq!(minutes, vec![0, 1, 2, 3]);

    let only_a: Vec<Execution> = store
        .list(ExecutionFilter::for_task("a"))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(only_a.len(), 2);
    assert!(only_a.iter().all(|e| e.task == "a"));

    let failed = store
        .list(ExecutionFilter::default().with_status(ExecutionStatus::Failed))
        .unwrap()
        .count();
    assert_eq!(failed, 1);

    let window = ExecutionFilter {
        since: Some(base() + Duration::minutes(1)),
        until: Some(base() + Duration::minutes(3)),
        ..ExecutionFilter::default()
    };
    assert_eq!(store.list(window).unwrap().count(), 2);

    assert_eq!(store.list(ExecutionFilter::default().with_limit(3)).unwrap().count(), 3);
}

#[test]
fn ties_on_start_instant_are_broken_by_id() {
    let store = SqliteStore::open_in_memory().unwrap();
    let first = record("t", 5, ExecutionStatus::Succeeded);
    let second = record("t", 5, ExecutionStatus::Succeeded);
    assert!(second.id > first.id);
    store.put(&second).unwrap();
    store.put(&first).unwrap();

    let ids: Vec<String> = store
        .list(ExecutionFilter::default())
        .unwrap()
        .map(|e| e.unwrap().id.to_string())
        .collect();
    assert_eq!(ids, vec![first.id.to_string(), second.id.to_string()]);
}

#[test]
fn listing_spans_many_pages_and_is_restartable() {
    let store = SqliteStore::open_in_memory().unwrap();
    for minute in 0..700 {
        store.put(&record("bulk", minute, ExecutionStatus::Succeeded)).unwrap();
    }

    let first_pass: Vec<Execution> = store
        .list(ExecutionFilter::default())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(first_pass.len(), 700);
    assert!(first_pass.windows(2).all(|w| w[0].started_at < w[1].started_at));

    let second_pass = store.list(ExecutionFilter::default()).unwrap().count();
    assert_eq!(second_pass, 700);
}

#[test]
fn listing_ignores_rows_written_after_it_started() {
    let store = SqliteStore::open_in_memory().unwrap();
    for minute in 0..300 {
        store.put(&record("t", minute, ExecutionStatus::Succeeded)).unwrap();
    }

    let mut listing = store.list(ExecutionFilter::default()).unwrap();
    let mut seen = 0;
    while let Some(item) = listing.next() {
        item.unwrap();
        seen += 1;
        if seen == 10 {
            // Sorts after everything already listed.
            store
                .put(&record("t", 10_000, ExecutionStatus::Succeeded))
                .unwrap();
        }
    }
    assert_eq!(seen, 300);
    assert_eq!(store.list(ExecutionFilter::default()).unwrap().count(), 301);
}

#[test]
fn report_roundtrips_through_listing() {
    let store = SqliteStore::open_in_memory().unwrap();
    let mut structured = record("r", 0, ExecutionStatus::Succeeded);
    structured.report = Some(Report::Structured(json!({
        "processed": 42,
        "nested": { "ok": true, "ratio": 0.5 },
        "items": ["x", null, 3]
    })));
    let mut raw = record("r", 1, ExecutionStatus::Succeeded);
    raw.report = Some(Report::Unstructured("plain output\n".into()));
    raw.contract_violation = Some("stdout is not a JSON, TOML or YAML document".into());

    store.put(&structured).unwrap();
    store.put(&raw).unwrap();

    let listed: Vec<Execution> = store
        .list(ExecutionFilter::for_task("r"))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(listed[0].report, structured.report);
    assert_eq!(listed[1].report, raw.report);
    assert_eq!(listed[1].contract_violation, raw.contract_violation);
}

#[test]
fn purge_removes_only_older_records() {
    let store = SqliteStore::open_in_memory().unwrap();
    for minute in 0..10 {
        store.put(&record("p", minute, ExecutionStatus::Succeeded)).unwrap();
    }
    let removed = store.purge_before(base() + Duration::minutes(4)).unwrap();
    assert_eq!(removed, 4);
    let remaining: Vec<Execution> = store
        .list(ExecutionFilter::default())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(remaining.len(), 6);
    assert_eq!((remaining[0].started_at - base()).num_minutes(), 4);
}

#[test]
fn records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cadence.db");
    let execution = record("durable", 0, ExecutionStatus::Crashed);
    {
        let store = SqliteStore::open(&path).unwrap();
        store.put(&execution).unwrap();
        store.save_baseline(base()).unwrap();
    }
    let store = SqliteStore::open(&path).unwrap();
    let loaded = store.get(&execution.id).unwrap().unwrap();
    assert_eq!(loaded.status, ExecutionStatus::Crashed);
    assert_eq!(store.load_baseline().unwrap(), Some(base()));
}
