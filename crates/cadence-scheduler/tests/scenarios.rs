use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::{
    Backoff, Execution, ExecutionId, ExecutionStatus, RegistryHandle, Report, ReportFormat,
    RetryPolicy, SkippedFiring, Task, TaskRegistry,
};
use cadence_runner::{OsProcessRunner, ProcessOutcome, ProcessRunner, ProcessSpec};
use cadence_schedule::{Schedule, TimeReference};
use cadence_scheduler::{
    AdhocOptions, DaemonContext, DispatchSettings, EngineState, SchedulerEngine, SchedulerError,
};
use cadence_store::{
    ExecutionFilter, ExecutionIter, ExecutionStore, SqliteStore, StoreError,
};
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const PATH: &str = "/usr/local/bin:/usr/bin:/bin";

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 30).unwrap()
}

fn minutes(n: i64) -> chrono::Duration {
    chrono::Duration::minutes(n)
}

fn settings(max_concurrent: usize) -> DispatchSettings {
    DispatchSettings {
        tick: Duration::from_millis(100),
        max_concurrent,
        kill_grace: Duration::from_secs(1),
        store_retry: Duration::from_millis(50),
        shutdown_grace: Duration::from_secs(5),
        retention: None,
    }
}

/// A `/bin/sh -c <script>` task on `schedule`.
fn shell_task(name: &str, script: &str, schedule: &str) -> Task {
    let mut env = BTreeMap::new();
    env.insert("PATH".to_string(), PATH.to_string());
    Task {
        name: name.to_string(),
        program: PathBuf::from("/bin/sh"),
        args: vec!["-c".to_string(), script.to_string()],
        env,
        cwd: None,
        schedule: Schedule::parse(schedule, name).unwrap(),
        timeout: Duration::from_secs(30),
        retry: RetryPolicy::default(),
        enabled: true,
        params: None,
        report_format: ReportFormat::Auto,
    }
}

fn context(
    tasks: Vec<Task>,
    store: Arc<dyn ExecutionStore>,
    runner: Arc<dyn ProcessRunner>,
    settings: DispatchSettings,
) -> Arc<DaemonContext> {
    let registry = TaskRegistry::from_tasks(tasks, TimeReference::Utc);
    Arc::new(DaemonContext::new(
        Arc::new(RegistryHandle::new(registry)),
        store,
        runner,
        settings,
    ))
}

fn all_executions(store: &dyn ExecutionStore, task: &str) -> Vec<Execution> {
    store
        .list(ExecutionFilter::for_task(task))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap()
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Fails the first `failures` writes, then delegates.
struct FlakyStore {
    inner: SqliteStore,
    failures: usize,
    attempts: AtomicUsize,
}

impl ExecutionStore for FlakyStore {
    fn put(&self, execution: &Execution) -> cadence_store::Result<bool> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(StoreError::Unavailable("disk detached".into()));
        }
        self.inner.put(execution)
    }
    fn get(&self, id: &ExecutionId) -> cadence_store::Result<Option<Execution>> {
        self.inner.get(id)
    }
    fn list(&self, filter: ExecutionFilter) -> cadence_store::Result<ExecutionIter<'_>> {
        self.inner.list(filter)
    }
    fn purge_before(&self, cutoff: DateTime<Utc>) -> cadence_store::Result<usize> {
        self.inner.purge_before(cutoff)
    }
    fn record_skip(&self, skip: &SkippedFiring) -> cadence_store::Result<()> {
        self.inner.record_skip(skip)
    }
    fn list_skips(&self, task: Option<&str>, limit: usize) -> cadence_store::Result<Vec<SkippedFiring>> {
        self.inner.list_skips(task, limit)
    }
    fn load_baseline(&self) -> cadence_store::Result<Option<DateTime<Utc>>> {
        self.inner.load_baseline()
    }
    fn save_baseline(&self, instant: DateTime<Utc>) -> cadence_store::Result<()> {
        self.inner.save_baseline(instant)
    }
    fn load_task_state(&self, task: &str) -> cadence_store::Result<Option<Vec<u8>>> {
        self.inner.load_task_state(task)
    }
    fn save_task_state(&self, task: &str, state: &[u8]) -> cadence_store::Result<()> {
        self.inner.save_task_state(task, state)
    }
}

/// Delegates to the OS runner and tracks how many processes overlap.
#[derive(Default)]
struct CountingRunner {
    current: AtomicUsize,
    max: AtomicUsize,
}

#[async_trait]
impl ProcessRunner for CountingRunner {
    async fn run(&self, spec: ProcessSpec, cancel: CancellationToken) -> ProcessOutcome {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        let outcome = OsProcessRunner.run(spec, cancel).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn echo_every_minute_for_three_minutes() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let ctx = context(
        vec![shell_task("echo-ok", "echo", "every 1 minute")],
        store.clone(),
        Arc::new(OsProcessRunner),
        settings(4),
    );
    let mut engine = SchedulerEngine::new(ctx).unwrap();

    // First start only records the baseline.
    assert!(engine.tick_at(base()).fired.is_empty());
    assert_eq!(engine.baseline(), Some(base()));

    for minute in 1..=3 {
        let report = engine.tick_at(base() + minutes(minute));
        assert_eq!(report.fired.len(), 1);
        for handle in report.fired {
            handle.wait().await.unwrap();
        }
    }
    assert_eq!(engine.state(), EngineState::Idle);

    let executions = all_executions(store.as_ref(), "echo-ok");
    assert_eq!(executions.len(), 3);
    for (minute, execution) in (1..=3).zip(&executions) {
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        assert_eq!(execution.exit_code, Some(0));
        assert_eq!(execution.report, None);
        assert_eq!(execution.contract_violation, None);
        assert_eq!(
            execution.scheduled_for,
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).unwrap())
        );
    }
}

#[tokio::test]
async fn sleep_forever_times_out() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let mut task = shell_task("sleep-forever", "sleep 600", "every 1 hour");
    task.timeout = Duration::from_secs(5);
    let task = Arc::new(task);
    let ctx = context(
        vec![(*task).clone()],
        store.clone(),
        Arc::new(OsProcessRunner),
        settings(4),
    );
    let engine = SchedulerEngine::new(ctx).unwrap();

    let handle = engine.dispatcher().dispatch(task, 1).unwrap();
    let executions = handle.wait().await.unwrap();
    assert_eq!(executions.len(), 1);

    let execution = &executions[0];
    assert_eq!(execution.status, ExecutionStatus::TimedOut);
    assert!(!execution.cancelled);
    let elapsed = execution.duration().unwrap();
    assert!(elapsed >= chrono::Duration::seconds(5), "{elapsed}");
    assert!(elapsed < chrono::Duration::seconds(6) + chrono::Duration::milliseconds(500), "{elapsed}");
    assert!(execution.stderr.contains("forcibly terminated"));

    let stored = store.get(&execution.id).unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::TimedOut);
}

#[tokio::test]
async fn fail_twice_then_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("count");
    let script = write_script(
        dir.path(),
        "flaky.sh",
        r#"n=$(cat "$1" 2>/dev/null || echo 0)
n=$((n + 1))
echo "$n" > "$1"
[ "$n" -ge 3 ]"#,
    );

    let mut task = shell_task("fail-twice-then-succeed", "", "every 1 hour");
    task.program = script;
    task.args = vec![counter.display().to_string()];
    task.retry = RetryPolicy {
        max_attempts: 3,
        backoff: Backoff::Fixed(Duration::from_secs(1)),
        retry_on_spawn_error: false,
    };
    let task = Arc::new(task);

    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let ctx = context(
        vec![(*task).clone()],
        store.clone(),
        Arc::new(OsProcessRunner),
        settings(4),
    );
    let engine = SchedulerEngine::new(ctx).unwrap();
    let handle = engine.dispatcher().dispatch(task, 1).unwrap();
    let attempts = handle.wait().await.unwrap();

    let statuses: Vec<_> = attempts.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![
            ExecutionStatus::Failed,
            ExecutionStatus::Failed,
            ExecutionStatus::Succeeded
        ]
    );
    assert_eq!(
        attempts.iter().map(|e| e.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    for pair in attempts.windows(2) {
        let gap = pair[1].started_at - pair[0].finished_at.unwrap();
        assert!(gap >= chrono::Duration::seconds(1), "gap {gap}");
    }
    assert_eq!(all_executions(store.as_ref(), "fail-twice-then-succeed").len(), 3);
}

#[tokio::test]
async fn store_outage_loses_nothing() {
    let store = Arc::new(FlakyStore {
        inner: SqliteStore::open_in_memory().unwrap(),
        failures: 3,
        attempts: AtomicUsize::new(0),
    });
    let task = Arc::new(shell_task("echo-ok", "echo", "every 1 minute"));
    let ctx = context(
        vec![(*task).clone()],
        store.clone(),
        Arc::new(OsProcessRunner),
        settings(4),
    );
    let engine = SchedulerEngine::new(ctx).unwrap();

    let handle = engine.dispatcher().dispatch(task, 1).unwrap();
    let executions = handle.wait().await.unwrap();

    assert_eq!(store.attempts.load(Ordering::SeqCst), 4);
    let stored = all_executions(store.as_ref(), "echo-ok");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, executions[0].id);
    assert_eq!(stored[0].status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn fifty_due_tasks_respect_the_ceiling() {
    let tasks: Vec<Task> = (0..50)
        .map(|i| shell_task(&format!("job-{i:02}"), "sleep 0.2", "every 1 minute"))
        .collect();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let runner = Arc::new(CountingRunner::default());
    let ctx = context(tasks, store.clone(), runner.clone(), settings(10));
    let mut engine = SchedulerEngine::new(ctx).unwrap();

    engine.tick_at(base());
    let report = engine.tick_at(base() + minutes(1));
    assert_eq!(report.fired.len(), 50);
    // Registry order is lexical.
    assert_eq!(report.fired[0].task(), "job-00");
    assert_eq!(report.fired[49].task(), "job-49");

    for handle in report.fired {
        let executions = handle.wait().await.unwrap();
        assert_eq!(executions.len(), 1);
        assert!(executions[0].is_terminal());
    }

    let max = runner.max.load(Ordering::SeqCst);
    assert!(max <= 10, "{max} processes ran at once");
    assert!(engine.dispatcher().peak_running() <= 10);
    assert_eq!(engine.dispatcher().running(), 0);
    assert_eq!(store.list(ExecutionFilter::default()).unwrap().count(), 50);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn persistent_failure_yields_exactly_max_attempts_records() {
    let mut task = shell_task("always-fails", "exit 3", "every 1 hour");
    task.retry = RetryPolicy {
        max_attempts: 4,
        backoff: Backoff::Fixed(Duration::from_millis(20)),
        retry_on_spawn_error: false,
    };
    let task = Arc::new(task);
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let ctx = context(
        vec![(*task).clone()],
        store.clone(),
        Arc::new(OsProcessRunner),
        settings(4),
    );
    let engine = SchedulerEngine::new(ctx).unwrap();

    let handle = engine.dispatcher().dispatch(task, 1).unwrap();
    let attempts = handle.wait().await.unwrap();
    assert_eq!(attempts.len(), 4);

    let stored = all_executions(store.as_ref(), "always-fails");
    assert_eq!(stored.len(), 4);
    assert!(stored.iter().all(|e| e.exit_code == Some(3)));
    assert_eq!(
        stored.iter().map(|e| e.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
}

#[tokio::test]
async fn spawn_failure_is_crashed_and_not_retried() {
    let mut task = shell_task("missing", "", "every 1 hour");
    task.program = PathBuf::from("/nonexistent/cadence-task");
    task.args.clear();
    task.retry.max_attempts = 3;
    let task = Arc::new(task);
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let ctx = context(
        vec![(*task).clone()],
        store.clone(),
        Arc::new(OsProcessRunner),
        settings(4),
    );
    let engine = SchedulerEngine::new(ctx).unwrap();

    let attempts = engine
        .dispatcher()
        .dispatch(task, 1)
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, ExecutionStatus::Crashed);
    assert_eq!(attempts[0].exit_code, None);
    assert_eq!(all_executions(store.as_ref(), "missing").len(), 1);
}

#[tokio::test]
async fn a_running_task_is_never_dispatched_twice() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let task = shell_task("slow", "sleep 1", "every 1 minute");
    let ctx = context(
        vec![task.clone()],
        store.clone(),
        Arc::new(OsProcessRunner),
        settings(4),
    );
    let mut engine = SchedulerEngine::new(ctx).unwrap();
    engine.tick_at(base());

    let first = engine.tick_at(base() + minutes(1));
    assert_eq!(first.fired.len(), 1);
    while engine.dispatcher().running() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let second = engine.tick_at(base() + minutes(2));
    assert!(second.fired.is_empty());
    assert_eq!(second.skipped, vec!["slow".to_string()]);

    let direct = engine.dispatcher().dispatch(Arc::new(task), 1);
    assert!(matches!(direct, Err(SchedulerError::AlreadyRunning { .. })));

    let blocking = first.fired[0].execution_ids();
    for handle in first.fired {
        handle.wait().await.unwrap();
    }
    assert!(!engine.dispatcher().is_in_flight("slow"));

    let skips = store.list_skips(Some("slow"), 10).unwrap();
    assert_eq!(skips.len(), 1);
    assert_eq!(
        skips[0].due_at,
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 2, 0).unwrap()
    );
    assert_eq!(skips[0].blocking_execution.as_ref(), blocking.first());
    assert_eq!(all_executions(store.as_ref(), "slow").len(), 1);
}

#[tokio::test]
async fn missed_window_fires_once() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    store.save_baseline(base()).unwrap();
    let ctx = context(
        vec![shell_task("echo-ok", "echo", "every 1 minute")],
        store.clone(),
        Arc::new(OsProcessRunner),
        settings(4),
    );

    // A restarted engine picks up the persisted baseline.
    let mut engine = SchedulerEngine::new(ctx).unwrap();
    assert_eq!(engine.baseline(), Some(base()));
    let report = engine.tick_at(base() + minutes(90));
    assert_eq!(report.fired.len(), 1);
    for handle in report.fired {
        handle.wait().await.unwrap();
    }
    assert_eq!(store.load_baseline().unwrap(), Some(base() + minutes(90)));

    // Clock going backwards evaluates nothing and keeps the baseline.
    assert!(engine.tick_at(base()).fired.is_empty());
    assert_eq!(engine.baseline(), Some(base() + minutes(90)));
    assert_eq!(all_executions(store.as_ref(), "echo-ok").len(), 1);
}

#[tokio::test]
async fn unresolvable_schedule_does_not_stop_other_tasks() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let mut stuck = shell_task("a", "echo", "every 1 minute");
    stuck.schedule = Schedule::Interval {
        every: Duration::from_secs(100_000_000 * 604_800),
    };
    let ctx = context(
        vec![stuck, shell_task("b", "echo", "every 1 minute")],
        store.clone(),
        Arc::new(OsProcessRunner),
        settings(4),
    );
    let mut engine = SchedulerEngine::new(ctx).unwrap();
    engine.tick_at(base());

    for minute in 1..=2 {
        let report = engine.tick_at(base() + minutes(minute));
        let fired: Vec<_> = report.fired.iter().map(|h| h.task().to_string()).collect();
        assert_eq!(fired, vec!["b"]);
        for handle in report.fired {
            handle.wait().await.unwrap();
        }
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.baseline(), Some(base() + minutes(minute)));
    }
    assert!(all_executions(store.as_ref(), "a").is_empty());
    assert_eq!(all_executions(store.as_ref(), "b").len(), 2);
}

#[tokio::test]
async fn task_state_carries_over_only_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let fail_flag = dir.path().join("fail");
    let script = write_script(
        dir.path(),
        "counter.sh",
        r#"n=$(cat <&3)
n=$((${n:-0} + 1))
printf '%s' "$n" >&4
echo "{\"count\": $n}"
[ ! -e "$1" ]"#,
    );
    let mut task = shell_task("counter", "", "every 1 hour");
    task.program = script;
    task.args = vec![fail_flag.display().to_string()];
    let task = Arc::new(task);

    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let ctx = context(
        vec![(*task).clone()],
        store.clone(),
        Arc::new(OsProcessRunner),
        settings(4),
    );
    let engine = SchedulerEngine::new(ctx).unwrap();
    let run = |task: Arc<Task>| {
        let dispatcher = engine.dispatcher().clone();
        async move { dispatcher.dispatch(task, 1).unwrap().wait().await.unwrap() }
    };

    run(Arc::clone(&task)).await;
    let second = run(Arc::clone(&task)).await;
    assert_eq!(
        second[0].report,
        Some(Report::Structured(serde_json::json!({ "count": 2 })))
    );
    assert_eq!(store.load_task_state("counter").unwrap(), Some(b"2".to_vec()));

    // A failed attempt sees the committed state but does not replace it.
    std::fs::write(&fail_flag, "").unwrap();
    let failed = run(Arc::clone(&task)).await;
    assert_eq!(failed[0].status, ExecutionStatus::Failed);
    assert_eq!(store.load_task_state("counter").unwrap(), Some(b"2".to_vec()));

    std::fs::remove_file(&fail_flag).unwrap();
    let next = run(Arc::clone(&task)).await;
    assert_eq!(
        next[0].report,
        Some(Report::Structured(serde_json::json!({ "count": 3 })))
    );

    // Unrecorded ad-hoc runs read the state but never commit it.
    let adhoc = engine
        .dispatcher()
        .dispatch_adhoc(task, AdhocOptions { stdin: None, record: false })
        .await
        .unwrap();
    assert_eq!(adhoc.stdout, b"{\"count\": 4}\n");
    assert_eq!(store.load_task_state("counter").unwrap(), Some(b"3".to_vec()));
}

#[tokio::test]
async fn staged_registry_lands_on_the_next_tick() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let ctx = context(
        vec![shell_task("echo-ok", "echo", "every 1 minute")],
        store.clone(),
        Arc::new(OsProcessRunner),
        settings(4),
    );
    let mut engine = SchedulerEngine::new(ctx.clone()).unwrap();
    engine.tick_at(base());

    let mut disabled = shell_task("echo-ok", "echo", "every 1 minute");
    disabled.enabled = false;
    ctx.registry
        .stage(TaskRegistry::from_tasks(vec![disabled], TimeReference::Utc));
    assert!(ctx.registry.snapshot().get("echo-ok").unwrap().enabled);

    assert!(engine.tick_at(base() + minutes(1)).fired.is_empty());
    assert!(!ctx.registry.snapshot().get("echo-ok").unwrap().enabled);
}

#[tokio::test]
async fn report_params_and_markers_reach_the_store() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let mut task = shell_task(
        "reporter",
        r#"read -r input; printf '{"input": %s, "task": "%s", "attempt": "%s"}' "$input" "$CADENCE_TASK" "$CADENCE_ATTEMPT""#,
        "every 1 hour",
    );
    task.params = Some(cadence_core::ParamPayload::Structured {
        value: serde_json::json!({ "rows": 3 }),
        format: cadence_core::ParamFormat::Json,
    });
    let task = Arc::new(task);
    let ctx = context(
        vec![(*task).clone()],
        store.clone(),
        Arc::new(OsProcessRunner),
        settings(4),
    );
    let engine = SchedulerEngine::new(ctx).unwrap();

    let attempts = engine
        .dispatcher()
        .dispatch(task, 1)
        .unwrap()
        .wait()
        .await
        .unwrap();
    let stored = store.get(&attempts[0].id).unwrap().unwrap();
    assert_eq!(
        stored.report,
        Some(Report::Structured(serde_json::json!({
            "input": { "rows": 3 },
            "task": "reporter",
            "attempt": "1"
        })))
    );
}

#[tokio::test]
async fn adhoc_runs_return_output_and_record_on_request() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let task = Arc::new(shell_task("cat", "cat", "every 1 hour"));
    let ctx = context(
        vec![(*task).clone()],
        store.clone(),
        Arc::new(OsProcessRunner),
        settings(4),
    );
    let engine = SchedulerEngine::new(ctx).unwrap();

    let run = engine
        .dispatcher()
        .dispatch_adhoc(
            Arc::clone(&task),
            AdhocOptions {
                stdin: Some(b"not a report\n".to_vec()),
                record: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(run.stdout, b"not a report\n");
    assert_eq!(run.execution.status, ExecutionStatus::Succeeded);
    assert!(run.execution.contract_violation.is_some());
    assert!(!run.recorded);
    assert!(all_executions(store.as_ref(), "cat").is_empty());

    let recorded = engine
        .dispatcher()
        .dispatch_adhoc(
            task,
            AdhocOptions {
                stdin: Some(b"- a\n- b\n".to_vec()),
                record: true,
            },
        )
        .await
        .unwrap();
    assert!(recorded.recorded);
    assert_eq!(recorded.execution.scheduled_for, None);
    let stored = store.get(&recorded.execution.id).unwrap().unwrap();
    assert_eq!(
        stored.report,
        Some(Report::Structured(serde_json::json!(["a", "b"])))
    );
}

#[tokio::test]
async fn cancellation_is_recorded_with_its_flag() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let task = Arc::new(shell_task("sleeper", "sleep 600", "every 1 hour"));
    let ctx = context(
        vec![(*task).clone()],
        store.clone(),
        Arc::new(OsProcessRunner),
        settings(4),
    );
    let engine = SchedulerEngine::new(ctx).unwrap();
    let dispatcher = engine.dispatcher().clone();

    let handle = dispatcher.dispatch(task, 1).unwrap();
    while dispatcher.running() == 0 {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(dispatcher.cancel("sleeper"));
    assert!(!dispatcher.cancel("unknown"));

    let attempts = handle.wait().await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, ExecutionStatus::TimedOut);
    assert!(attempts[0].cancelled);
    assert!(store.get(&attempts[0].id).unwrap().unwrap().cancelled);
}

#[tokio::test]
async fn shutdown_cancels_in_flight_work_and_records_it() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let ctx = context(
        vec![shell_task("sleeper", "sleep 600", "every 1s")],
        store.clone(),
        Arc::new(OsProcessRunner),
        settings(4),
    );
    let engine = SchedulerEngine::new(ctx.clone()).unwrap();
    let dispatcher = engine.dispatcher().clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_task = tokio::spawn(engine.run(shutdown_rx));

    tokio::time::timeout(Duration::from_secs(10), async {
        while dispatcher.running() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), loop_task)
        .await
        .unwrap()
        .unwrap();

    assert!(ctx.is_shutting_down());
    assert_eq!(dispatcher.in_flight(), 0);
    let stored = all_executions(store.as_ref(), "sleeper");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, ExecutionStatus::TimedOut);
    assert!(stored[0].cancelled);

    // Nothing new starts once shut down.
    let task = Arc::new(shell_task("sleeper", "sleep 600", "every 1s"));
    assert!(matches!(
        dispatcher.dispatch(task, 1),
        Err(SchedulerError::ShuttingDown)
    ));
}

#[tokio::test]
async fn retention_sweep_purges_old_records() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let mut old = Execution::begin("echo-ok", 1, None);
    old.status = ExecutionStatus::Succeeded;
    old.started_at = Utc::now() - chrono::Duration::days(40);
    old.finished_at = Some(old.started_at);
    store.put(&old).unwrap();

    let mut with_retention = settings(4);
    with_retention.retention = Some(chrono::Duration::days(30));
    let ctx = context(
        vec![shell_task("echo-ok", "echo", "every 1 minute")],
        store.clone(),
        Arc::new(OsProcessRunner),
        with_retention,
    );
    let engine = SchedulerEngine::new(ctx).unwrap();
    assert_eq!(engine.sweep_expired(Utc::now()).unwrap(), 1);
    assert!(store.get(&old.id).unwrap().is_none());
}
