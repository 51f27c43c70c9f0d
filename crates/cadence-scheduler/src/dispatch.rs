//! Turns due tasks into supervised processes.
//!
//! A *firing* is one due occurrence of a task together with every retry it
//! triggers. Each task has at most one firing in flight; a due occurrence that
//! finds the previous firing still queued, running or waiting to retry is
//! skipped and the skip is recorded. Processes start under one global ceiling
//! and wait for a slot in strict FIFO order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use cadence_core::{Execution, ExecutionId, ExecutionStatus, SkippedFiring, Task};
use cadence_runner::contract::{complete, encode_params};
use cadence_runner::ProcessSpec;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::DaemonContext;
use crate::error::{Result, SchedulerError};
use crate::retry::next_attempt_delay;

/// Reply slot for one request to start a process.
type Admission = oneshot::Sender<OwnedSemaphorePermit>;

/// Options for a run requested outside the schedule.
#[derive(Debug, Clone, Default)]
pub struct AdhocOptions {
    /// Replaces the task's configured parameter payload.
    pub stdin: Option<Vec<u8>>,
    /// Persist the execution through the normal store path.
    pub record: bool,
}

/// Result of an ad-hoc run, handed straight back to the caller.
#[derive(Debug, Clone)]
pub struct AdhocRun {
    pub execution: Execution,
    /// Raw stdout, before report parsing.
    pub stdout: Vec<u8>,
    pub recorded: bool,
}

/// Starts and supervises task executions. Cheap to clone.
///
/// Must be created inside a Tokio runtime: the FIFO admission queue runs as
/// its own task.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: Arc<DaemonContext>,
    admissions: mpsc::UnboundedSender<Admission>,
    in_flight: DashMap<String, Flight>,
    running: AtomicUsize,
    peak: AtomicUsize,
    /// Number of firings in flight; `wait_idle` waits for zero.
    active: watch::Sender<usize>,
}

struct Flight {
    cancel: CancellationToken,
    ids: Arc<Mutex<Vec<ExecutionId>>>,
}

impl Flight {
    fn current(&self) -> Option<ExecutionId> {
        lock(&self.ids).last().cloned()
    }
}

/// Exclusive right to run the current firing of one task.
struct Claim {
    cancel: CancellationToken,
    ids: Arc<Mutex<Vec<ExecutionId>>>,
    _guard: FlightGuard,
}

impl Claim {
    fn record(&self, id: ExecutionId) {
        lock(&self.ids).push(id);
    }
}

/// How one attempt treats its outputs.
#[derive(Debug, Clone, Copy)]
struct Attempt {
    /// Hand raw stdout back to the caller.
    keep_stdout: bool,
    /// Commit the state the task wrote if it succeeds.
    commit_state: bool,
}

impl Attempt {
    const SCHEDULED: Self = Self {
        keep_stdout: false,
        commit_state: true,
    };

    /// Unrecorded ad-hoc runs leave the committed state alone.
    fn adhoc(record: bool) -> Self {
        Self {
            keep_stdout: true,
            commit_state: record,
        }
    }
}

/// Releases the in-flight slot however the firing ends.
struct FlightGuard {
    inner: Arc<Inner>,
    task: String,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.remove(&self.task);
        self.inner
            .active
            .send_modify(|active| *active = active.saturating_sub(1));
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle to a firing started by [`Dispatcher::dispatch`] or [`Dispatcher::fire`].
pub struct ExecutionHandle {
    task: String,
    ids: Arc<Mutex<Vec<ExecutionId>>>,
    join: JoinHandle<Vec<Execution>>,
}

impl ExecutionHandle {
    pub fn task(&self) -> &str {
        &self.task
    }

    /// True once every attempt has finished and been handed to the store.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Ids of the attempts started so far, oldest first.
    pub fn execution_ids(&self) -> Vec<ExecutionId> {
        lock(&self.ids).clone()
    }

    /// Wait for the firing to finish. Returns every attempt in order; empty
    /// when the firing was cancelled before its first process started.
    pub async fn wait(self) -> Result<Vec<Execution>> {
        Ok(self.join.await?)
    }
}

impl Dispatcher {
    pub fn new(ctx: Arc<DaemonContext>) -> Self {
        let ceiling = Arc::new(Semaphore::new(ctx.settings.max_concurrent.max(1)));
        let (admissions, requests) = mpsc::unbounded_channel();
        tokio::spawn(admit_in_order(ceiling, requests));
        let (active, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                ctx,
                admissions,
                in_flight: DashMap::new(),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                active,
            }),
        }
    }

    /// Start a firing of `task` at `attempt` (normally 1).
    ///
    /// Fails with [`SchedulerError::AlreadyRunning`] while a previous firing
    /// of the same task is in flight.
    pub fn dispatch(&self, task: Arc<Task>, attempt: u32) -> Result<ExecutionHandle> {
        if self.inner.ctx.is_shutting_down() {
            return Err(SchedulerError::ShuttingDown);
        }
        let claim = self.claim(&task.name).map_err(|_| SchedulerError::AlreadyRunning {
            task: task.name.clone(),
        })?;
        Ok(self.launch(task, attempt.max(1), None, claim))
    }

    /// Start the firing due at `due_at`, or record it as skipped when the
    /// previous firing of the task is still in flight.
    pub fn fire(&self, task: Arc<Task>, due_at: DateTime<Utc>) -> Option<ExecutionHandle> {
        if self.inner.ctx.is_shutting_down() {
            return None;
        }
        match self.claim(&task.name) {
            Ok(claim) => Some(self.launch(task, 1, Some(due_at), claim)),
            Err(blocking) => {
                self.record_skip(&task.name, due_at, blocking);
                None
            }
        }
    }

    /// Run `task` once outside the schedule and return its result directly.
    ///
    /// Shares the ceiling and the one-firing-per-task rule with scheduled
    /// runs. Never retried; persisted only when `options.record` is set.
    pub async fn dispatch_adhoc(&self, task: Arc<Task>, options: AdhocOptions) -> Result<AdhocRun> {
        if self.inner.ctx.is_shutting_down() {
            return Err(SchedulerError::ShuttingDown);
        }
        let claim = self.claim(&task.name).map_err(|_| SchedulerError::AlreadyRunning {
            task: task.name.clone(),
        })?;
        let admission = self.inner.request_admission();
        let permit = tokio::select! {
            permit = admission => permit.map_err(|_| SchedulerError::ShuttingDown)?,
            _ = claim.cancel.cancelled() => return Err(SchedulerError::ShuttingDown),
        };
        let (execution, stdout) = self
            .inner
            .run_attempt(&task, 1, None, options.stdin, &claim, Attempt::adhoc(options.record))
            .await;
        drop(permit);

        let recorded = options.record && self.inner.persist(&execution).await;
        Ok(AdhocRun {
            execution,
            stdout,
            recorded,
        })
    }

    /// Cancel the in-flight firing of `task`. Returns false when there is none.
    pub fn cancel(&self, task: &str) -> bool {
        match self.inner.in_flight.get(task) {
            Some(flight) => {
                info!(task, "cancelling in-flight execution");
                flight.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight firing. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for flight in self.inner.in_flight.iter() {
            flight.cancel.cancel();
            cancelled += 1;
        }
        cancelled
    }

    /// Processes currently running.
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Highest number of processes that ran at the same time.
    pub fn peak_running(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    /// Firings queued, running or waiting to retry.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn is_in_flight(&self, task: &str) -> bool {
        self.inner.in_flight.contains_key(task)
    }

    /// Resolve once no firing is in flight.
    pub async fn wait_idle(&self) {
        let mut active = self.inner.active.subscribe();
        // The sender lives as long as `self`, so this only ends at zero.
        let _ = active.wait_for(|count| *count == 0).await;
    }

    // --- private helpers ---------------------------------------------------

    /// Take the in-flight slot of `task`, or return the execution blocking it.
    fn claim(&self, task: &str) -> std::result::Result<Claim, Option<ExecutionId>> {
        match self.inner.in_flight.entry(task.to_string()) {
            Entry::Occupied(entry) => Err(entry.get().current()),
            Entry::Vacant(entry) => {
                let flight = Flight {
                    cancel: self.inner.ctx.shutdown.child_token(),
                    ids: Arc::default(),
                };
                let claim = Claim {
                    cancel: flight.cancel.clone(),
                    ids: Arc::clone(&flight.ids),
                    _guard: FlightGuard {
                        inner: Arc::clone(&self.inner),
                        task: task.to_string(),
                    },
                };
                entry.insert(flight);
                self.inner.active.send_modify(|active| *active += 1);
                Ok(claim)
            }
        }
    }

    fn launch(
        &self,
        task: Arc<Task>,
        first_attempt: u32,
        scheduled_for: Option<DateTime<Utc>>,
        claim: Claim,
    ) -> ExecutionHandle {
        // Queued before spawning so slots are granted in dispatch order.
        let admission = self.inner.request_admission();
        let ids = Arc::clone(&claim.ids);
        let name = task.name.clone();
        let inner = Arc::clone(&self.inner);
        let join = tokio::spawn(async move {
            inner
                .run_firing(task, first_attempt, scheduled_for, claim, admission)
                .await
        });
        ExecutionHandle {
            task: name,
            ids,
            join,
        }
    }

    fn record_skip(&self, task: &str, due_at: DateTime<Utc>, blocking: Option<ExecutionId>) {
        warn!(
            task,
            due_at = %due_at,
            blocking = ?blocking.as_ref().map(ExecutionId::as_str),
            "previous firing still in flight; skipping"
        );
        let skip = SkippedFiring {
            task: task.to_string(),
            due_at,
            skipped_at: Utc::now(),
            blocking_execution: blocking,
        };
        if let Err(e) = self.inner.ctx.store.record_skip(&skip) {
            warn!(task, "failed to record skipped firing: {e}");
        }
    }
}

impl Inner {
    fn request_admission(&self) -> oneshot::Receiver<OwnedSemaphorePermit> {
        let (reply, receiver) = oneshot::channel();
        if self.admissions.send(reply).is_err() {
            error!("admission queue closed");
        }
        receiver
    }

    async fn run_firing(
        self: Arc<Self>,
        task: Arc<Task>,
        mut attempt: u32,
        scheduled_for: Option<DateTime<Utc>>,
        claim: Claim,
        mut admission: oneshot::Receiver<OwnedSemaphorePermit>,
    ) -> Vec<Execution> {
        let mut finished = Vec::new();
        loop {
            let permit = tokio::select! {
                permit = &mut admission => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = claim.cancel.cancelled() => {
                    debug!(task = %task.name, attempt, "cancelled while queued");
                    break;
                }
            };
            let (execution, _) = self
                .run_attempt(&task, attempt, scheduled_for, None, &claim, Attempt::SCHEDULED)
                .await;
            drop(permit);

            self.persist(&execution).await;
            let delay = next_attempt_delay(&task.retry, &execution);
            finished.push(execution);

            let Some(delay) = delay else { break };
            if !self.still_enabled(&task.name) {
                info!(task = %task.name, "task disabled or removed; not retrying");
                break;
            }
            info!(
                task = %task.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = claim.cancel.cancelled() => break,
            }
            attempt += 1;
            admission = self.request_admission();
        }
        finished
    }

    /// Run one attempt to its terminal state. Returns raw stdout only when
    /// `mode.keep_stdout` is set.
    async fn run_attempt(
        &self,
        task: &Task,
        attempt: u32,
        scheduled_for: Option<DateTime<Utc>>,
        stdin: Option<Vec<u8>>,
        claim: &Claim,
        mode: Attempt,
    ) -> (Execution, Vec<u8>) {
        let mut execution = Execution::begin(&task.name, attempt, scheduled_for);
        claim.record(execution.id.clone());

        let stdin = match stdin {
            Some(bytes) => Some(bytes),
            None => match task.params.as_ref().map(encode_params).transpose() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(task = %task.name, execution_id = %execution.id, "{e}");
                    execution.status = ExecutionStatus::Crashed;
                    execution.finished_at = Some(Utc::now());
                    execution.stderr = format!("cadence: {e}\n");
                    return (execution, Vec::new());
                }
            },
        };

        let spec = ProcessSpec::for_task(task, stdin, self.ctx.settings.kill_grace)
            .with_state(self.load_state(&task.name))
            .with_env("CADENCE_TASK", task.name.as_str())
            .with_env("CADENCE_EXECUTION_ID", execution.id.as_str())
            .with_env("CADENCE_ATTEMPT", attempt.to_string());

        let mut outcome = {
            let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            let _running = RunningGuard(&self.running);
            self.peak.fetch_max(now_running, Ordering::SeqCst);
            info!(
                task = %task.name,
                execution_id = %execution.id,
                attempt,
                running = now_running,
                "execution started"
            );
            self.ctx.runner.run(spec, claim.cancel.child_token()).await
        };

        let stdout = if mode.keep_stdout {
            outcome.stdout.clone()
        } else {
            Vec::new()
        };
        let next_state = outcome.state.take();
        complete(&mut execution, outcome, task.report_format, task.timeout);

        // Only a clean exit commits what the task wrote on its state channel.
        if mode.commit_state && execution.status == ExecutionStatus::Succeeded {
            if let Some(state) = next_state {
                self.commit_state(&task.name, &state).await;
            }
        }

        let duration_ms = execution
            .duration()
            .map(|d| d.num_milliseconds())
            .unwrap_or_default();
        if execution.status == ExecutionStatus::Succeeded {
            info!(
                task = %task.name,
                execution_id = %execution.id,
                attempt,
                duration_ms,
                "execution succeeded"
            );
        } else {
            warn!(
                task = %task.name,
                execution_id = %execution.id,
                attempt,
                status = %execution.status,
                exit_code = ?execution.exit_code,
                signal = ?execution.signal,
                duration_ms,
                "execution did not succeed"
            );
        }
        if let Some(violation) = &execution.contract_violation {
            debug!(task = %task.name, execution_id = %execution.id, "report kept as text: {violation}");
        }
        (execution, stdout)
    }

    /// Write a terminal execution, retrying until it lands or the daemon
    /// shuts down. Returns false only when the record was given up.
    async fn persist(&self, execution: &Execution) -> bool {
        loop {
            match self.ctx.store.put(execution) {
                Ok(true) => {
                    debug!(execution_id = %execution.id, "execution recorded");
                    return true;
                }
                Ok(false) => {
                    warn!(execution_id = %execution.id, "execution already recorded");
                    return true;
                }
                Err(e) if self.ctx.is_shutting_down() => {
                    let record = serde_json::to_string(execution)
                        .unwrap_or_else(|_| format!("{execution:?}"));
                    error!(
                        execution_id = %execution.id,
                        record = %record,
                        "store unavailable at shutdown; execution not recorded: {e}"
                    );
                    return false;
                }
                Err(e) => {
                    warn!(
                        execution_id = %execution.id,
                        retry_ms = self.ctx.settings.store_retry.as_millis() as u64,
                        "store write failed, will retry: {e}"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.ctx.settings.store_retry) => {}
                        _ = self.ctx.shutdown.cancelled() => {}
                    }
                }
            }
        }
    }

    /// Committed state of `task`, or empty when there is none or it cannot
    /// be read.
    fn load_state(&self, task: &str) -> Vec<u8> {
        match self.ctx.store.load_task_state(task) {
            Ok(state) => state.unwrap_or_default(),
            Err(e) => {
                warn!(task, "failed to load task state; starting from empty: {e}");
                Vec::new()
            }
        }
    }

    /// Commit `state` for `task`, retrying like [`Inner::persist`].
    async fn commit_state(&self, task: &str, state: &[u8]) {
        loop {
            match self.ctx.store.save_task_state(task, state) {
                Ok(()) => return,
                Err(e) if self.ctx.is_shutting_down() => {
                    error!(
                        task,
                        state = %String::from_utf8_lossy(state),
                        "store unavailable at shutdown; task state not committed: {e}"
                    );
                    return;
                }
                Err(e) => {
                    warn!(task, "task state write failed, will retry: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(self.ctx.settings.store_retry) => {}
                        _ = self.ctx.shutdown.cancelled() => {}
                    }
                }
            }
        }
    }

    fn still_enabled(&self, task: &str) -> bool {
        self.ctx
            .registry
            .snapshot()
            .get(task)
            .is_some_and(|task| task.enabled)
    }
}

/// Grant ceiling slots one at a time, in request order.
async fn admit_in_order(
    ceiling: Arc<Semaphore>,
    mut requests: mpsc::UnboundedReceiver<Admission>,
) {
    while let Some(reply) = requests.recv().await {
        let Ok(permit) = Arc::clone(&ceiling).acquire_owned().await else {
            break;
        };
        // A requester that gave up drops the slot straight away.
        let _ = reply.send(permit);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
