use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::context::DaemonContext;
use crate::dispatch::{Dispatcher, ExecutionHandle};
use crate::error::Result;

/// How often expired executions are purged when retention is configured.
const RETENTION_SWEEP_PERIOD: Duration = Duration::from_secs(3_600);

/// Whether the loop is between ticks or evaluating one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Ticking,
}

/// What one tick did.
#[derive(Default)]
pub struct TickReport {
    /// Firings started, in registry order.
    pub fired: Vec<ExecutionHandle>,
    /// Tasks that were due but still in flight from an earlier firing.
    pub skipped: Vec<String>,
}

/// The scheduler loop: on every tick, fires each enabled task that became due
/// since the last evaluated instant.
///
/// The last evaluated instant (the baseline) is persisted after every tick,
/// so a restarted daemon evaluates the window it missed exactly once. With no
/// baseline at all the first tick only records one and fires nothing.
pub struct SchedulerEngine {
    ctx: Arc<DaemonContext>,
    dispatcher: Dispatcher,
    baseline: Option<DateTime<Utc>>,
    state: EngineState,
}

impl SchedulerEngine {
    /// Create an engine, loading the persisted baseline.
    pub fn new(ctx: Arc<DaemonContext>) -> Result<Self> {
        let baseline = ctx.store.load_baseline()?;
        let dispatcher = Dispatcher::new(Arc::clone(&ctx));
        Ok(Self {
            ctx,
            dispatcher,
            baseline,
            state: EngineState::Idle,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn baseline(&self) -> Option<DateTime<Utc>> {
        self.baseline
    }

    /// Evaluate the window `(baseline, now]` once.
    ///
    /// A staged registry is swapped in first, so reloads only ever land on a
    /// tick boundary. Every missed occurrence of a task inside the window
    /// collapses into a single firing.
    pub fn tick_at(&mut self, now: DateTime<Utc>) -> TickReport {
        self.state = EngineState::Ticking;
        let report = self.evaluate(now);
        self.state = EngineState::Idle;
        report
    }

    /// Main event loop. Ticks until `shutdown` broadcasts `true`, then
    /// cancels everything in flight and waits up to the shutdown grace.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let settings = self.ctx.settings.clone();
        info!(
            tick_ms = settings.tick.as_millis() as u64,
            max_concurrent = settings.max_concurrent,
            "scheduler engine started"
        );

        let mut interval = tokio::time::interval(settings.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep = tokio::time::interval(RETENTION_SWEEP_PERIOD);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let elapsed = last_tick.elapsed();
                    last_tick = Instant::now();
                    if elapsed > settings.tick * 2 {
                        warn!(
                            elapsed_ms = elapsed.as_millis() as u64,
                            "scheduler loop stalled; evaluating the missed window once"
                        );
                    }
                    let report = self.tick_at(Utc::now());
                    if !report.fired.is_empty() || !report.skipped.is_empty() {
                        debug!(
                            fired = report.fired.len(),
                            skipped = report.skipped.len(),
                            "tick evaluated"
                        );
                    }
                }
                _ = sweep.tick(), if settings.retention.is_some() => {
                    if let Err(e) = self.sweep_expired(Utc::now()) {
                        error!("retention sweep failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Purge executions older than the configured retention.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let Some(retention) = self.ctx.settings.retention else {
            return Ok(0);
        };
        let removed = self.ctx.store.purge_before(now - retention)?;
        if removed > 0 {
            info!(removed, "expired executions purged");
        }
        Ok(removed)
    }

    // --- private helpers ---------------------------------------------------

    fn evaluate(&mut self, now: DateTime<Utc>) -> TickReport {
        self.ctx.registry.apply_staged();
        let registry = self.ctx.registry.snapshot();
        let mut report = TickReport::default();

        let Some(baseline) = self.baseline else {
            info!(%now, "no check baseline; schedules start from now");
            self.advance(now);
            return report;
        };
        if now <= baseline {
            debug!(%now, %baseline, "clock has not passed the baseline; nothing to evaluate");
            return report;
        }

        let tz = registry.time_reference();
        for task in registry.enabled() {
            // One task's schedule must never take the loop down with it.
            let resolved = panic::catch_unwind(AssertUnwindSafe(|| task.schedule.next_due(baseline, &tz)));
            let due = match resolved {
                Ok(Some(due)) => due,
                Ok(None) => {
                    debug!(task = %task.name, "no due instant after the baseline");
                    continue;
                }
                Err(_) => {
                    error!(task = %task.name, schedule = %task.schedule, "schedule resolution failed; task skipped");
                    continue;
                }
            };
            if due > now {
                continue;
            }
            debug!(task = %task.name, due = %due, "task due");
            match self.dispatcher.fire(Arc::clone(task), due) {
                Some(handle) => report.fired.push(handle),
                None => report.skipped.push(task.name.clone()),
            }
        }

        self.advance(now);
        report
    }

    /// Move the baseline to `now`. A failed save is retried by the next tick.
    fn advance(&mut self, now: DateTime<Utc>) {
        self.baseline = Some(now);
        if let Err(e) = self.ctx.store.save_baseline(now) {
            warn!("failed to persist check baseline: {e}");
        }
    }

    async fn shutdown(self) {
        let in_flight = self.dispatcher.in_flight();
        info!(in_flight, "scheduler engine shutting down");
        self.ctx.shutdown.cancel();
        self.dispatcher.cancel_all();

        let grace = self.ctx.settings.shutdown_grace;
        if tokio::time::timeout(grace, self.dispatcher.wait_idle())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.dispatcher.in_flight(),
                "shutdown grace elapsed with executions still in flight"
            );
        } else {
            info!("scheduler engine stopped");
        }
    }
}
