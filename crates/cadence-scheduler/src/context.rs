use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::CadenceConfig;
use cadence_core::RegistryHandle;
use cadence_runner::ProcessRunner;
use cadence_store::ExecutionStore;
use tokio_util::sync::CancellationToken;

/// Timing and capacity knobs shared by the dispatcher and the loop.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Scheduler loop period.
    pub tick: Duration,
    /// Global ceiling on concurrently running processes.
    pub max_concurrent: usize,
    pub kill_grace: Duration,
    /// Delay between attempts to persist an execution after a store failure.
    pub store_retry: Duration,
    /// How long shutdown waits for cancelled executions to be recorded.
    pub shutdown_grace: Duration,
    /// Executions older than this are purged by the hourly sweep.
    pub retention: Option<chrono::Duration>,
}

impl DispatchSettings {
    pub fn from_config(config: &CadenceConfig) -> Self {
        let daemon = &config.daemon;
        Self {
            tick: Duration::from_millis(daemon.tick_millis),
            max_concurrent: daemon.max_concurrent,
            kill_grace: Duration::from_secs(daemon.kill_grace_secs),
            store_retry: Duration::from_secs(daemon.store_retry_secs.max(1)),
            shutdown_grace: Duration::from_secs(daemon.shutdown_grace_secs),
            retention: config
                .store
                .retention_days
                .map(|days| chrono::Duration::days(i64::from(days))),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&CadenceConfig::default())
    }
}

/// Everything the dispatcher and the loop share, owned in one place and
/// passed around behind an `Arc`.
pub struct DaemonContext {
    pub registry: Arc<RegistryHandle>,
    pub store: Arc<dyn ExecutionStore>,
    pub runner: Arc<dyn ProcessRunner>,
    pub settings: DispatchSettings,
    /// Cancelled once when the daemon starts shutting down. Every in-flight
    /// execution is cancelled with it.
    pub shutdown: CancellationToken,
}

impl DaemonContext {
    pub fn new(
        registry: Arc<RegistryHandle>,
        store: Arc<dyn ExecutionStore>,
        runner: Arc<dyn ProcessRunner>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            registry,
            store,
            runner,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
