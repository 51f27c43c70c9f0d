//! `cadence daemon`: the long-running foreground scheduler.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use cadence_core::{CadenceConfig, RegistryHandle, TaskRegistry};
use cadence_runner::OsProcessRunner;
use cadence_scheduler::{DaemonContext, DispatchSettings, SchedulerEngine, SchedulerError};
use cadence_store::SqliteStore;
use tokio::task::JoinError;
use tracing::{error, info, warn};

use crate::exit::StartupError;
use crate::signal::{DaemonSignal, Signals};

/// Load and validate the configuration and the task registry built from it.
pub fn load(config_path: Option<&str>) -> Result<(CadenceConfig, TaskRegistry), StartupError> {
    let config = CadenceConfig::load(config_path)?;
    let registry = TaskRegistry::from_config(&config)?;
    Ok((config, registry))
}

pub fn open_store(config: &CadenceConfig) -> Result<SqliteStore, StartupError> {
    let path = Path::new(&config.store.path);
    info!(path = %path.display(), "opening result store");
    Ok(SqliteStore::open(path)?)
}

pub async fn run(config_path: Option<&str>) -> anyhow::Result<()> {
    let (config, registry) = load(config_path)?;
    info!(tasks = registry.len(), timezone = %registry.time_reference(), "task registry loaded");
    let store = open_store(&config)?;

    let ctx = Arc::new(DaemonContext::new(
        Arc::new(RegistryHandle::new(registry)),
        Arc::new(store),
        Arc::new(OsProcessRunner),
        DispatchSettings::from_config(&config),
    ));
    let engine = SchedulerEngine::new(Arc::clone(&ctx)).map_err(|e| match e {
        SchedulerError::Store(e) => anyhow::Error::from(StartupError::Store(e)),
        other => anyhow::Error::from(other),
    })?;
    let mut signals = Signals::install().context("installing signal handlers")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut engine_task = tokio::spawn(engine.run(shutdown_rx));
    info!("cadence daemon running");

    loop {
        tokio::select! {
            signal = signals.recv() => match signal {
                DaemonSignal::Reload => reload(&ctx, config_path),
                DaemonSignal::Shutdown => break,
            },
            ended = &mut engine_task => {
                // The engine only returns after a shutdown request.
                ctx.shutdown.cancel();
                return Err(engine_stopped(ended));
            }
        }
    }

    // signal the engine to stop; it cancels in-flight work and drains
    let _ = shutdown_tx.send(true);
    engine_task.await.context("scheduler engine task failed")?;
    info!("cadence daemon stopped");
    Ok(())
}

/// The error reported when the scheduler loop ends without being asked to.
fn engine_stopped(ended: Result<(), JoinError>) -> anyhow::Error {
    match ended {
        Ok(()) => anyhow!("scheduler engine stopped unexpectedly"),
        Err(e) if e.is_panic() => anyhow!("scheduler engine panicked: {e}"),
        Err(e) => anyhow!("scheduler engine task failed: {e}"),
    }
}

/// Revalidate the configuration and stage the new registry for the next
/// tick. An invalid configuration leaves the running registry in place.
fn reload(ctx: &DaemonContext, config_path: Option<&str>) {
    match load(config_path) {
        Ok((config, registry)) => {
            let settings = DispatchSettings::from_config(&config);
            if settings.tick != ctx.settings.tick
                || settings.max_concurrent != ctx.settings.max_concurrent
            {
                warn!("[daemon] settings only change on restart; reloading tasks only");
            }
            info!(tasks = registry.len(), "configuration reloaded; applying at next tick");
            ctx.registry.stage(registry);
        }
        Err(e) => error!("reload rejected, keeping current tasks: {e}"),
    }
}
