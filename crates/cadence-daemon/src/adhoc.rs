//! `cadence run` and `cadence exec`: one execution, now, in the foreground.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cadence_core::registry::resolve_executable;
use cadence_core::{CadenceConfig, CadenceError, ExecutionStatus, RegistryHandle, Task, TaskRegistry};
use cadence_runner::OsProcessRunner;
use cadence_scheduler::{AdhocOptions, AdhocRun, DaemonContext, DispatchSettings, Dispatcher};
use cadence_store::{ExecutionStore, SqliteStore};
use tracing::{info, warn};

use crate::daemon::{load, open_store};
use crate::exit::{self, StartupError};

/// Where to copy the captured streams, besides the printed record.
#[derive(Debug, Default)]
pub struct Captures {
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

/// Run the configured task `name` once. Returns the exit status to use.
pub async fn run_task(
    config_path: Option<&str>,
    name: &str,
    stdin: Option<&Path>,
    record: bool,
    captures: Captures,
) -> anyhow::Result<u8> {
    let (config, registry) = load(config_path)?;
    let task = registry
        .get(name)
        .cloned()
        .ok_or_else(|| StartupError::Config(CadenceError::UnknownTask(name.to_string())))?;

    // Unrecorded runs never touch the real store.
    let store: Arc<dyn ExecutionStore> = if record {
        Arc::new(open_store(&config)?)
    } else {
        Arc::new(SqliteStore::open_in_memory()?)
    };

    let options = AdhocOptions {
        stdin: stdin.map(read_input).transpose()?,
        record,
    };
    let run = execute(&config, registry, store, task, options).await?;
    write_captures(&run, &captures)?;
    report(&run)
}

/// Run an arbitrary program once. Nothing is recorded.
pub async fn exec_program(
    config_path: Option<&str>,
    program: &str,
    args: Vec<String>,
    timeout_secs: Option<u64>,
    stdin: Option<&Path>,
) -> anyhow::Result<u8> {
    let config = CadenceConfig::load(config_path).map_err(StartupError::Config)?;
    let env = config.task_environment();
    let search_path = env.get("PATH").map(String::as_str).unwrap_or_default();
    // Left unresolved, the spawn fails and is reported like any other.
    let resolved = resolve_executable(program, search_path, None).unwrap_or_else(|| {
        warn!(program, "program not found on the configured PATH");
        PathBuf::from(program)
    });

    let timeout = Duration::from_secs(timeout_secs.unwrap_or(config.defaults.timeout_secs));
    let task = Arc::new(Task::adhoc("exec", resolved, args, env, timeout));
    let registry = TaskRegistry::from_tasks(Vec::new(), config.daemon.timezone);
    let options = AdhocOptions {
        stdin: stdin.map(read_input).transpose()?,
        record: false,
    };
    let store = Arc::new(SqliteStore::open_in_memory()?);
    let run = execute(&config, registry, store, task, options).await?;
    report(&run)
}

async fn execute(
    config: &CadenceConfig,
    registry: TaskRegistry,
    store: Arc<dyn ExecutionStore>,
    task: Arc<Task>,
    options: AdhocOptions,
) -> anyhow::Result<AdhocRun> {
    let ctx = Arc::new(DaemonContext::new(
        Arc::new(RegistryHandle::new(registry)),
        store,
        Arc::new(OsProcessRunner),
        DispatchSettings::from_config(config),
    ));

    // Ctrl-C stops the task the same way a daemon shutdown would.
    let interrupt = ctx.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted; stopping task");
            interrupt.cancel();
        }
    });

    let dispatcher = Dispatcher::new(Arc::clone(&ctx));
    info!(task = %task.name, program = %task.program.display(), "running ad-hoc");
    Ok(dispatcher.dispatch_adhoc(task, options).await?)
}

fn read_input(path: &Path) -> anyhow::Result<Vec<u8>> {
    if path == Path::new("-") {
        let mut buffer = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buffer)
            .context("reading stdin")?;
        Ok(buffer)
    } else {
        std::fs::read(path).with_context(|| format!("reading {}", path.display()))
    }
}

fn write_captures(run: &AdhocRun, captures: &Captures) -> anyhow::Result<()> {
    if let Some(path) = &captures.stdout {
        std::fs::write(path, &run.stdout).with_context(|| format!("writing {}", path.display()))?;
    }
    if let Some(path) = &captures.stderr {
        std::fs::write(path, &run.execution.stderr)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

/// Print the execution record and pick the exit status.
fn report(run: &AdhocRun) -> anyhow::Result<u8> {
    let execution = &run.execution;
    println!("{}", serde_json::to_string_pretty(execution)?);
    if execution.status != ExecutionStatus::Succeeded {
        warn!(
            execution_id = %execution.id,
            status = %execution.status,
            "ad-hoc execution did not succeed"
        );
    }
    Ok(exit::for_execution(execution))
}
