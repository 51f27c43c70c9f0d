//! Validated, ordered set of tasks the scheduler works from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use cadence_schedule::{Schedule, TimeReference};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::{BackoffConfig, CadenceConfig, ParamConfig, RetryConfig, TaskConfig};
use crate::error::{CadenceError, Result};
use crate::types::{Backoff, ParamPayload, RetryPolicy, Task};

/// Upper bound on every configured duration: about a hundred years.
pub const MAX_DURATION_SECS: u64 = 100 * 366 * 86_400;

/// Immutable task set, iterated in lexical order of task name.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: Vec<Arc<Task>>,
    time_reference: TimeReference,
}

impl TaskRegistry {
    /// Validate every `[task.*]` entry. The first invalid task fails the load.
    pub fn from_config(config: &CadenceConfig) -> Result<Self> {
        let base_env = config.task_environment();
        let search_path = base_env.get("PATH").cloned().unwrap_or_default();
        let tz = config.daemon.timezone;
        let tick = Duration::from_millis(config.daemon.tick_millis);

        if config.daemon.tick_millis == 0 {
            return Err(CadenceError::Config("daemon.tick_millis must be positive".into()));
        }
        if config.daemon.max_concurrent == 0 {
            return Err(CadenceError::Config("daemon.max_concurrent must be positive".into()));
        }

        let mut tasks = Vec::with_capacity(config.tasks.len());
        for (name, raw) in &config.tasks {
            let task = build_task(name, raw, config, &base_env, &search_path)?;
            if let Some(granularity) = task.schedule.granularity() {
                if granularity <= tick {
                    warn!(
                        task = %name,
                        schedule = %task.schedule,
                        tick_ms = config.daemon.tick_millis,
                        "schedule is not coarser than the tick; firings will be coalesced"
                    );
                }
            }
            task.schedule
                .validate(Utc::now(), &tz)
                .map_err(|source| CadenceError::Schedule {
                    task: name.clone(),
                    source,
                })?;
            debug!(task = %name, program = %task.program.display(), schedule = %task.schedule, "task registered");
            tasks.push(Arc::new(task));
        }

        // BTreeMap iteration is already lexical; keep the invariant explicit.
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        info!(count = tasks.len(), timezone = %tz, "task registry loaded");

        Ok(Self {
            tasks,
            time_reference: tz,
        })
    }

    /// Build a registry from already-constructed tasks (tests, embedding).
    pub fn from_tasks(mut tasks: Vec<Task>, time_reference: TimeReference) -> Self {
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            tasks: tasks.into_iter().map(Arc::new).collect(),
            time_reference,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.tasks.iter()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.tasks.iter().filter(|t| t.enabled)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Task>> {
        self.tasks
            .binary_search_by(|t| t.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.tasks[i])
    }

    pub fn time_reference(&self) -> TimeReference {
        self.time_reference
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

fn build_task(
    name: &str,
    raw: &TaskConfig,
    config: &CadenceConfig,
    base_env: &BTreeMap<String, String>,
    search_path: &str,
) -> Result<Task> {
    let invalid = |reason: &str| CadenceError::InvalidTask {
        task: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() || name.contains('/') || name.chars().any(char::is_whitespace) {
        return Err(invalid("task names must be non-empty and contain no `/` or whitespace"));
    }

    let mut argv = raw.exec.argv().into_iter();
    let program = argv.next().ok_or_else(|| invalid("`exec` is empty"))?;
    let args: Vec<String> = argv.collect();

    let cwd = raw.cwd.as_ref().map(PathBuf::from);
    if let Some(dir) = &cwd {
        if !dir.is_dir() {
            return Err(invalid(&format!("cwd `{}` is not a directory", dir.display())));
        }
    }
    let program = resolve_executable(&program, search_path, cwd.as_deref()).ok_or_else(|| {
        CadenceError::ExecutableNotFound {
            task: name.to_string(),
            program: program.clone(),
        }
    })?;

    let schedule = Schedule::parse(&raw.schedule, name).map_err(|source| CadenceError::Schedule {
        task: name.to_string(),
        source,
    })?;

    let timeout_secs = raw.timeout_secs.unwrap_or(config.defaults.timeout_secs);
    if timeout_secs == 0 || timeout_secs > MAX_DURATION_SECS {
        return Err(invalid(&format!("timeout_secs must be between 1 and {MAX_DURATION_SECS}")));
    }

    let retry = retry_policy(raw.retry.as_ref().unwrap_or(&config.defaults.retry)).map_err(|r| invalid(&r))?;

    let param_format = raw.param_format.unwrap_or(config.defaults.param_format);
    let params = raw.param.as_ref().map(|param| match param {
        ParamConfig::Raw(text) => ParamPayload::Raw(text.clone()),
        ParamConfig::Structured(value) => ParamPayload::Structured {
            value: value.clone(),
            format: param_format,
        },
    });

    let mut env = base_env.clone();
    env.extend(raw.env.iter().map(|(k, v)| (k.clone(), v.clone())));

    Ok(Task {
        name: name.to_string(),
        program,
        args,
        env,
        cwd,
        schedule,
        timeout: Duration::from_secs(timeout_secs),
        retry,
        enabled: raw.enabled,
        params,
        report_format: raw.report_format.unwrap_or(config.defaults.report_format),
    })
}

fn retry_policy(raw: &RetryConfig) -> std::result::Result<RetryPolicy, String> {
    if raw.max_attempts == 0 {
        return Err("retry.max_attempts must be at least 1".into());
    }
    let seconds = |value: f64, key: &str| match Duration::try_from_secs_f64(value) {
        Ok(duration) if duration.as_secs() <= MAX_DURATION_SECS => Ok(duration),
        _ => Err(format!(
            "retry.backoff.{key} must be a number of seconds between 0 and {MAX_DURATION_SECS}"
        )),
    };
    let backoff = match raw.backoff {
        BackoffConfig::Fixed { delay_secs } => Backoff::Fixed(seconds(delay_secs, "delay_secs")?),
        BackoffConfig::Exponential {
            initial_secs,
            multiplier,
            max_secs,
        } => {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err("retry.backoff.multiplier must be at least 1".into());
            }
            Backoff::Exponential {
                initial: seconds(initial_secs, "initial_secs")?,
                multiplier,
                max: seconds(max_secs, "max_secs")?,
            }
        }
    };
    Ok(RetryPolicy {
        max_attempts: raw.max_attempts,
        backoff,
        retry_on_spawn_error: raw.retry_on_spawn_error,
    })
}

/// Resolve `program` the way a task will see it: paths containing `/` are
/// taken as-is (relative to `cwd`), bare names are looked up on `search_path`.
pub fn resolve_executable(program: &str, search_path: &str, cwd: Option<&Path>) -> Option<PathBuf> {
    if program.contains('/') {
        let path = match cwd {
            Some(dir) if Path::new(program).is_relative() => dir.join(program),
            _ => PathBuf::from(program),
        };
        return path.is_file().then_some(path);
    }
    let cwd = cwd
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("/"));
    which::which_in(program, Some(search_path), cwd).ok()
}

/// Shared pointer to the current registry.
///
/// Readers take cheap snapshots; a reload is staged and only becomes visible
/// when the scheduler applies it at a tick boundary, so the registry never
/// changes in the middle of a tick.
#[derive(Debug, Default)]
pub struct RegistryHandle {
    current: RwLock<Arc<TaskRegistry>>,
    staged: Mutex<Option<TaskRegistry>>,
}

impl RegistryHandle {
    pub fn new(registry: TaskRegistry) -> Self {
        Self {
            current: RwLock::new(Arc::new(registry)),
            staged: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> Arc<TaskRegistry> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// Queue `registry` to replace the current one at the next tick boundary.
    pub fn stage(&self, registry: TaskRegistry) {
        let mut staged = self.staged.lock().unwrap_or_else(|e| e.into_inner());
        *staged = Some(registry);
    }

    /// Swap in a staged registry, if any. Returns true when a swap happened.
    pub fn apply_staged(&self) -> bool {
        let next = self.staged.lock().unwrap_or_else(|e| e.into_inner()).take();
        match next {
            Some(registry) => {
                let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
                info!(count = registry.len(), "task registry replaced");
                *current = Arc::new(registry);
                true
            }
            None => false,
        }
    }
}
