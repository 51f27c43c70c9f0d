use std::collections::BTreeMap;
use std::path::Path;

use cadence_schedule::TimeReference;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};
use crate::types::{ParamFormat, ReportFormat};

pub const DEFAULT_TICK_MILLIS: u64 = 1_000;
pub const DEFAULT_MAX_CONCURRENT: usize = 10;
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_KILL_GRACE_SECS: u64 = 5;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;
pub const DEFAULT_STORE_RETRY_SECS: u64 = 1;
/// Search path given to tasks when `[env]` does not set one.
pub const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Environment variables the daemon sets on every task; never read as config.
const RESERVED_ENV_KEYS: &[&str] = &["config", "task", "execution_id", "attempt"];

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Environment shared by every task.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub defaults: TaskDefaults,
    #[serde(default, rename = "task")]
    pub tasks: BTreeMap<String, TaskConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Scheduler loop period. Must be finer than the finest schedule.
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
    /// Time reference for cron fields and interval anchors.
    #[serde(default)]
    pub timezone: TimeReference,
    /// Global ceiling on concurrently running task processes.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Wait between SIGTERM and SIGKILL when a task is stopped.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    /// How long shutdown waits for cancelled tasks to be recorded.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Delay between attempts to persist an execution after a store failure.
    #[serde(default = "default_store_retry_secs")]
    pub store_retry_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_millis: DEFAULT_TICK_MILLIS,
            timezone: TimeReference::default(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            kill_grace_secs: DEFAULT_KILL_GRACE_SECS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            store_retry_secs: DEFAULT_STORE_RETRY_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Executions older than this are purged by the hourly sweep.
    pub retention_days: Option<u32>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            retention_days: None,
        }
    }
}

/// Values applied to every task that does not set its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefaults {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub report_format: ReportFormat,
    #[serde(default)]
    pub param_format: ParamFormat,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            report_format: ReportFormat::default(),
            param_format: ParamFormat::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// `[task.<name>]` as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Program and arguments. A string is split on whitespace.
    pub exec: ExecConfig,
    pub schedule: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    pub timeout_secs: Option<u64>,
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub param: Option<ParamConfig>,
    pub param_format: Option<ParamFormat>,
    pub report_format: Option<ReportFormat>,
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecConfig {
    Line(String),
    Argv(Vec<String>),
}

impl ExecConfig {
    pub fn argv(&self) -> Vec<String> {
        match self {
            ExecConfig::Line(line) => line.split_whitespace().map(String::from).collect(),
            ExecConfig::Argv(argv) => argv.clone(),
        }
    }
}

/// A raw string goes to stdin untouched; anything else is serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamConfig {
    Raw(String),
    Structured(serde_json::Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub retry_on_spawn_error: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffConfig::default(),
            retry_on_spawn_error: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffConfig {
    Fixed {
        #[serde(default = "default_backoff_secs")]
        delay_secs: f64,
    },
    Exponential {
        #[serde(default = "default_backoff_secs")]
        initial_secs: f64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(default = "default_backoff_max_secs")]
        max_secs: f64,
    },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::Fixed {
            delay_secs: default_backoff_secs(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_tick_millis() -> u64 {
    DEFAULT_TICK_MILLIS
}
fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}
fn default_kill_grace_secs() -> u64 {
    DEFAULT_KILL_GRACE_SECS
}
fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}
fn default_store_retry_secs() -> u64 {
    DEFAULT_STORE_RETRY_SECS
}
fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
fn default_max_attempts() -> u32 {
    1
}
fn default_backoff_secs() -> f64 {
    1.0
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_backoff_max_secs() -> f64 {
    300.0
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument (must exist)
    ///   2. `$CADENCE_CONFIG`
    ///   3. ~/.cadence/cadence.toml (optional; built-in defaults otherwise)
    ///
    /// Nested keys use a double underscore: `CADENCE_DAEMON__MAX_CONCURRENT=4`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let explicit = config_path
            .map(String::from)
            .or_else(|| std::env::var("CADENCE_CONFIG").ok());

        let path = match explicit {
            Some(path) => {
                if !Path::new(&path).is_file() {
                    return Err(CadenceError::Config(format!("config file not found: {path}")));
                }
                path
            }
            None => default_config_path(),
        };

        Self::extract(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("CADENCE_").split("__").ignore(RESERVED_ENV_KEYS)),
        )
    }

    /// Parse a config document without consulting the environment.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Self::extract(Figment::new().merge(Toml::string(source)))
    }

    fn extract(figment: Figment) -> Result<Self> {
        figment
            .extract()
            .map_err(|e| CadenceError::Config(e.to_string()))
    }

    /// `[env]` with the default `PATH` filled in.
    pub fn task_environment(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.entry("PATH".to_string())
            .or_insert_with(|| DEFAULT_PATH.to_string());
        env
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
