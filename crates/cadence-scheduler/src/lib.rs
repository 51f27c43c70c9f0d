//! cadence-scheduler: the scheduler loop and the dispatcher.
//!
//! - [`SchedulerEngine`]: ticks, evaluates due tasks, persists its baseline
//! - [`Dispatcher`]: ceiling, coalescing, retries, cancellation, persistence
//! - [`DaemonContext`]: the state both share for the daemon's lifetime

pub mod context;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod retry;

pub use context::{DaemonContext, DispatchSettings};
pub use dispatch::{AdhocOptions, AdhocRun, Dispatcher, ExecutionHandle};
pub use engine::{EngineState, SchedulerEngine, TickReport};
pub use error::{Result, SchedulerError};
pub use retry::next_attempt_delay;
