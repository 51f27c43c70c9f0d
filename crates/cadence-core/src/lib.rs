pub mod config;
pub mod error;
pub mod registry;
pub mod types;

pub use config::CadenceConfig;
pub use error::{CadenceError, Result};
pub use registry::{RegistryHandle, TaskRegistry};
pub use types::{
    Backoff, Execution, ExecutionId, ExecutionStatus, ParamFormat, ParamPayload, Report,
    ReportFormat, RetryPolicy, SkippedFiring, Task,
};
