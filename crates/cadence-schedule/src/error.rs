use thiserror::Error;

/// Errors raised while compiling a schedule specification.
///
/// Resolution itself never fails: every error here surfaces when a task is
/// registered, not while the loop is ticking.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The cron expression could not be normalised or compiled.
    #[error("Invalid cron expression `{expression}`: {reason}")]
    InvalidCron { expression: String, reason: String },

    /// An `every …` specification had no usable duration.
    #[error("Invalid interval `{0}`")]
    InvalidInterval(String),

    /// An `at …` specification was not an RFC 3339 instant.
    #[error("Invalid instant `{value}`: {reason}")]
    InvalidInstant { value: String, reason: String },

    /// The configured time reference is neither `utc`, `local` nor an offset.
    #[error("Invalid time reference `{0}` (expected utc, local or ±HH:MM)")]
    InvalidTimeReference(String),

    /// The expression parses but has no occurrence within the search horizon.
    #[error("Schedule `{0}` never fires")]
    NeverFires(String),
}

pub type Result<T> = std::result::Result<T, ScheduleError>;
