use std::time::Duration;

use cadence_core::{Execution, ExecutionStatus, RetryPolicy};

/// Delay before the next attempt after `finished`, or `None` when the failure
/// (or success) is final under `policy`.
///
/// Cancelled attempts are never retried. An attempt that could not be started
/// at all is only retried when the policy opts in.
pub fn next_attempt_delay(policy: &RetryPolicy, finished: &Execution) -> Option<Duration> {
    if !finished.status.is_failure() || finished.cancelled {
        return None;
    }
    if finished.attempt >= policy.max_attempts {
        return None;
    }
    if is_spawn_failure(finished) && !policy.retry_on_spawn_error {
        return None;
    }
    Some(policy.backoff.delay_after(finished.attempt))
}

/// Crashed without an exit status or a signal: the process never ran.
pub fn is_spawn_failure(execution: &Execution) -> bool {
    execution.status == ExecutionStatus::Crashed
        && execution.exit_code.is_none()
        && execution.signal.is_none()
}
