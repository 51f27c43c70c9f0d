//! The task calling contract.
//!
//! Parameters go in on stdin, a report comes out on stdout, and the exit
//! status decides success. stdout that does not parse is still kept, as an
//! unstructured report, and never turns a success into a failure.

use std::time::Duration;

use cadence_core::{Execution, ExecutionStatus, ParamFormat, ParamPayload, Report, ReportFormat};
use serde_json::Value;

use crate::error::{Result, RunnerError};
use crate::truncate::{truncate_middle, MAX_STDERR_CHARS};
use crate::types::{ProcessExit, ProcessOutcome, MAX_STDOUT_BYTES};

/// Serialize a parameter payload into the bytes written to stdin.
pub fn encode_params(payload: &ParamPayload) -> Result<Vec<u8>> {
    match payload {
        ParamPayload::Raw(text) => Ok(text.clone().into_bytes()),
        ParamPayload::Structured { value, format } => {
            let encoded = match format {
                ParamFormat::Json => serde_json::to_string(value).map_err(|e| encode_error("json", e)),
                ParamFormat::Toml => toml::to_string(value).map_err(|e| encode_error("toml", e)),
                ParamFormat::Yaml => serde_yaml::to_string(value).map_err(|e| encode_error("yaml", e)),
            }?;
            let mut bytes = encoded.into_bytes();
            if bytes.last() != Some(&b'\n') {
                bytes.push(b'\n');
            }
            Ok(bytes)
        }
    }
}

fn encode_error(format: &'static str, e: impl std::fmt::Display) -> RunnerError {
    RunnerError::Encode {
        format,
        reason: e.to_string(),
    }
}

/// Interpret stdout as a report.
///
/// Returns the report (absent for empty output) and, when stdout was not
/// accepted as structured, the reason.
pub fn parse_report(stdout: &[u8], format: ReportFormat) -> (Option<Report>, Option<String>) {
    let text = match std::str::from_utf8(stdout) {
        Ok(text) => text,
        Err(_) => {
            let lossy = String::from_utf8_lossy(stdout).into_owned();
            return (
                Some(Report::Unstructured(lossy)),
                Some("stdout is not valid UTF-8".to_string()),
            );
        }
    };

    if text.trim().is_empty() {
        return (None, None);
    }

    let parsed = match format {
        ReportFormat::None => return (Some(Report::Unstructured(text.to_string())), None),
        ReportFormat::Json => parse_json(text),
        ReportFormat::Toml => parse_toml(text),
        ReportFormat::Yaml => parse_yaml(text),
        ReportFormat::Auto => parse_json(text)
            .or_else(|_| parse_toml(text))
            .or_else(|_| parse_yaml(text))
            .map_err(|_| "stdout is not a JSON, TOML or YAML document".to_string()),
    };

    match parsed {
        Ok(value) => (Some(Report::Structured(value)), None),
        Err(reason) => (Some(Report::Unstructured(text.to_string())), Some(reason)),
    }
}

fn parse_json(text: &str) -> std::result::Result<Value, String> {
    serde_json::from_str::<Value>(text)
        .map_err(|e| format!("invalid JSON report: {e}"))
        .and_then(require_container)
}

fn parse_toml(text: &str) -> std::result::Result<Value, String> {
    let table: toml::Table = toml::from_str(text).map_err(|e| format!("invalid TOML report: {e}"))?;
    serde_json::to_value(table).map_err(|e| format!("invalid TOML report: {e}"))
}

fn parse_yaml(text: &str) -> std::result::Result<Value, String> {
    serde_yaml::from_str::<Value>(text)
        .map_err(|e| format!("invalid YAML report: {e}"))
        .and_then(require_container)
}

/// A bare scalar is almost always plain text that happens to parse.
fn require_container(value: Value) -> std::result::Result<Value, String> {
    match value {
        Value::Object(_) | Value::Array(_) => Ok(value),
        _ => Err("report must be a mapping or a sequence".to_string()),
    }
}

/// Status an attempt ends in, given how its process ended.
pub fn classify(exit: &ProcessExit) -> ExecutionStatus {
    match exit {
        ProcessExit::Exited(0) => ExecutionStatus::Succeeded,
        ProcessExit::Exited(_) => ExecutionStatus::Failed,
        ProcessExit::TimedOut { .. } | ProcessExit::Cancelled { .. } => ExecutionStatus::TimedOut,
        ProcessExit::Signaled(_) | ProcessExit::SpawnFailed(_) => ExecutionStatus::Crashed,
    }
}

/// Move `execution` to its terminal state from a finished process.
pub fn complete(
    execution: &mut Execution,
    outcome: ProcessOutcome,
    report_format: ReportFormat,
    timeout: Duration,
) {
    execution.status = classify(&outcome.exit);
    execution.started_at = outcome.started_at;
    execution.finished_at = Some(outcome.finished_at);

    let mut stderr = String::from_utf8_lossy(&outcome.stderr).into_owned();
    let note = match &outcome.exit {
        ProcessExit::Exited(code) => {
            execution.exit_code = Some(*code);
            None
        }
        ProcessExit::Signaled(signal) => {
            execution.signal = Some(*signal);
            Some(format!("died from uncaught signal {signal}"))
        }
        ProcessExit::TimedOut { forced } => {
            execution.signal = Some(stop_signal(*forced));
            Some(format!(
                "forcibly terminated ({}) after exceeding timeout of {}s",
                signal_name(*forced),
                timeout.as_secs_f64()
            ))
        }
        ProcessExit::Cancelled { forced } => {
            execution.signal = Some(stop_signal(*forced));
            execution.cancelled = true;
            Some(format!("forcibly terminated ({}) on cancellation", signal_name(*forced)))
        }
        ProcessExit::SpawnFailed(reason) => Some(reason.clone()),
    };
    if let Some(note) = note {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str("cadence: ");
        stderr.push_str(&note);
        stderr.push('\n');
    }
    execution.stderr = truncate_middle(&stderr, MAX_STDERR_CHARS);

    if matches!(outcome.exit, ProcessExit::SpawnFailed(_)) {
        return;
    }
    if outcome.stdout_omitted > 0 {
        // A cut-off document never parses; keep what arrived as text.
        execution.report = Some(Report::Unstructured(String::from_utf8_lossy(&outcome.stdout).into_owned()));
        execution.contract_violation = Some(format!(
            "stdout exceeded {MAX_STDOUT_BYTES} bytes; {} further bytes were discarded",
            outcome.stdout_omitted
        ));
        return;
    }
    let (report, violation) = parse_report(&outcome.stdout, report_format);
    execution.report = report;
    execution.contract_violation = violation;
}

fn signal_name(forced: bool) -> &'static str {
    if forced {
        "SIGKILL"
    } else {
        "SIGTERM"
    }
}

#[cfg(unix)]
fn stop_signal(forced: bool) -> i32 {
    if forced {
        libc::SIGKILL
    } else {
        libc::SIGTERM
    }
}

#[cfg(not(unix))]
fn stop_signal(forced: bool) -> i32 {
    if forced {
        9
    } else {
        15
    }
}
