//! `cadence history` and `cadence check`.

use anyhow::{bail, Context};
use cadence_core::{Execution, ExecutionId, ExecutionStatus};
use cadence_store::{ExecutionFilter, ExecutionStore};
use chrono::{DateTime, Utc};

use crate::cli::HistoryAction;
use crate::daemon::{load, open_store};
use crate::exit::StartupError;

pub fn run(config_path: Option<&str>, action: HistoryAction) -> anyhow::Result<()> {
    let config = cadence_core::CadenceConfig::load(config_path).map_err(StartupError::Config)?;
    let store = open_store(&config)?;

    match action {
        HistoryAction::List {
            task,
            status,
            since,
            until,
            limit,
            json,
        } => {
            let filter = ExecutionFilter {
                task,
                status: status.as_deref().map(parse_status).transpose()?,
                since: since.as_deref().map(parse_instant).transpose()?,
                until: until.as_deref().map(parse_instant).transpose()?,
                limit,
            };
            for execution in store.list(filter)? {
                let execution = execution?;
                if json {
                    println!("{}", serde_json::to_string(&execution)?);
                } else {
                    println!("{}", summary_line(&execution));
                }
            }
        }
        HistoryAction::Show { id } => match store.get(&ExecutionId::from(id.as_str()))? {
            Some(execution) => println!("{}", serde_json::to_string_pretty(&execution)?),
            None => bail!("no execution with id {id}"),
        },
        HistoryAction::Purge { older_than_days } => {
            let cutoff = Utc::now() - chrono::Duration::days(i64::from(older_than_days));
            let removed = store.purge_before(cutoff)?;
            println!("purged {removed} executions started before {}", cutoff.to_rfc3339());
        }
        HistoryAction::Skips { task, limit } => {
            for skip in store.list_skips(task.as_deref(), limit)? {
                let blocking = skip
                    .blocking_execution
                    .as_ref()
                    .map(ExecutionId::as_str)
                    .unwrap_or("-");
                println!(
                    "{}\t{}\tdue {}\tblocked by {}",
                    skip.skipped_at.to_rfc3339(),
                    skip.task,
                    skip.due_at.to_rfc3339(),
                    blocking
                );
            }
        }
    }
    Ok(())
}

/// Validate the configuration and print when each task is next due.
pub fn check(config_path: Option<&str>) -> anyhow::Result<()> {
    let (_, registry) = load(config_path)?;
    let tz = registry.time_reference();
    let now = Utc::now();
    println!("{} tasks, time reference {tz}", registry.len());
    for task in registry.iter() {
        let next = if !task.enabled {
            "disabled".to_string()
        } else {
            match task.schedule.next_due(now, &tz) {
                Some(due) => tz.format(&due),
                None => "exhausted".to_string(),
            }
        };
        println!("{}\t{}\t{}\t{}", task.name, task.schedule, task.program.display(), next);
    }
    Ok(())
}

fn parse_status(text: &str) -> anyhow::Result<ExecutionStatus> {
    text.parse::<ExecutionStatus>().map_err(anyhow::Error::msg)
}

fn parse_instant(text: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|instant| instant.with_timezone(&Utc))
        .with_context(|| format!("not an RFC 3339 instant: {text}"))
}

fn summary_line(execution: &Execution) -> String {
    let duration = execution
        .duration()
        .map(|d| format!("{:.3}s", d.num_milliseconds() as f64 / 1000.0))
        .unwrap_or_else(|| "-".to_string());
    let outcome = match (execution.exit_code, execution.signal) {
        (Some(code), _) => format!("exit {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "-".to_string(),
    };
    format!(
        "{}\t{}\tattempt {}\t{}\t{}\t{}",
        execution.started_at.to_rfc3339(),
        execution.id,
        execution.attempt,
        execution.status,
        outcome,
        duration
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn filters_parse_from_flags() {
        assert_eq!(parse_status("timed_out").unwrap(), ExecutionStatus::TimedOut);
        assert!(parse_status("exploded").is_err());
        assert_eq!(
            parse_instant("2026-03-01T13:00:00+01:00").unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
        );
        assert!(parse_instant("yesterday").is_err());
    }

    #[test]
    fn summary_shows_outcome_and_duration() {
        let mut execution = Execution::begin("backup", 2, None);
        execution.status = ExecutionStatus::Failed;
        execution.exit_code = Some(3);
        execution.finished_at = Some(execution.started_at + chrono::Duration::milliseconds(1500));
        let line = summary_line(&execution);
        assert!(line.contains("attempt 2"));
        assert!(line.contains("failed"));
        assert!(line.contains("exit 3"));
        assert!(line.contains("1.500s"));
    }
}
