use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tracing::debug;

use crate::cron::CronSchedule;
use crate::error::{Result, ScheduleError};
use crate::time::TimeReference;

/// Defines when a task fires. Built once at registration, never mutated.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Classic crontab expression (five or six fields, macros, `H` tokens).
    Cron(CronSchedule),

    /// Repeat on fixed boundaries `every` apart, anchored at the Unix epoch
    /// of the configured time reference.
    Interval { every: Duration },

    /// Fire exactly once at the given instant.
    Once { at: DateTime<Utc> },
}

impl Schedule {
    /// Parse a schedule specification.
    ///
    /// | Form                          | Variant    |
    /// |-------------------------------|------------|
    /// | `every 5m`, `every 2 hours`   | `Interval` |
    /// | `at 2026-11-02T03:00:00Z`     | `Once`     |
    /// | anything else                 | `Cron`     |
    ///
    /// `seed` is the task name; it only matters for cron `H` tokens.
    pub fn parse(spec: &str, seed: &str) -> Result<Self> {
        let trimmed = spec.trim();
        let lower = trimmed.to_ascii_lowercase();

        if let Some(rest) = lower.strip_prefix("every ") {
            return Ok(Schedule::Interval {
                every: parse_interval(rest)?,
            });
        }

        if lower.starts_with("at ") {
            let value = trimmed[3..].trim();
            let at = DateTime::parse_from_rfc3339(value).map_err(|e| ScheduleError::InvalidInstant {
                value: value.to_string(),
                reason: e.to_string(),
            })?;
            return Ok(Schedule::Once {
                at: at.with_timezone(&Utc),
            });
        }

        Ok(Schedule::Cron(CronSchedule::parse(trimmed, seed)?))
    }

    /// Earliest due instant strictly after `after`, or `None` once exhausted.
    pub fn next_due(&self, after: DateTime<Utc>, tz: &TimeReference) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once { at } => {
                if *at > after {
                    Some(*at)
                } else {
                    None
                }
            }

            Schedule::Interval { every } => {
                let every_ms = i64::try_from(every.as_millis()).ok()?;
                let anchor = DateTime::<Utc>::UNIX_EPOCH
                    .checked_sub_signed(chrono::Duration::try_seconds(tz.offset_secs_at(&after))?)?;
                let elapsed = (after - anchor).num_milliseconds();
                let periods = elapsed.div_euclid(every_ms).checked_add(1)?;
                let offset = chrono::Duration::try_milliseconds(periods.checked_mul(every_ms)?)?;
                anchor.checked_add_signed(offset)
            }

            Schedule::Cron(cron) => match tz {
                TimeReference::Utc => cron.next_after(&after, &Utc),
                TimeReference::Local => cron.next_after(&after, &Local),
                TimeReference::Fixed(offset) => cron.next_after(&after, offset),
            },
        }
    }

    /// Reject schedules that can never fire from `now` on.
    ///
    /// Every variant is resolved once. A one-shot instant in the past is not
    /// an error: it is simply exhausted.
    pub fn validate(&self, now: DateTime<Utc>, tz: &TimeReference) -> Result<()> {
        if matches!(self, Schedule::Once { at } if *at <= now) {
            return Ok(());
        }
        match self.next_due(now, tz) {
            Some(_) => Ok(()),
            None => Err(ScheduleError::NeverFires(self.to_string())),
        }
    }

    /// Finest spacing between two firings, used to sanity-check the tick.
    pub fn granularity(&self) -> Option<Duration> {
        match self {
            Schedule::Once { .. } => None,
            Schedule::Interval { every } => Some(*every),
            Schedule::Cron(cron) if cron.has_sub_minute_fields() => Some(Duration::from_secs(1)),
            Schedule::Cron(_) => Some(Duration::from_secs(60)),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Cron(cron) => write!(f, "{cron}"),
            Schedule::Interval { every } => write!(f, "every {}s", every.as_secs_f64()),
            Schedule::Once { at } => write!(f, "at {}", at.to_rfc3339()),
        }
    }
}

/// Parse the body of an `every …` specification.
///
/// Accepts one or more `<number><unit>` pairs, with or without a space:
/// `30s`, `5 minutes`, `1h 30m`, `2 days`. A bare number means seconds.
pub fn parse_interval(text: &str) -> Result<Duration> {
    let invalid = || ScheduleError::InvalidInterval(text.to_string());

    let mut total = Duration::ZERO;
    let mut chars = text.trim().chars().peekable();
    let mut parsed_any = false;

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut number = String::new();
        while let Some(c) = chars.next_if(|c| c.is_ascii_digit()) {
            number.push(c);
        }
        if number.is_empty() {
            return Err(invalid());
        }
        let value: u64 = number.parse().map_err(|_| invalid())?;

        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let mut unit = String::new();
        while let Some(c) = chars.next_if(|c| c.is_ascii_alphabetic()) {
            unit.push(c.to_ascii_lowercase());
        }

        let seconds_per_unit = match unit.as_str() {
            "" | "s" | "sec" | "secs" | "second" | "seconds" => 1,
            "m" | "min" | "mins" | "minute" | "minutes" => 60,
            "h" | "hr" | "hrs" | "hour" | "hours" => 3_600,
            "d" | "day" | "days" => 86_400,
            "w" | "week" | "weeks" => 604_800,
            _ => return Err(invalid()),
        };
        let secs = value.checked_mul(seconds_per_unit).ok_or_else(invalid)?;
        total = total.checked_add(Duration::from_secs(secs)).ok_or_else(invalid)?;
        parsed_any = true;

        while chars.next_if(|c| *c == ',').is_some() {}
    }

    if !parsed_any || total.is_zero() {
        return Err(invalid());
    }
    debug!(interval = text, secs = total.as_secs(), "parsed interval");
    Ok(total)
}
