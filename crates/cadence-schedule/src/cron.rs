//! Cron expressions: Unix-style field normalisation on top of the `cron` crate.
//!
//! The `cron` crate matches fields (seconds through day-of-week) but follows
//! Quartz conventions. This module accepts classic crontab syntax and
//! rewrites it before compiling:
//!
//! | Input                         | Treatment                                        |
//! |-------------------------------|--------------------------------------------------|
//! | 5 fields                      | a leading `0` seconds field is prepended         |
//! | `@daily`, `@hourly`, …        | expanded to the equivalent five fields           |
//! | `H`, `H/n`, `H(a-b)`, …       | replaced by a value hashed from the task name    |
//! | day-of-week `0`–`7`           | rewritten as names (`0` and `7` are Sunday)      |
//! | `?`                           | same as `*`                                      |
//! | day-of-month *and* day-of-week| either may match (two compiled schedules)        |
//!
//! Matching runs on wall-clock time in the configured [`TimeReference`]; the
//! resulting wall-clock candidate is then mapped to an instant with the DST
//! policy described on [`CronSchedule::next_after`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use cron::TimeUnitSpec;
use sha2::{Digest, Sha256};

use crate::error::{Result, ScheduleError};

/// Candidates further than this many days past the reference are not searched.
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Inclusive bounds used when expanding `H` in each of the six fields.
/// Day-of-month hashes into 1–28 so the value exists in every month.
const HASH_BOUNDS: [(u32, u32); 6] = [(0, 59), (0, 59), (0, 23), (1, 28), (1, 12), (0, 6)];

const FIELD_DOM: usize = 3;
const FIELD_DOW: usize = 5;

/// A compiled, immutable cron schedule.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    /// Matches on day-of-month (or on both fields when only one is restricted).
    primary: cron::Schedule,
    /// Present when both day fields are restricted: matches on day-of-week.
    alternate: Option<cron::Schedule>,
}

impl CronSchedule {
    /// Compile `expression`; `seed` (normally the task name) drives `H` tokens.
    pub fn parse(expression: &str, seed: &str) -> Result<Self> {
        let invalid = |reason: String| ScheduleError::InvalidCron {
            expression: expression.to_string(),
            reason,
        };

        let expanded = expand_macro(expression.trim());
        let raw: Vec<&str> = expanded.split_whitespace().collect();
        let mut fields: Vec<String> = match raw.len() {
            5 => std::iter::once("0").chain(raw.iter().copied()).map(String::from).collect(),
            6 => raw.iter().map(|s| s.to_string()).collect(),
            n => return Err(invalid(format!("expected 5 or 6 fields, found {n}"))),
        };

        // Crontab rule: a day field counts as restricted unless it starts
        // with `*`. Decided on the fields as written, before normalisation.
        let restricted = |field: &str| !(field.starts_with('*') || field == "?");
        let dom_restricted = restricted(&fields[FIELD_DOM]);
        let dow_restricted = restricted(&fields[FIELD_DOW]);

        let hash = seed_hash(seed);
        for (index, field) in fields.iter_mut().enumerate() {
            if field == "?" {
                *field = "*".to_string();
            }
            if index == FIELD_DOW {
                *field = normalise_weekdays(field, hash).map_err(invalid)?;
            } else if field.contains('H') {
                *field = expand_hash_tokens(field, index, hash).map_err(invalid)?;
            }
        }

        let compile = |fields: &[String]| {
            cron::Schedule::from_str(&fields.join(" ")).map_err(|e| invalid(e.to_string()))
        };

        if dom_restricted && dow_restricted {
            let mut by_month_day = fields.clone();
            by_month_day[FIELD_DOW] = "*".to_string();
            let mut by_week_day = fields;
            by_week_day[FIELD_DOM] = "*".to_string();
            Ok(Self {
                expression: expression.to_string(),
                primary: compile(&by_month_day)?,
                alternate: Some(compile(&by_week_day)?),
            })
        } else {
            Ok(Self {
                expression: expression.to_string(),
                primary: compile(&fields)?,
                alternate: None,
            })
        }
    }

    /// The expression as written in configuration.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Earliest firing strictly after `after`, evaluated on `tz` wall-clock time.
    ///
    /// DST policy: a wall-clock time that occurs twice resolves to its earlier
    /// instant only (the repeated occurrence does not fire again); a
    /// wall-clock time inside a spring-forward gap does not exist and is
    /// skipped.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Utc>, tz: &Tz) -> Option<DateTime<Utc>> {
        let wall = after.with_timezone(tz).naive_local();
        let horizon = wall + Duration::days(SEARCH_HORIZON_DAYS);

        let first = first_resolvable(&self.primary, wall, horizon, after, tz);
        let second = self
            .alternate
            .as_ref()
            .and_then(|schedule| first_resolvable(schedule, wall, horizon, after, tz));

        match (first, second) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// True when the seconds field fires more often than once per minute.
    pub fn has_sub_minute_fields(&self) -> bool {
        self.primary.seconds().count() > 1
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression)
    }
}

/// Walk wall-clock candidates of `schedule` and map each to an instant.
fn first_resolvable<Tz: TimeZone>(
    schedule: &cron::Schedule,
    wall: NaiveDateTime,
    horizon: NaiveDateTime,
    after: &DateTime<Utc>,
    tz: &Tz,
) -> Option<DateTime<Utc>> {
    // The cron crate iterates on a DST-free UTC timeline; we feed it wall-clock
    // values and interpret its results as wall-clock values again.
    let start = Utc.from_utc_datetime(&wall);
    for candidate in schedule.after(&start) {
        let local = candidate.naive_utc();
        if local > horizon {
            return None;
        }
        let resolved = match tz.from_local_datetime(&local) {
            LocalResult::Single(dt) => dt.with_timezone(&Utc),
            LocalResult::Ambiguous(earlier, _) => earlier.with_timezone(&Utc),
            LocalResult::None => continue,
        };
        if resolved > *after {
            return Some(resolved);
        }
    }
    None
}

fn expand_macro(expression: &str) -> String {
    match expression.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => "0 0 1 1 *".to_string(),
        "@monthly" => "0 0 1 * *".to_string(),
        "@weekly" => "0 0 * * 0".to_string(),
        "@daily" | "@midnight" => "0 0 * * *".to_string(),
        "@hourly" => "0 * * * *".to_string(),
        _ => expression.to_string(),
    }
}

fn seed_hash(seed: &str) -> u64 {
    let digest = Sha256::digest(seed.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Per-field variation so `H H * * *` does not pick the same minute and hour.
fn field_hash(hash: u64, index: usize) -> u64 {
    hash.rotate_left((index as u32) * 11) ^ (index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

// ---------------------------------------------------------------------------
// H tokens
// ---------------------------------------------------------------------------

/// Expand every `H` item of a (non day-of-week) field into plain cron syntax.
fn expand_hash_tokens(field: &str, index: usize, hash: u64) -> std::result::Result<String, String> {
    let (lo, hi) = HASH_BOUNDS[index];
    let h = field_hash(hash, index);
    let items: std::result::Result<Vec<String>, String> = field
        .split(',')
        .map(|item| {
            if !item.starts_with('H') {
                return Ok(item.to_string());
            }
            let (lo, hi, step) = parse_hash_item(item, lo, hi)?;
            Ok(match step {
                None => (lo + (h % u64::from(hi - lo + 1)) as u32).to_string(),
                Some(step) => {
                    let start = lo + (h % u64::from(step)) as u32;
                    format!("{}-{hi}/{step}", start.min(hi))
                }
            })
        })
        .collect();
    Ok(items?.join(","))
}

/// Split `H`, `H/n`, `H(a-b)` or `H(a-b)/n` into `(lo, hi, step)`.
fn parse_hash_item(item: &str, lo: u32, hi: u32) -> std::result::Result<(u32, u32, Option<u32>), String> {
    let rest = &item[1..];
    let (range, step) = match rest.split_once('/') {
        Some((range, step)) => {
            let step: u32 = step.parse().map_err(|_| format!("bad step in `{item}`"))?;
            if step == 0 {
                return Err(format!("zero step in `{item}`"));
            }
            (range, Some(step))
        }
        None => (rest, None),
    };

    if range.is_empty() {
        return Ok((lo, hi, step));
    }

    let inner = range
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| format!("malformed hash token `{item}`"))?;
    let (a, b) = inner
        .split_once('-')
        .ok_or_else(|| format!("hash range needs `a-b` in `{item}`"))?;
    let a: u32 = a.parse().map_err(|_| format!("bad range start in `{item}`"))?;
    let b: u32 = b.parse().map_err(|_| format!("bad range end in `{item}`"))?;
    if a > b || a < lo || b > hi {
        return Err(format!("hash range out of bounds in `{item}` ({lo}-{hi})"));
    }
    Ok((a, b, step))
}

// ---------------------------------------------------------------------------
// Day of week
// ---------------------------------------------------------------------------

/// Rewrite a crontab day-of-week field (0–7, Sunday at both ends) as a list
/// of weekday names, or `*` when every day is selected.
fn normalise_weekdays(field: &str, hash: u64) -> std::result::Result<String, String> {
    if field == "*" {
        return Ok(field.to_string());
    }

    let mut days = [false; 7];
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| format!("bad step in `{item}`"))?;
                if step == 0 {
                    return Err(format!("zero step in `{item}`"));
                }
                (range, step)
            }
            None => (item, 1),
        };

        let (start, end) = if range == "*" {
            (0, 6)
        } else if range.starts_with('H') {
            let (lo, hi, hash_step) = parse_hash_item(item, 0, 6)?;
            let h = field_hash(hash, FIELD_DOW);
            match hash_step {
                None => {
                    let day = lo + (h % u64::from(hi - lo + 1)) as u32;
                    days[day as usize] = true;
                    continue;
                }
                Some(step) => {
                    let start = (lo + (h % u64::from(step)) as u32).min(hi);
                    let mut day = start;
                    while day <= hi {
                        days[day as usize] = true;
                        day += step;
                    }
                    continue;
                }
            }
        } else if let Some((a, b)) = range.split_once('-') {
            (weekday_value(a)?, weekday_value(b)?)
        } else {
            let start = weekday_value(range)?;
            // `a/n` runs from `a` to the end of the week.
            (start, if item.contains('/') { 6 } else { start })
        };

        if start > end {
            return Err(format!("descending weekday range `{range}`"));
        }
        let mut day = start;
        while day <= end {
            days[(day % 7) as usize] = true;
            day += step;
        }
    }

    if days.iter().all(|d| *d) {
        return Ok("*".to_string());
    }
    let names: Vec<&str> = days
        .iter()
        .enumerate()
        .filter(|(_, selected)| **selected)
        .map(|(i, _)| WEEKDAY_NAMES[i])
        .collect();
    if names.is_empty() {
        return Err("no weekdays selected".to_string());
    }
    Ok(names.join(","))
}

/// `0`–`7` or a three-letter name; 7 stays 7 so `5-7` remains ascending.
fn weekday_value(token: &str) -> std::result::Result<u32, String> {
    if let Ok(n) = token.parse::<u32>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("weekday `{n}` out of range 0-7"))
        };
    }
    let upper = token.to_ascii_uppercase();
    WEEKDAY_NAMES
        .iter()
        .position(|name| upper == *name)
        .map(|i| i as u32)
        .ok_or_else(|| format!("unknown weekday `{token}`"))
}
