//! The single time reference every schedule is resolved in.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Local, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

/// Wall clock used to interpret cron fields and interval anchors.
///
/// `Utc` and `Fixed` have no daylight-saving transitions. `Local` follows the
/// host zone; ambiguous wall-clock times resolve to the earlier instant and
/// wall-clock times skipped by a transition never fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TimeReference {
    #[default]
    Utc,
    Local,
    Fixed(FixedOffset),
}

impl TimeReference {
    /// Seconds east of UTC in effect at `instant`; used to anchor intervals.
    ///
    /// For `Local` this is the offset of the current DST period, so interval
    /// boundaries stay on the same wall-clock times across transitions.
    pub(crate) fn offset_secs_at(&self, instant: &DateTime<Utc>) -> i64 {
        match self {
            TimeReference::Utc => 0,
            TimeReference::Local => {
                i64::from(Local.offset_from_utc_datetime(&instant.naive_utc()).fix().local_minus_utc())
            }
            TimeReference::Fixed(offset) => i64::from(offset.local_minus_utc()),
        }
    }

    /// Render `instant` as wall-clock text in this reference.
    pub fn format(&self, instant: &DateTime<Utc>) -> String {
        match self {
            TimeReference::Utc => instant.to_rfc3339(),
            TimeReference::Local => instant.with_timezone(&Local).to_rfc3339(),
            TimeReference::Fixed(offset) => instant.with_timezone(offset).to_rfc3339(),
        }
    }
}

impl fmt::Display for TimeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeReference::Utc => write!(f, "utc"),
            TimeReference::Local => write!(f, "local"),
            TimeReference::Fixed(offset) => write!(f, "{offset}"),
        }
    }
}

impl FromStr for TimeReference {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "utc" | "z" | "+00:00" => return Ok(TimeReference::Utc),
            "local" => return Ok(TimeReference::Local),
            _ => {}
        }

        parse_offset(trimmed)
            .map(TimeReference::Fixed)
            .ok_or_else(|| ScheduleError::InvalidTimeReference(s.to_string()))
    }
}

impl TryFrom<String> for TimeReference {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeReference> for String {
    fn from(value: TimeReference) -> Self {
        value.to_string()
    }
}

/// Parse `+HH:MM`, `-HH:MM`, `+HHMM` or `+HH`.
fn parse_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
