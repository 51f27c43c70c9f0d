//! `cadence-schedule`: resolves schedule specifications into due instants.
//!
//! # Overview
//!
//! A [`Schedule`] is parsed once when the task registry is built and is
//! immutable afterwards. [`Schedule::next_due`] is pure: it returns the
//! earliest firing strictly after a reference instant, evaluated in one
//! [`TimeReference`].
//!
//! # Schedule forms
//!
//! | Form                        | Variant    | Behaviour                                   |
//! |-----------------------------|------------|---------------------------------------------|
//! | `*/5 * * * *`, `@daily`     | `Cron`     | Five or six crontab fields, `H` tokens      |
//! | `every 90s`, `every 2h`     | `Interval` | Fixed boundaries anchored at the epoch      |
//! | `at 2026-11-02T03:00:00Z`   | `Once`     | Single fire, then exhausted                 |

pub mod cron;
pub mod error;
pub mod schedule;
pub mod time;

pub use cron::CronSchedule;
pub use error::{Result, ScheduleError};
pub use schedule::{parse_interval, Schedule};
pub use time::TimeReference;
