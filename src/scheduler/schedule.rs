use core::time::Duration;
use std::str::FromStr;

use chrono::{DateTime, TimeZone};
use cron::Schedule;
use thiserror::Error;

/// A parsed job schedule: a cron expression or an `@every` interval.
pub enum ScheduleKind {
    Cron(Box<Schedule>),
    Every(Duration),
}

/// Normalize a cron label value for the seconds-based parser.
///
/// Macros pass through untouched. A 5-field expression gets `0 ` prepended so
/// it fires at second 0 of every matched minute; 6-field expressions are used
/// as written.
pub fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();

    if !trimmed.starts_with('@') && trimmed.split_whitespace().count() == 5 {
        return format!("0 {trimmed}");
    }

    trimmed.to_owned()
}

impl ScheduleKind {
    /// Parse a `backup.cron` label value.
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let trimmed = expr.trim();

        if let Some(interval) = trimmed.strip_prefix("@every ") {
            let interval = humantime::parse_duration(interval.trim()).map_err(|error| {
                ScheduleError::Every {
                    expr: trimmed.to_owned(),
                    error,
                }
            })?;
            return Ok(Self::Every(interval));
        }

        let normalized = normalize_cron(trimmed);
        let schedule = Schedule::from_str(&normalized).map_err(|error| ScheduleError::Cron {
            expr: trimmed.to_owned(),
            error,
        })?;

        Ok(Self::Cron(Box::new(schedule)))
    }

    /// The next fire time strictly after `after`.
    pub fn next_after<Tz: TimeZone>(&self, after: DateTime<Tz>) -> Option<DateTime<Tz>> {
        match self {
            Self::Cron(schedule) => schedule.after(&after).next(),
            Self::Every(interval) => {
                let interval = chrono::Duration::from_std(*interval).ok()?;
                after.checked_add_signed(interval)
            }
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expr}':\n{error}")]
    Cron {
        expr: String,
        #[source]
        error: cron::error::Error,
    },

    #[error("Invalid @every interval '{expr}':\n{error}")]
    Every {
        expr: String,
        #[source]
        error: humantime::DurationError,
    },
}
