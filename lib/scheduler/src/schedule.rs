//! Cron expressions and missed-firing computation.

use crate::error::ScheduleError;
use chrono::{DateTime, Utc};
use croner::Cron;
use std::fmt;

/// Most missed firings a single sync will catch up on.
pub const MAX_MISSED_SCHEDULES: usize = 100;

/// A parsed standard 5-field cron schedule, evaluated in UTC.
pub struct CronSchedule {
    expression: String,
    cron: Cron,
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronSchedule")
            .field("expression", &self.expression)
            .finish()
    }
}

impl CronSchedule {
    /// Parses a cron expression.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCronExpression` unless the expression has exactly five
    /// valid fields.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let fields = expression.split_whitespace().count();
        if fields != 5 {
            return Err(ScheduleError::InvalidCronExpression {
                expression: expression.to_string(),
                reason: format!("expected 5 fields, got {fields}"),
            });
        }

        let cron = Cron::new(expression)
            .parse()
            .map_err(|e| ScheduleError::InvalidCronExpression {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            expression: expression.to_string(),
            cron,
        })
    }

    /// Returns the source expression.
    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Returns the first firing strictly after `after`.
    ///
    /// # Errors
    ///
    /// Returns `EvaluationFailed` if the schedule never fires again.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        self.cron
            .find_next_occurrence(&after, false)
            .map_err(|e| ScheduleError::EvaluationFailed {
                expression: self.expression.clone(),
                reason: e.to_string(),
            })
    }
}

/// Returns the most recent firing in `(last, now]`, or `None` if nothing is
/// due.
///
/// # Errors
///
/// Returns `TooManyMissed` if more than `cap` firings fall in the window.
pub fn most_recent_due(
    schedule: &CronSchedule,
    last: DateTime<Utc>,
    now: DateTime<Utc>,
    cap: usize,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let mut recent = schedule.next_after(last)?;
    if recent > now {
        return Ok(None);
    }

    let mut missed = 1;
    loop {
        let next = schedule.next_after(recent)?;
        if next > now {
            break;
        }
        missed += 1;
        if missed > cap {
            return Err(ScheduleError::TooManyMissed { cap });
        }
        recent = next;
    }
    Ok(Some(recent))
}
