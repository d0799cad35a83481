use crate::db::models::ScheduleSpec;
use crate::error::{Result, SchedulerError};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;
use tracing::debug;

/// A parsed schedule, ready to produce fire times.
#[derive(Debug, Clone)]
pub enum CompiledSchedule {
    Cron { schedule: Box<CronSchedule>, tz: Tz },
    Interval(Duration),
}

/// Parses a schedule spec. Five-field crontab expressions get a leading
/// seconds field; six and seven field expressions are taken as is.
pub fn compile(spec: &ScheduleSpec) -> Result<CompiledSchedule> {
    match spec {
        ScheduleSpec::Cron {
            expression,
            timezone,
        } => {
            let fields = expression.split_whitespace().count();
            let normalized = match fields {
                5 => format!("0 {}", expression.trim()),
                6 | 7 => expression.trim().to_string(),
                _ => {
                    return Err(SchedulerError::InvalidCronExpression(format!(
                        "expected 5 to 7 fields, got {}",
                        fields
                    ))
                    .into())
                }
            };

            let schedule = CronSchedule::from_str(&normalized).map_err(|e| {
                SchedulerError::InvalidCronExpression(format!("{}: {}", expression, e))
            })?;

            let tz: Tz = timezone
                .parse()
                .map_err(|_| SchedulerError::InvalidTimezone(timezone.clone()))?;

            Ok(CompiledSchedule::Cron {
                schedule: Box::new(schedule),
                tz,
            })
        }
        ScheduleSpec::Interval { seconds } => {
            if *seconds <= 0 {
                return Err(SchedulerError::InvalidInterval(format!(
                    "Interval must be positive, got: {}",
                    seconds
                ))
                .into());
            }
            Ok(CompiledSchedule::Interval(Duration::seconds(*seconds as i64)))
        }
    }
}

impl CompiledSchedule {
    /// First fire time strictly after `after`. For intervals, `after` is
    /// the anchor the interval counts from.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next = match self {
            CompiledSchedule::Cron { schedule, tz } => schedule
                .after(&after.with_timezone(tz))
                .next()
                .map(|local| local.with_timezone(&Utc)),
            CompiledSchedule::Interval(interval) => after.checked_add_signed(*interval),
        };
        debug!(after = %after, next = ?next, "Calculated next fire time");
        next
    }

    pub fn interval(&self) -> Option<Duration> {
        match self {
            CompiledSchedule::Interval(interval) => Some(*interval),
            CompiledSchedule::Cron { .. } => None,
        }
    }
}
