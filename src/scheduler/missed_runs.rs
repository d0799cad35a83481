use super::schedule_calc::CompiledSchedule;
use chrono::{DateTime, Utc};
use tracing::warn;

/// Upper bound when walking cron occurrences between two instants.
const MAX_COUNTED_OCCURRENCES: usize = 10_000;

/// Number of occurrences after `last_fired` that are already in the past.
pub fn count_missed_runs(
    schedule: &CompiledSchedule,
    last_fired: DateTime<Utc>,
    now: DateTime<Utc>,
) -> usize {
    if let Some(interval) = schedule.interval() {
        let elapsed = now.signed_duration_since(last_fired);
        if elapsed < interval {
            return 0;
        }
        return (elapsed.num_seconds() / interval.num_seconds().max(1)) as usize;
    }

    let mut missed = 0;
    let mut cursor = last_fired;
    while missed < MAX_COUNTED_OCCURRENCES {
        match schedule.next_after(cursor) {
            Some(next) if next <= now => {
                missed += 1;
                cursor = next;
            }
            _ => break,
        }
    }
    missed
}

/// Next fire time once the scheduler (re)starts or finishes a firing.
///
/// Missed occurrences are skipped: the result is never at or before `now`
/// and never at or before `last_fired`.
pub fn resume_point(
    job_id: i32,
    schedule: &CompiledSchedule,
    last_fired: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let Some(last_fired) = last_fired else {
        return schedule.next_after(now);
    };

    let missed = count_missed_runs(schedule, last_fired, now);
    if missed > 0 {
        warn!(
            job_id = job_id,
            missed_runs = missed,
            last_fired = %last_fired,
            "Skipping missed runs"
        );
    }

    match schedule.interval() {
        // keep the interval grid anchored on the last firing
        Some(interval) => {
            let steps = missed as i32 + 1;
            last_fired.checked_add_signed(interval * steps)
        }
        None => schedule.next_after(now.max(last_fired)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ScheduleSpec;
    use crate::scheduler::schedule_calc::compile;
    use chrono::{Duration, TimeZone};

    fn daily_at_two() -> CompiledSchedule {
        compile(&ScheduleSpec::Cron {
            expression: "0 2 * * *".to_string(),
            timezone: "UTC".to_string(),
        })
        .expect("valid schedule")
    }

    fn hourly_interval() -> CompiledSchedule {
        compile(&ScheduleSpec::Interval { seconds: 3600 }).expect("valid schedule")
    }

    #[test]
    fn test_restart_after_fire_does_not_refire() {
        let schedule = daily_at_two();
        let fired = Utc.with_ymd_and_hms(2025, 3, 1, 2, 0, 0).unwrap();
        let restarted = Utc.with_ymd_and_hms(2025, 3, 1, 2, 30, 0).unwrap();

        let next = resume_point(1, &schedule, Some(fired), restarted).expect("next run");
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 2, 2, 0, 0).unwrap());
    }

    #[test]
    fn test_missed_cron_runs_are_skipped() {
        let schedule = daily_at_two();
        let fired = Utc.with_ymd_and_hms(2025, 3, 1, 2, 0, 0).unwrap();
        let restarted = Utc.with_ymd_and_hms(2025, 3, 4, 12, 0, 0).unwrap();

        assert_eq!(count_missed_runs(&schedule, fired, restarted), 3);
        let next = resume_point(1, &schedule, Some(fired), restarted).expect("next run");
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 5, 2, 0, 0).unwrap());
    }

    #[test]
    fn test_never_fired_waits_for_next_occurrence() {
        let schedule = daily_at_two();
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 2, 30, 0).unwrap();

        let next = resume_point(1, &schedule, None, now).expect("next run");
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 2, 2, 0, 0).unwrap());
    }

    #[test]
    fn test_interval_without_missed_runs() {
        let schedule = hourly_interval();
        let fired = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let now = fired + Duration::minutes(30);

        assert_eq!(count_missed_runs(&schedule, fired, now), 0);
        assert_eq!(
            resume_point(1, &schedule, Some(fired), now),
            Some(fired + Duration::hours(1))
        );
    }

    #[test]
    fn test_interval_skips_to_next_grid_point() {
        let schedule = hourly_interval();
        let fired = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let now = fired + Duration::minutes(270);

        assert_eq!(count_missed_runs(&schedule, fired, now), 4);
        assert_eq!(
            resume_point(1, &schedule, Some(fired), now),
            Some(fired + Duration::hours(5))
        );
    }

    #[test]
    fn test_interval_never_fired_starts_from_now() {
        let schedule = hourly_interval();
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 10, 15, 0).unwrap();

        assert_eq!(resume_point(1, &schedule, None, now), Some(now + Duration::hours(1)));
    }
}
