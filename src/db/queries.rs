use crate::db::models::{
    Connection, ConnectionDraft, Job, JobDraft, ScheduleSpec, Tracker, TrackerOutcome,
    TrackerStatus, TrackerWithJob, TriggeredBy,
};
use crate::error::{DatabaseError, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, PgPool};
use std::time::Duration;
use tracing::log::LevelFilter;

pub async fn create_pool(connection_string: String) -> Result<PgPool> {
    let connect_options: PgConnectOptions = connection_string
        .parse()
        .map_err(|e| DatabaseError::ConnectionFailed(sqlx::Error::Configuration(Box::new(e))))?;

    create_pool_with(connect_options).await
}

pub async fn create_pool_with(connect_options: PgConnectOptions) -> Result<PgPool> {
    let connect_options = connect_options.log_statements(LevelFilter::Debug);

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(connect_options)
        .await
        .map_err(DatabaseError::ConnectionFailed)?;

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| DatabaseError::MigrationFailed(sqlx::Error::Migrate(Box::new(e))))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

pub async fn insert_connection(pool: &PgPool, draft: &ConnectionDraft) -> Result<Connection> {
    let connection = sqlx::query_as::<_, Connection>(
        r#"
        INSERT INTO connections (name, driver, host, port, user_name, password, database)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(&draft.name)
    .bind(&draft.driver)
    .bind(&draft.host)
    .bind(draft.port)
    .bind(&draft.user_name)
    .bind(&draft.password)
    .bind(&draft.database)
    .fetch_one(pool)
    .await?;
    Ok(connection)
}

/// Updates a connection. A `None` password keeps the stored one.
pub async fn update_connection(
    pool: &PgPool,
    id: i32,
    draft: &ConnectionDraft,
) -> Result<Option<Connection>> {
    let connection = sqlx::query_as::<_, Connection>(
        r#"
        UPDATE connections
        SET name = $2,
            driver = $3,
            host = $4,
            port = $5,
            user_name = $6,
            password = COALESCE($7, password),
            database = $8,
            updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(&draft.name)
    .bind(&draft.driver)
    .bind(&draft.host)
    .bind(draft.port)
    .bind(&draft.user_name)
    .bind(&draft.password)
    .bind(&draft.database)
    .fetch_optional(pool)
    .await?;
    Ok(connection)
}

pub async fn get_connection(pool: &PgPool, id: i32) -> Result<Option<Connection>> {
    let connection = sqlx::query_as::<_, Connection>("SELECT * FROM connections WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(connection)
}

pub async fn list_connections(pool: &PgPool) -> Result<Vec<Connection>> {
    let connections = sqlx::query_as::<_, Connection>("SELECT * FROM connections ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(connections)
}

/// Number of live jobs that still point at a connection.
pub async fn count_jobs_using_connection(pool: &PgPool, id: i32) -> Result<i64> {
    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM jobs WHERE connection_id = $1 AND is_deleted = false",
    )
    .bind(id)
    .fetch_one(pool)
    .await?;
    Ok(count.0)
}

pub async fn delete_connection(pool: &PgPool, id: i32) -> Result<bool> {
    let result = sqlx::query("DELETE FROM connections WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

struct ScheduleColumns {
    schedule_type: Option<&'static str>,
    cron_expression: Option<String>,
    timezone: String,
    interval_seconds: Option<i32>,
}

fn schedule_columns(schedule: &Option<ScheduleSpec>) -> ScheduleColumns {
    match schedule {
        Some(ScheduleSpec::Cron {
            expression,
            timezone,
        }) => ScheduleColumns {
            schedule_type: Some("cron"),
            cron_expression: Some(expression.clone()),
            timezone: timezone.clone(),
            interval_seconds: None,
        },
        Some(ScheduleSpec::Interval { seconds }) => ScheduleColumns {
            schedule_type: Some("interval"),
            cron_expression: None,
            timezone: "UTC".to_string(),
            interval_seconds: Some(*seconds),
        },
        None => ScheduleColumns {
            schedule_type: None,
            cron_expression: None,
            timezone: "UTC".to_string(),
            interval_seconds: None,
        },
    }
}

pub async fn insert_job(pool: &PgPool, draft: &JobDraft) -> Result<Job> {
    let columns = schedule_columns(&draft.schedule);
    let job = sqlx::query_as::<_, Job>(
        r#"
        INSERT INTO jobs (
            name, annotation, query_text, connection_id,
            schedule_type, cron_expression, timezone, interval_seconds,
            export_csv, export_xlsx, query_timeout_seconds, enabled, mail_to
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        RETURNING *
        "#,
    )
    .bind(&draft.name)
    .bind(&draft.annotation)
    .bind(&draft.query)
    .bind(draft.connection_id)
    .bind(columns.schedule_type)
    .bind(columns.cron_expression)
    .bind(columns.timezone)
    .bind(columns.interval_seconds)
    .bind(draft.export_flags.csv)
    .bind(draft.export_flags.xlsx)
    .bind(draft.query_timeout_seconds)
    .bind(draft.enabled)
    .bind(&draft.mail_to)
    .fetch_one(pool)
    .await?;
    Ok(job)
}

/// Replaces a live job's definition. The schedule status is reset, the
/// scheduler re-validates it on the next upsert.
pub async fn update_job(pool: &PgPool, id: i32, draft: &JobDraft) -> Result<Option<Job>> {
    let columns = schedule_columns(&draft.schedule);
    let job = sqlx::query_as::<_, Job>(
        r#"
        UPDATE jobs
        SET name = $2,
            annotation = $3,
            query_text = $4,
            connection_id = $5,
            schedule_type = $6,
            cron_expression = $7,
            timezone = $8,
            interval_seconds = $9,
            export_csv = $10,
            export_xlsx = $11,
            query_timeout_seconds = $12,
            enabled = $13,
            mail_to = $14,
            schedule_status = 'valid',
            schedule_error = NULL,
            next_run_at = NULL,
            updated_at = NOW()
        WHERE id = $1 AND is_deleted = false
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(&draft.name)
    .bind(&draft.annotation)
    .bind(&draft.query)
    .bind(draft.connection_id)
    .bind(columns.schedule_type)
    .bind(columns.cron_expression)
    .bind(columns.timezone)
    .bind(columns.interval_seconds)
    .bind(draft.export_flags.csv)
    .bind(draft.export_flags.xlsx)
    .bind(draft.query_timeout_seconds)
    .bind(draft.enabled)
    .bind(&draft.mail_to)
    .fetch_optional(pool)
    .await?;
    Ok(job)
}

pub async fn get_job(pool: &PgPool, id: i32) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1 AND is_deleted = false")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(job)
}

/// Loads a job whether or not it has been deleted, for history lookups.
pub async fn get_job_including_deleted(pool: &PgPool, id: i32) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(job)
}

pub async fn list_jobs(pool: &PgPool) -> Result<Vec<Job>> {
    let jobs =
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE is_deleted = false ORDER BY id")
            .fetch_all(pool)
            .await?;
    Ok(jobs)
}

/// Live, enabled jobs that carry a schedule.
pub async fn list_schedulable_jobs(pool: &PgPool) -> Result<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>(
        r#"
        SELECT * FROM jobs
        WHERE is_deleted = false
          AND enabled = true
          AND schedule_type IS NOT NULL
        ORDER BY id
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(jobs)
}

/// Soft-deletes a job. Blocks while a tracker insert holds the row lock.
pub async fn soft_delete_job(pool: &PgPool, id: i32) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET is_deleted = true,
            enabled = false,
            next_run_at = NULL,
            updated_at = NOW()
        WHERE id = $1 AND is_deleted = false
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_schedule_status(
    pool: &PgPool,
    id: i32,
    error: Option<String>,
    next_run_at: Option<DateTime<Utc>>,
) -> Result<()> {
    let status = if error.is_some() { "invalid" } else { "valid" };
    sqlx::query(
        r#"
        UPDATE jobs
        SET schedule_status = $2,
            schedule_error = $3,
            next_run_at = $4
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(error)
    .bind(next_run_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_job_fired(
    pool: &PgPool,
    id: i32,
    fired_at: DateTime<Utc>,
    next_run_at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET last_fired_at = $2,
            next_run_at = $3
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(fired_at)
    .bind(next_run_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn increment_executed(pool: &PgPool, id: i32) -> Result<()> {
    sqlx::query("UPDATE jobs SET no_of_executed = no_of_executed + 1 WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Trackers
// ---------------------------------------------------------------------------

/// Creates the pending tracker for one execution.
///
/// The job row is locked `FOR SHARE` first, so a concurrent soft delete or
/// disable either commits before (no tracker is written) or waits until this
/// tracker exists. Returns `None` if the job is gone, if a scheduled firing
/// reaches a disabled job, or if a tracker for the same
/// `(job_id, scheduled_on)` pair already exists. Manual runs of disabled
/// jobs are allowed.
pub async fn create_tracker(
    pool: &PgPool,
    job_id: i32,
    scheduled_on: Option<DateTime<Utc>>,
    triggered_by: TriggeredBy,
) -> Result<Option<Tracker>> {
    let mut tx = pool.begin().await?;

    let live: Option<(i32,)> = sqlx::query_as(
        r#"
        SELECT id FROM jobs
        WHERE id = $1 AND is_deleted = false AND (enabled = true OR $2)
        FOR SHARE
        "#,
    )
    .bind(job_id)
    .bind(triggered_by == TriggeredBy::Manual)
    .fetch_optional(&mut *tx)
    .await?;

    if live.is_none() {
        tx.rollback().await?;
        return Ok(None);
    }

    let tracker = sqlx::query_as::<_, Tracker>(
        r#"
        INSERT INTO trackers (job_id, scheduled_on, triggered_by, status)
        VALUES ($1, $2, $3, 'pending')
        ON CONFLICT (job_id, scheduled_on) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(job_id)
    .bind(scheduled_on)
    .bind(triggered_by.as_str())
    .fetch_optional(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(tracker)
}

pub async fn mark_tracker_running(pool: &PgPool, id: i64) -> Result<Tracker> {
    let tracker = sqlx::query_as::<_, Tracker>(
        r#"
        UPDATE trackers
        SET status = 'running',
            ran_on = NOW()
        WHERE id = $1 AND status = 'pending'
        RETURNING *
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DatabaseError::NotFound(format!("Pending tracker {}", id)))?;
    Ok(tracker)
}

/// Writes the final state of a tracker. Already-final trackers are left
/// untouched and reported as not found.
pub async fn complete_tracker(
    pool: &PgPool,
    id: i64,
    outcome: &TrackerOutcome,
) -> Result<Tracker> {
    debug_assert!(outcome.status.is_final());
    let tracker = sqlx::query_as::<_, Tracker>(
        r#"
        UPDATE trackers
        SET status = $2,
            ran_on = COALESCE(ran_on, NOW()),
            duration_ms = $3,
            header = $4,
            rows_preview = $5,
            row_count = $6,
            error_message = $7,
            error_ext = $8
        WHERE id = $1 AND status IN ('pending', 'running')
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(outcome.status.as_str())
    .bind(outcome.duration_ms)
    .bind(&outcome.header)
    .bind(&outcome.rows_preview)
    .bind(outcome.row_count)
    .bind(&outcome.error_message)
    .bind(&outcome.error_ext)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DatabaseError::NotFound(format!("Unfinished tracker {}", id)))?;
    Ok(tracker)
}

/// Fails every tracker left pending or running, e.g. by a crash or restart.
pub async fn fail_unfinished_trackers(pool: &PgPool, message: &str) -> Result<Vec<Tracker>> {
    let trackers = sqlx::query_as::<_, Tracker>(
        r#"
        UPDATE trackers
        SET status = 'failed',
            ran_on = COALESCE(ran_on, NOW()),
            error_message = $1
        WHERE status IN ('pending', 'running')
        RETURNING *
        "#,
    )
    .bind(message)
    .fetch_all(pool)
    .await?;
    Ok(trackers)
}

/// Moves successful trackers whose result is older than `valid_seconds`,
/// counted from the end of the run, to `expired` and forgets their artifacts.
pub async fn expire_trackers(pool: &PgPool, valid_seconds: i64) -> Result<Vec<Tracker>> {
    let trackers = sqlx::query_as::<_, Tracker>(
        r#"
        UPDATE trackers
        SET status = 'expired',
            csv_path = NULL,
            xlsx_path = NULL
        WHERE status = 'success'
          AND ran_on IS NOT NULL
          AND ran_on
              + duration_ms * INTERVAL '1 millisecond'
              + $1 * INTERVAL '1 second' < NOW()
        RETURNING *
        "#,
    )
    .bind(valid_seconds)
    .fetch_all(pool)
    .await?;
    Ok(trackers)
}

pub async fn set_tracker_artifacts(
    pool: &PgPool,
    id: i64,
    csv_path: Option<String>,
    xlsx_path: Option<String>,
) -> Result<Tracker> {
    let tracker = sqlx::query_as::<_, Tracker>(
        r#"
        UPDATE trackers
        SET csv_path = COALESCE($2, csv_path),
            xlsx_path = COALESCE($3, xlsx_path)
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(csv_path)
    .bind(xlsx_path)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DatabaseError::NotFound(format!("Tracker {}", id)))?;
    Ok(tracker)
}

pub async fn get_tracker(pool: &PgPool, id: i64) -> Result<Option<Tracker>> {
    let tracker = sqlx::query_as::<_, Tracker>("SELECT * FROM trackers WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(tracker)
}

const TRACKER_WITH_JOB: &str = r#"
    SELECT t.*, j.name AS job_name, COALESCE(c.database, '') AS database_name
    FROM trackers t
    JOIN jobs j ON j.id = t.job_id
    LEFT JOIN connections c ON c.id = j.connection_id
"#;

/// Newest trackers first.
pub async fn get_recent_trackers(pool: &PgPool, limit: i64) -> Result<Vec<TrackerWithJob>> {
    let sql = format!("{} ORDER BY t.id DESC LIMIT $1", TRACKER_WITH_JOB);
    let trackers = sqlx::query_as::<_, TrackerWithJob>(&sql)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(trackers)
}

pub async fn get_tracker_with_job(pool: &PgPool, id: i64) -> Result<Option<TrackerWithJob>> {
    let sql = format!("{} WHERE t.id = $1", TRACKER_WITH_JOB);
    let tracker = sqlx::query_as::<_, TrackerWithJob>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(tracker)
}

pub async fn get_trackers_for_job(pool: &PgPool, job_id: i32, limit: i64) -> Result<Vec<Tracker>> {
    let trackers = sqlx::query_as::<_, Tracker>(
        "SELECT * FROM trackers WHERE job_id = $1 ORDER BY id DESC LIMIT $2",
    )
    .bind(job_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(trackers)
}

pub async fn get_latest_successful_tracker(pool: &PgPool, job_id: i32) -> Result<Option<Tracker>> {
    let tracker = sqlx::query_as::<_, Tracker>(
        r#"
        SELECT * FROM trackers
        WHERE job_id = $1 AND status = $2
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(job_id)
    .bind(TrackerStatus::Success.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(tracker)
}
