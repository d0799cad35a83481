use crate::db::models::{Job, JobDraft, ScheduleSpec, Tracker};
use crate::db::queries;
use crate::error::{DatabaseError, Result, ValidationError};
use crate::mail;
use sqlx::PgPool;
use tracing::info;

const MAX_NAME_LEN: usize = 100;

/// Durable repository of job definitions.
#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
}

fn invalid(field: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidField {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Field checks that need no database access. Schedule expressions are
/// parsed by the scheduler, which marks the job invalid on failure.
pub fn validate_draft(draft: &JobDraft) -> std::result::Result<(), ValidationError> {
    if draft.name.trim().is_empty() {
        return Err(ValidationError::MissingField("name".to_string()));
    }
    if draft.name.chars().count() > MAX_NAME_LEN {
        return Err(invalid(
            "name",
            format!("must be at most {} characters", MAX_NAME_LEN),
        ));
    }
    if draft.query.trim().is_empty() {
        return Err(ValidationError::MissingField("query".to_string()));
    }
    if let Some(timeout) = draft.query_timeout_seconds {
        if timeout <= 0 {
            return Err(invalid("queryTimeoutSeconds", "must be positive"));
        }
    }
    for address in &draft.mail_to {
        if let Err(e) = mail::parse_address(address) {
            return Err(invalid("mailTo", e.to_string()));
        }
    }
    match &draft.schedule {
        Some(ScheduleSpec::Cron { expression, .. }) if expression.trim().is_empty() => {
            Err(invalid("schedule.expression", "cannot be empty"))
        }
        _ => Ok(()),
    }
}

impl JobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn check_connection(&self, connection_id: i32) -> Result<()> {
        if queries::get_connection(&self.pool, connection_id)
            .await?
            .is_none()
        {
            return Err(ValidationError::UnknownConnection(connection_id).into());
        }
        Ok(())
    }

    pub async fn create(&self, draft: &JobDraft) -> Result<Job> {
        validate_draft(draft)?;
        self.check_connection(draft.connection_id).await?;

        let job = queries::insert_job(&self.pool, draft).await?;
        info!(job_id = job.id, job_name = %job.name, "Job created");
        Ok(job)
    }

    pub async fn update(&self, id: i32, draft: &JobDraft) -> Result<Job> {
        validate_draft(draft)?;
        self.check_connection(draft.connection_id).await?;

        let job = queries::update_job(&self.pool, id, draft)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Job {}", id)))?;
        info!(job_id = job.id, "Job updated");
        Ok(job)
    }

    pub async fn get(&self, id: i32) -> Result<Job> {
        queries::get_job(&self.pool, id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Job {}", id)).into())
    }

    pub async fn list(&self) -> Result<Vec<Job>> {
        queries::list_jobs(&self.pool).await
    }

    /// Soft-deletes a job. Once this returns, no new tracker can be created
    /// for it. Existing trackers stay.
    pub async fn delete(&self, id: i32) -> Result<()> {
        if !queries::soft_delete_job(&self.pool, id).await? {
            return Err(DatabaseError::NotFound(format!("Job {}", id)).into());
        }
        info!(job_id = id, "Job deleted");
        Ok(())
    }

    /// A job's run history, newest first. Deleted jobs keep their history.
    pub async fn trackers(&self, id: i32, limit: i64) -> Result<(Job, Vec<Tracker>)> {
        let job = queries::get_job_including_deleted(&self.pool, id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Job {}", id)))?;
        let trackers = queries::get_trackers_for_job(&self.pool, id, limit).await?;
        Ok((job, trackers))
    }
}
