use crate::config::LocalConfig;
use crate::connection::ConnectionRegistry;
use crate::credentials::CredentialCipher;
use crate::db::models::{Job, JobDraft, JobRecord};
use crate::db::queries;
use crate::error::{DatabaseError, Result};
use crate::export::ExportWriter;
use crate::mail::ResultMailer;
use crate::scheduler::executor::{
    ExecutorHandle, JobExecution, JobExecutor, QueuedExecution, SubmitOutcome,
};
use crate::scheduler::Scheduler;
use crate::store::JobStore;
use crate::stream::{TrackerDetail, TrackerStream, TrackerView};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

const INTERRUPTED_MESSAGE: &str = "Interrupted before completion";

/// Shared services behind the HTTP surface and the CLI.
pub struct AppState {
    pub config: LocalConfig,
    pub pool: PgPool,
    pub connections: ConnectionRegistry,
    pub jobs: JobStore,
    pub scheduler: Arc<Scheduler>,
    pub executor: Arc<JobExecutor>,
    pub runs: ExecutorHandle,
    pub stream: TrackerStream,
    pub exports: ExportWriter,
}

impl AppState {
    /// Wires every service together. The returned receiver feeds
    /// `JobExecutor::start`.
    pub fn new(
        config: LocalConfig,
        pool: PgPool,
    ) -> Result<(Self, mpsc::Receiver<QueuedExecution>)> {
        let cipher = Arc::new(CredentialCipher::new(&config.credentials.secret)?);
        let mailer = match &config.mail {
            Some(mail) => Some(Arc::new(ResultMailer::from_config(mail)?)),
            None => None,
        };
        let connections =
            ConnectionRegistry::new(pool.clone(), config.executor.connect_timeout(), cipher);
        let exports = ExportWriter::new(&config.exports);
        let stream = TrackerStream::new(config.stream.trackers_snapshot_size);
        let (runs, queue) = ExecutorHandle::channel(config.executor.queue_capacity);

        let executor = Arc::new(JobExecutor::new(
            pool.clone(),
            connections.clone(),
            exports.clone(),
            stream.clone(),
            mailer,
            config.executor.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(pool.clone(), runs.clone(), &config.scheduler));

        let state = Self {
            jobs: JobStore::new(pool.clone()),
            config,
            pool,
            connections,
            scheduler,
            executor,
            runs,
            stream,
            exports,
        };
        Ok((state, queue))
    }

    /// Fails trackers a previous process left pending or running. Call
    /// before the executor starts.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let failed = queries::fail_unfinished_trackers(&self.pool, INTERRUPTED_MESSAGE).await?;
        for tracker in &failed {
            warn!(
                tracker_id = tracker.id,
                job_id = tracker.job_id,
                "Marked interrupted tracker as failed"
            );
        }
        Ok(failed.len())
    }

    /// Expires successful results past their validity window, removes their
    /// artifacts and republishes the trackers still in the snapshot.
    pub async fn expire_results(&self) -> Result<usize> {
        let valid_seconds = i64::try_from(self.config.exports.result_valid_seconds)
            .unwrap_or(i64::MAX);
        let expired = queries::expire_trackers(&self.pool, valid_seconds).await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let mut views = Vec::with_capacity(expired.len());
        for tracker in &expired {
            if let Err(e) = self.exports.remove(tracker.id) {
                warn!(tracker_id = tracker.id, "Failed to remove expired artifacts: {}", e);
            }
            if let Some(row) = queries::get_tracker_with_job(&self.pool, tracker.id).await? {
                views.push(TrackerView::from_joined(&row, &self.exports));
            }
        }
        self.stream.refresh_trackers(views);

        info!("Expired {} tracker results", expired.len());
        Ok(expired.len())
    }

    /// Runs `expire_results` every `every`. Never returns.
    pub async fn sweep_expired_results(&self, every: Duration) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.expire_results().await {
                error!("Error expiring results: {}", e);
            }
        }
    }

    /// One tracker with its job context and preview rows.
    pub async fn tracker_detail(&self, id: i64) -> Result<TrackerDetail> {
        self.expire_results().await?;
        let row = queries::get_tracker_with_job(&self.pool, id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Tracker {}", id)))?;
        Ok(TrackerDetail::from_joined(&row, &self.exports))
    }

    /// A job's run history, newest first. Deleted jobs keep theirs.
    pub async fn job_history(&self, id: i32, limit: i64) -> Result<Vec<TrackerView>> {
        self.expire_results().await?;
        let (job, trackers) = self.jobs.trackers(id, limit).await?;

        let database = match job.connection_id {
            Some(connection_id) => self
                .connections
                .get(connection_id)
                .await
                .map(|c| c.database)
                .unwrap_or_default(),
            None => String::new(),
        };

        Ok(trackers
            .iter()
            .map(|t| TrackerView::new(t, &job.name, &database, &self.exports))
            .collect())
    }

    /// Seeds the trackers topic with the newest stored trackers.
    pub async fn seed_stream(&self) -> Result<()> {
        self.expire_results().await?;
        let size = self.config.stream.trackers_snapshot_size as i64;
        let recent = queries::get_recent_trackers(&self.pool, size).await?;
        let views = recent
            .iter()
            .map(|row| TrackerView::from_joined(row, &self.exports))
            .collect::<Vec<_>>();
        info!("Seeded trackers stream with {} trackers", views.len());
        self.stream.seed(views);
        Ok(())
    }

    async fn record(&self, id: i32) -> Result<JobRecord> {
        let job = self.jobs.get(id).await?;
        Ok(JobRecord::from(&job))
    }

    pub async fn create_job(&self, draft: &JobDraft) -> Result<JobRecord> {
        let job = self.jobs.create(draft).await?;
        self.scheduler.upsert(&job).await?;
        self.record(job.id).await
    }

    pub async fn update_job(&self, id: i32, draft: &JobDraft) -> Result<JobRecord> {
        let job = self.jobs.update(id, draft).await?;
        self.scheduler.upsert(&job).await?;
        self.record(job.id).await
    }

    /// Deletes a job and retires its slot. Trackers stay retrievable.
    pub async fn delete_job(&self, id: i32) -> Result<()> {
        self.jobs.delete(id).await?;
        self.scheduler.retire(id).await;
        self.stream.close_job(id);
        Ok(())
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        let jobs: Vec<Job> = self.jobs.list().await?;
        Ok(jobs.iter().map(JobRecord::from).collect())
    }

    pub async fn get_job(&self, id: i32) -> Result<JobRecord> {
        self.record(id).await
    }

    /// Queues a manual run. `false` if the job is already queued or running.
    pub async fn run_job_now(&self, id: i32) -> Result<bool> {
        self.jobs.get(id).await?;
        let outcome = self.runs.submit(JobExecution::manual(id)).await?;
        Ok(outcome == SubmitOutcome::Queued)
    }
}
