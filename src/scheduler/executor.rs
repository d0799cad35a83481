use crate::config::local::ExecutorConfig;
use crate::connection::{ConnectionDescriptor, ConnectionRegistry};
use crate::db::models::{Job, Tracker, TrackerOutcome, TrackerStatus, TriggeredBy};
use crate::db::queries;
use crate::error::{AppError, DatabaseError, Result, SchedulerError};
use crate::export::{self, ExportWriter};
use crate::mail::ResultMailer;
use crate::query::{self, QueryResult};
use crate::stream::{QueryResultMessage, TrackerStream, TrackerView};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct JobExecution {
    pub job_id: i32,
    pub scheduled_on: Option<DateTime<Utc>>,
    pub triggered_by: TriggeredBy,
    pub trace_id: String,
}

impl JobExecution {
    pub fn scheduled(job_id: i32, scheduled_on: DateTime<Utc>) -> Self {
        Self {
            job_id,
            scheduled_on: Some(scheduled_on),
            triggered_by: TriggeredBy::Schedule,
            trace_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn manual(job_id: i32) -> Self {
        Self {
            job_id,
            scheduled_on: None,
            triggered_by: TriggeredBy::Manual,
            trace_id: Uuid::new_v4().to_string(),
        }
    }
}

type InFlight = Arc<Mutex<HashSet<i32>>>;

/// Marks a job as queued or running until dropped.
pub struct InFlightGuard {
    job_id: i32,
    in_flight: InFlight,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        in_flight.remove(&self.job_id);
        debug!(job_id = self.job_id, "Released in-flight claim");
    }
}

pub struct QueuedExecution {
    pub execution: JobExecution,
    guard: InFlightGuard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// The job is still queued or running; nothing was queued.
    AlreadyInFlight,
}

/// Submission side of the executor queue.
#[derive(Clone)]
pub struct ExecutorHandle {
    tx: mpsc::Sender<QueuedExecution>,
    in_flight: InFlight,
}

impl ExecutorHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<QueuedExecution>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            tx,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        };
        (handle, rx)
    }

    fn claim(&self, job_id: i32) -> Option<InFlightGuard> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !in_flight.insert(job_id) {
            return None;
        }
        Some(InFlightGuard {
            job_id,
            in_flight: self.in_flight.clone(),
        })
    }

    pub fn is_in_flight(&self, job_id: i32) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&job_id)
    }

    /// Queues an execution. Waits while the queue is full.
    pub async fn submit(&self, execution: JobExecution) -> Result<SubmitOutcome> {
        let Some(guard) = self.claim(execution.job_id) else {
            info!(
                trace_id = %execution.trace_id,
                job_id = execution.job_id,
                triggered_by = execution.triggered_by.as_str(),
                "Job is still queued or running, skipping"
            );
            return Ok(SubmitOutcome::AlreadyInFlight);
        };

        debug!(
            trace_id = %execution.trace_id,
            job_id = execution.job_id,
            "Queueing job execution"
        );

        self.tx
            .send(QueuedExecution { execution, guard })
            .await
            .map_err(|_| SchedulerError::QueueClosed)?;

        Ok(SubmitOutcome::Queued)
    }
}

/// Runs queued executions on a bounded number of workers.
pub struct JobExecutor {
    pool: PgPool,
    connections: ConnectionRegistry,
    exports: ExportWriter,
    stream: TrackerStream,
    mailer: Option<Arc<ResultMailer>>,
    config: ExecutorConfig,
    workers: Arc<Semaphore>,
}

impl JobExecutor {
    pub fn new(
        pool: PgPool,
        connections: ConnectionRegistry,
        exports: ExportWriter,
        stream: TrackerStream,
        mailer: Option<Arc<ResultMailer>>,
        config: ExecutorConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            pool,
            connections,
            exports,
            stream,
            mailer,
            config,
            workers,
        }
    }

    pub async fn start(self: Arc<Self>, mut queue: mpsc::Receiver<QueuedExecution>) -> Result<()> {
        info!(workers = self.config.workers, "Job executor started");

        while let Some(queued) = queue.recv().await {
            // Waiting for a free worker here leaves the queue to fill up,
            // which is what pushes back on submitters.
            let Ok(permit) = self.workers.clone().acquire_owned().await else {
                break;
            };

            let executor = self.clone();
            tokio::spawn(async move {
                let QueuedExecution { execution, guard } = queued;
                let trace_id = execution.trace_id.clone();
                let job_id = execution.job_id;

                if let Err(e) = executor.execute(execution).await {
                    error!(
                        trace_id = %trace_id,
                        job_id = job_id,
                        "Job execution failed: {}",
                        e
                    );
                }

                drop(guard);
                drop(permit);
            });
        }

        info!("Job executor stopped");
        Ok(())
    }

    fn publish(&self, tracker: &Tracker, job: &Job, database: &str) {
        self.stream
            .publish_tracker(TrackerView::new(tracker, &job.name, database, &self.exports));
    }

    fn query_timeout(&self, job: &Job) -> Duration {
        job.query_timeout_seconds
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or_else(|| self.config.query_timeout())
    }

    async fn target(&self, job: &Job) -> Result<ConnectionDescriptor> {
        let connection_id = job.connection_id.ok_or_else(|| {
            DatabaseError::NotFound(format!("Connection of job {}", job.id))
        })?;
        self.connections.descriptor(connection_id).await
    }

    async fn run_query(
        &self,
        target: Result<ConnectionDescriptor>,
        sql: &str,
        max_rows: usize,
        timeout: Duration,
    ) -> Result<QueryResult> {
        let descriptor = target?;
        let mut handle = self.connections.acquire(&descriptor).await?;
        let result = query::fetch_with_timeout(&mut handle, sql, max_rows, timeout).await;
        handle.close().await;
        result
    }

    /// Runs one execution through its tracker lifecycle.
    ///
    /// Returns `None` when no tracker could be created: the job is deleted,
    /// a scheduled firing reached a disabled job, or this scheduled
    /// occurrence was already recorded. A tracker that was created never
    /// stays pending or running: if bookkeeping fails mid-run it is failed
    /// with the cause before the error is returned.
    pub async fn execute(&self, execution: JobExecution) -> Result<Option<Tracker>> {
        let trace_id = execution.trace_id.as_str();

        let Some(job) = queries::get_job(&self.pool, execution.job_id).await? else {
            warn!(
                trace_id = %trace_id,
                job_id = execution.job_id,
                "Job not found, skipping execution"
            );
            return Ok(None);
        };

        let target = self.target(&job).await;
        let database = target
            .as_ref()
            .map(|d| d.database.clone())
            .unwrap_or_default();

        let Some(tracker) = queries::create_tracker(
            &self.pool,
            job.id,
            execution.scheduled_on,
            execution.triggered_by,
        )
        .await?
        else {
            info!(
                trace_id = %trace_id,
                job_id = job.id,
                scheduled_on = ?execution.scheduled_on,
                "Job deleted, disabled or occurrence already recorded, skipping"
            );
            return Ok(None);
        };
        self.publish(&tracker, &job, &database);

        let tracker_id = tracker.id;
        match self.run_tracked(&execution, &job, tracker, target, &database).await {
            Ok(tracker) => Ok(Some(tracker)),
            Err(e) => {
                self.abandon(&job, tracker_id, &database, &e).await;
                Err(e)
            }
        }
    }

    async fn run_tracked(
        &self,
        execution: &JobExecution,
        job: &Job,
        tracker: Tracker,
        target: Result<ConnectionDescriptor>,
        database: &str,
    ) -> Result<Tracker> {
        let trace_id = execution.trace_id.as_str();

        let tracker = queries::mark_tracker_running(&self.pool, tracker.id).await?;
        self.publish(&tracker, job, database);

        info!(
            trace_id = %trace_id,
            job_id = job.id,
            tracker_id = tracker.id,
            job_name = %job.name,
            triggered_by = execution.triggered_by.as_str(),
            "Executing job"
        );

        let started = Instant::now();
        let outcome = self
            .run_query(
                target,
                &job.query_text,
                self.config.max_result_rows,
                self.query_timeout(job),
            )
            .await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let (tracker, result) = match outcome {
            Ok(result) => {
                let tracker = queries::complete_tracker(
                    &self.pool,
                    tracker.id,
                    &TrackerOutcome {
                        status: TrackerStatus::Success,
                        duration_ms,
                        header: Some(result.header_json()),
                        rows_preview: Some(result.preview_json(self.config.tracker_row_limit)),
                        row_count: Some(result.row_count() as i64),
                        error_message: None,
                        error_ext: None,
                    },
                )
                .await?;

                info!(
                    trace_id = %trace_id,
                    job_id = job.id,
                    tracker_id = tracker.id,
                    rows = result.row_count(),
                    truncated = result.truncated,
                    duration_ms = duration_ms,
                    "Job completed successfully"
                );

                self.stream.publish_query_result(
                    job.id,
                    QueryResultMessage::success(
                        Some(tracker.id),
                        result.header.clone(),
                        result.preview(self.config.tracker_row_limit),
                    ),
                );
                (tracker, Some(result))
            }
            Err(e) => {
                let details = e.diagnostics();
                let tracker = queries::complete_tracker(
                    &self.pool,
                    tracker.id,
                    &TrackerOutcome {
                        status: TrackerStatus::Failed,
                        duration_ms,
                        header: None,
                        rows_preview: None,
                        row_count: None,
                        error_message: Some(e.to_string()),
                        error_ext: (!details.is_empty()).then(|| serde_json::json!(details)),
                    },
                )
                .await?;

                warn!(
                    trace_id = %trace_id,
                    job_id = job.id,
                    tracker_id = tracker.id,
                    duration_ms = duration_ms,
                    "Job failed: {}",
                    e
                );

                self.stream.publish_query_result(
                    job.id,
                    QueryResultMessage::failure(Some(tracker.id), e.to_string(), details),
                );
                (tracker, None)
            }
        };
        self.publish(&tracker, job, database);

        if let Err(e) = queries::increment_executed(&self.pool, job.id).await {
            warn!(job_id = job.id, "Failed to update execution counter: {}", e);
        }

        let Some(result) = result else {
            return Ok(tracker);
        };
        self.mail_result(job, tracker.id, &result);

        let flags = job.export_flags();
        if !flags.any() {
            return Ok(tracker);
        }

        match self
            .exports
            .write_in_background(tracker.id, result, flags)
            .await
        {
            Ok(artifacts) => {
                let tracker = queries::set_tracker_artifacts(
                    &self.pool,
                    tracker.id,
                    artifacts.csv.map(|p| p.display().to_string()),
                    artifacts.xlsx.map(|p| p.display().to_string()),
                )
                .await?;
                self.publish(&tracker, job, database);
                Ok(tracker)
            }
            Err(e) => {
                error!(
                    trace_id = %trace_id,
                    job_id = job.id,
                    tracker_id = tracker.id,
                    "Export failed: {}",
                    e
                );
                Ok(tracker)
            }
        }
    }

    /// Fails a tracker whose run was cut short by `cause`. Trackers that
    /// already reached a final state are left alone.
    async fn abandon(&self, job: &Job, tracker_id: i64, database: &str, cause: &AppError) {
        let outcome = TrackerOutcome {
            status: TrackerStatus::Failed,
            duration_ms: 0,
            header: None,
            rows_preview: None,
            row_count: None,
            error_message: Some(format!("Run interrupted: {}", cause)),
            error_ext: None,
        };
        match queries::complete_tracker(&self.pool, tracker_id, &outcome).await {
            Ok(tracker) => {
                warn!(
                    job_id = job.id,
                    tracker_id = tracker_id,
                    "Tracker failed after interrupted run: {}",
                    cause
                );
                self.publish(&tracker, job, database);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => error!(
                job_id = job.id,
                tracker_id = tracker_id,
                "Failed to close interrupted tracker: {}",
                e
            ),
        }
    }

    /// Mails the result to the job's recipients in the background.
    fn mail_result(&self, job: &Job, tracker_id: i64, result: &QueryResult) {
        if job.mail_to.is_empty() {
            return;
        }
        let Some(mailer) = self.mailer.clone() else {
            warn!(
                job_id = job.id,
                "Job has mail recipients but no mail transport is configured"
            );
            return;
        };

        let recipients = job.mail_to.clone();
        let job_name = job.name.clone();
        let result = result.clone();
        tokio::spawn(async move {
            let rendered = tokio::task::spawn_blocking(move || export::xlsx_bytes(&result)).await;
            let xlsx = match rendered {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(e)) => {
                    error!(tracker_id = tracker_id, "Failed to render mail attachment: {}", e);
                    return;
                }
                Err(e) => {
                    error!(tracker_id = tracker_id, "Mail attachment task failed: {}", e);
                    return;
                }
            };
            if let Err(e) = mailer
                .send_result(&recipients, &job_name, tracker_id, xlsx)
                .await
            {
                error!(tracker_id = tracker_id, "Failed to send result mail: {}", e);
            }
        });
    }

    /// Runs an ad-hoc query against a stored connection. No tracker is
    /// written and nothing is published.
    pub async fn preview(&self, connection_id: i32, sql: &str) -> Result<QueryResultMessage> {
        if sql.trim().is_empty() {
            return Err(crate::error::ValidationError::MissingField("query".to_string()).into());
        }
        let descriptor = self.connections.descriptor(connection_id).await?;

        let outcome = self
            .run_query(
                Ok(descriptor),
                sql,
                self.config.preview_row_limit,
                self.config.query_timeout(),
            )
            .await;

        match outcome {
            Ok(result) => Ok(QueryResultMessage::success(None, result.header, result.rows)),
            Err(e @ (AppError::Execution(_) | AppError::Connection(_))) => Ok(
                QueryResultMessage::failure(None, e.to_string(), e.diagnostics()),
            ),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_submit_is_skipped() {
        let (handle, mut rx) = ExecutorHandle::channel(4);

        let first = handle.submit(JobExecution::manual(1)).await.expect("submit");
        let second = handle.submit(JobExecution::manual(1)).await.expect("submit");
        let other = handle.submit(JobExecution::manual(2)).await.expect("submit");

        assert_eq!(first, SubmitOutcome::Queued);
        assert_eq!(second, SubmitOutcome::AlreadyInFlight);
        assert_eq!(other, SubmitOutcome::Queued);

        let queued = rx.recv().await.expect("queued execution");
        assert_eq!(queued.execution.job_id, 1);
        assert!(handle.is_in_flight(1));

        drop(queued);
        assert!(!handle.is_in_flight(1));
        let again = handle.submit(JobExecution::manual(1)).await.expect("submit");
        assert_eq!(again, SubmitOutcome::Queued);
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        let (handle, mut rx) = ExecutorHandle::channel(1);
        handle.submit(JobExecution::manual(1)).await.expect("submit");

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            handle.submit(JobExecution::manual(2)),
        )
        .await;
        assert!(blocked.is_err(), "submit should wait for queue space");

        rx.recv().await.expect("queued execution");
        let outcome = tokio::time::timeout(
            Duration::from_millis(500),
            handle.submit(JobExecution::manual(3)),
        )
        .await
        .expect("queue has space")
        .expect("submit");
        assert_eq!(outcome, SubmitOutcome::Queued);
    }

    #[tokio::test]
    async fn test_submit_to_closed_queue_fails_and_releases_claim() {
        let (handle, rx) = ExecutorHandle::channel(1);
        drop(rx);

        let err = handle.submit(JobExecution::manual(5)).await.unwrap_err();
        assert!(matches!(err, AppError::Scheduler(SchedulerError::QueueClosed)));
        assert!(!handle.is_in_flight(5));
    }

    #[test]
    fn test_scheduled_execution_carries_timestamp() {
        let at = Utc::now();
        let execution = JobExecution::scheduled(3, at);

        assert_eq!(execution.scheduled_on, Some(at));
        assert_eq!(execution.triggered_by, TriggeredBy::Schedule);
        assert_ne!(execution.trace_id, JobExecution::scheduled(3, at).trace_id);
    }
}
