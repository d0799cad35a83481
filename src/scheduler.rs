pub mod executor;
pub mod missed_runs;
pub mod schedule_calc;
pub mod slot;

use crate::config::local::SchedulerConfig;
use crate::db::models::Job;
use crate::db::queries;
use crate::error::Result;
use chrono::{DateTime, Utc};
use executor::{ExecutorHandle, JobExecution, SubmitOutcome};
use slot::{Slot, SlotState};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Owns one slot per schedulable job and hands due firings to the executor.
pub struct Scheduler {
    pool: PgPool,
    executor: ExecutorHandle,
    slots: Arc<Mutex<HashMap<i32, Slot>>>,
    generation: AtomicU64,
    check_interval: Duration,
}

impl Scheduler {
    pub fn new(pool: PgPool, executor: ExecutorHandle, config: &SchedulerConfig) -> Self {
        Self {
            pool,
            executor,
            slots: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            check_interval: Duration::from_secs(config.check_interval_seconds.max(1)),
        }
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        info!("Scheduler started");

        self.reload_jobs().await?;

        let mut check_interval = interval(self.check_interval);
        check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            check_interval.tick().await;

            if let Err(e) = self.check_slots(Utc::now()).await {
                error!("Error checking schedules: {}", e);
            }
        }
    }

    pub async fn reload_jobs(&self) -> Result<()> {
        info!("Reloading jobs from database");

        let jobs = queries::list_schedulable_jobs(&self.pool).await?;
        self.slots.lock().await.clear();

        for job in &jobs {
            self.upsert(job).await?;
        }

        info!("Loaded {} schedulable jobs", jobs.len());
        Ok(())
    }

    /// Replaces the job's slot with a fresh one built from its current
    /// definition. Disabled, deleted and unscheduled jobs get no slot.
    pub async fn upsert(&self, job: &Job) -> Result<()> {
        self.retire(job.id).await;

        let Some(spec) = job.schedule().filter(|_| job.enabled && !job.is_deleted) else {
            debug!(job_id = job.id, "Job has no active schedule");
            if job.next_run_at.is_some() && !job.is_deleted {
                queries::set_schedule_status(&self.pool, job.id, None, None).await?;
            }
            return Ok(());
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        match schedule_calc::compile(&spec) {
            Ok(compiled) => {
                let mut slot = Slot::new(job.id, generation, Some(compiled), job.last_fired_at);
                let next = slot.arm(Utc::now());
                self.slots.lock().await.insert(job.id, slot);

                queries::set_schedule_status(&self.pool, job.id, None, next).await?;
                debug!(
                    job_id = job.id,
                    generation = generation,
                    next_run = ?next,
                    "Armed job"
                );
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(job_id = job.id, "Invalid schedule, job will not run: {}", reason);

                let mut slot = Slot::new(job.id, generation, None, job.last_fired_at);
                slot.transition(SlotState::Invalid {
                    reason: reason.clone(),
                });
                self.slots.lock().await.insert(job.id, slot);

                queries::set_schedule_status(&self.pool, job.id, Some(reason), None).await?;
            }
        }

        Ok(())
    }

    /// Removes a job's slot. A firing already handed to the executor still
    /// runs to completion.
    pub async fn retire(&self, job_id: i32) {
        if let Some(mut slot) = self.slots.lock().await.remove(&job_id) {
            slot.transition(SlotState::Retired);
            debug!(job_id = job_id, "Retired job slot");
        }
    }

    pub async fn slot_state(&self, job_id: i32) -> Option<SlotState> {
        self.slots
            .lock()
            .await
            .get(&job_id)
            .map(|slot| slot.state.clone())
    }

    /// Fires every slot due at `now`. Returns the number of firings.
    pub async fn check_slots(&self, now: DateTime<Utc>) -> Result<usize> {
        let due: Vec<(i32, u64, DateTime<Utc>)> = {
            let mut slots = self.slots.lock().await;
            debug!("Checking {} job slots", slots.len());
            slots
                .values_mut()
                .filter_map(|slot| {
                    slot.fire_if_due(now)
                        .map(|scheduled| (slot.job_id, slot.generation, scheduled))
                })
                .collect()
        };

        for (job_id, generation, scheduled) in &due {
            self.fire(*job_id, *generation, *scheduled).await;
        }

        Ok(due.len())
    }

    async fn fire(&self, job_id: i32, generation: u64, scheduled: DateTime<Utc>) {
        let execution = JobExecution::scheduled(job_id, scheduled);
        info!(
            trace_id = %execution.trace_id,
            job_id = job_id,
            scheduled = %scheduled,
            "Job is due, queueing execution"
        );

        match self.executor.submit(execution).await {
            Ok(SubmitOutcome::Queued) => {}
            Ok(SubmitOutcome::AlreadyInFlight) => {
                warn!(job_id = job_id, scheduled = %scheduled, "Skipped firing, previous run still active");
            }
            Err(e) => {
                error!(job_id = job_id, "Failed to queue job: {}", e);
            }
        }

        let next = {
            let mut slots = self.slots.lock().await;
            match slots.get_mut(&job_id) {
                Some(slot) if slot.generation == generation && slot.is_firing() => {
                    Some(slot.arm(Utc::now()))
                }
                // retired or replaced while the firing was handed off
                _ => None,
            }
        };

        let Some(next) = next else {
            debug!(job_id = job_id, "Slot changed during firing, not re-arming");
            return;
        };

        if let Err(e) = queries::record_job_fired(&self.pool, job_id, scheduled, next).await {
            warn!(job_id = job_id, "Failed to persist fire time: {}", e);
        }

        debug!(job_id = job_id, next_run = ?next, "Re-armed job after firing");
    }
}
