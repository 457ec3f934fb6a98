//! Cooperative interval scheduler for maintenance work.
//!
//! Jobs run one after another on the control loop, each to completion.
//! After a run, the next due time is measured from when the run was
//! triggered, not from when it was originally due, so a late tick never
//! causes catch-up runs.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Logged; the job runs again on its next interval.
    #[error(transparent)]
    Failed(anyhow::Error),

    /// Stops the scheduler loop and surfaces to the caller.
    #[error("fatal: {0}")]
    Fatal(anyhow::Error),
}

#[async_trait]
pub trait ScheduledTask: Send + Sync {
    async fn run(&self) -> Result<(), TaskError>;
}

struct Job {
    name: String,
    interval: Duration,
    next_due: Instant,
    task: Arc<dyn ScheduledTask>,
}

#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<Job>,
}

pub struct JobBuilder<'a> {
    scheduler: &'a mut Scheduler,
    interval: Duration,
}

impl JobBuilder<'_> {
    /// Register `task`. Its first run is one interval from now.
    pub fn run(self, name: &str, task: Arc<dyn ScheduledTask>) {
        info!("Scheduled '{}' every {:?}", name, self.interval);
        self.scheduler.jobs.push(Job {
            name: name.to_string(),
            interval: self.interval,
            next_due: Instant::now() + self.interval,
            task,
        });
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn every(&mut self, interval: Duration) -> JobBuilder<'_> {
        JobBuilder {
            scheduler: self,
            interval,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn next_due(&self, name: &str) -> Option<Instant> {
        self.jobs
            .iter()
            .find(|job| job.name == name)
            .map(|job| job.next_due)
    }

    pub async fn run_pending(&mut self) -> Result<usize, TaskError> {
        self.run_pending_at(Instant::now()).await
    }

    /// Run every job due at `now`, each at most once. Returns how many ran.
    pub async fn run_pending_at(&mut self, now: Instant) -> Result<usize, TaskError> {
        let mut ran = 0;
        for job in self.jobs.iter_mut().filter(|job| job.next_due <= now) {
            job.next_due = now + job.interval;
            ran += 1;
            match job.task.run().await {
                Ok(()) => {}
                Err(TaskError::Failed(e)) => {
                    error!(job = %job.name, "Scheduled task failed: {:#}", e);
                }
                Err(fatal @ TaskError::Fatal(_)) => {
                    error!(job = %job.name, "Scheduled task hit a fatal error: {}", fatal);
                    return Err(fatal);
                }
            }
        }
        Ok(ran)
    }

    /// Poll for due jobs every `tick` until `cancel` fires. A job that is
    /// already running is allowed to finish.
    pub async fn run_until(
        &mut self,
        tick: Duration,
        cancel: CancellationToken,
    ) -> Result<(), TaskError> {
        while !cancel.is_cancelled() {
            self.run_pending().await?;
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(tick) => {}
            }
        }
        info!("Scheduler stopped");
        Ok(())
    }
}
