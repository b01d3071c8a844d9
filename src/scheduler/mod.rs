//! Cron-driven job dispatch.
//!
//! Each enabled spec maps to one recurring job. A job never overlaps itself:
//! a tick that lands while the prior invocation is still running is dropped,
//! not queued. A global semaphore bounds the total number of in-flight jobs;
//! acquisition failure also drops the tick.

use core::time::Duration;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::Local;
use tokio::sync::{OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{config::Config, spec::BackupSpec, webhook::Notifier};

mod run_job;
mod schedule;

pub use schedule::{normalize_cron, ScheduleError, ScheduleKind};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

struct Job {
    cron_source: String,
    spec: Arc<Mutex<BackupSpec>>,
    running: Arc<tokio::sync::Mutex<()>>,
    cancel: CancellationToken,
}

/// Maps enabled specs to recurring jobs and runs the backup pipeline.
pub struct Scheduler {
    jobs: Mutex<HashMap<String, Job>>,
    semaphore: Arc<Semaphore>,
    config: Arc<Config>,
    notifier: Arc<Notifier>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Scheduler {
    /// Create a scheduler with the configured concurrency ceiling.
    pub fn new(config: Arc<Config>, notifier: Arc<Notifier>) -> Arc<Self> {
        info!(
            "Scheduler started (concurrency limit {}, job timeout {:?})",
            config.concurrent_backup_limit, config.backup_timeout,
        );

        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(config.concurrent_backup_limit)),
            config,
            notifier,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Schedule a job for a spec, or update the existing one.
    ///
    /// Idempotent for an unchanged cron: the stored spec is swapped in place
    /// so non-cron changes (connection, webhook, retention) take effect on
    /// the next tick. A changed cron cancels and reschedules the job.
    pub fn add_or_update(
        self: &Arc<Self>,
        container_id: &str,
        spec: BackupSpec,
    ) -> Result<(), ScheduleError> {
        let mut jobs = self.jobs.lock().expect("job table lock is never poisoned");

        if let Some(job) = jobs.get(container_id) {
            if job.cron_source == spec.cron {
                debug!(
                    "Cron unchanged for {container_id}, updating spec details in place"
                );
                *job.spec.lock().expect("job spec lock is never poisoned") = spec;
                return Ok(());
            }

            info!(
                "Cron changed for {container_id} ('{}' -> '{}'), re-scheduling",
                job.cron_source, spec.cron,
            );
            job.cancel.cancel();
            jobs.remove(container_id);
        }

        let schedule = ScheduleKind::parse(&spec.cron)?;

        let job = Job {
            cron_source: spec.cron.clone(),
            spec: Arc::new(Mutex::new(spec.clone())),
            running: Arc::new(tokio::sync::Mutex::new(())),
            cancel: self.cancel.child_token(),
        };

        info!(
            "Scheduled backup job for {} ({container_id}): {} every '{}'",
            spec.container_name, spec.kind, spec.cron,
        );

        self.tracker.spawn(Arc::clone(self).tick_loop(
            schedule,
            Arc::clone(&job.spec),
            Arc::clone(&job.running),
            job.cancel.clone(),
        ));

        jobs.insert(container_id.to_owned(), job);
        Ok(())
    }

    /// Cancel and drop the job for a container, if present.
    pub fn remove(&self, container_id: &str) {
        let mut jobs = self.jobs.lock().expect("job table lock is never poisoned");

        if let Some(job) = jobs.remove(container_id) {
            job.cancel.cancel();
            info!("Removed backup job for {container_id}");
        }
    }

    /// The container ids with scheduled jobs.
    pub fn job_ids(&self) -> Vec<String> {
        self.jobs
            .lock()
            .expect("job table lock is never poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// The number of scheduled jobs.
    pub fn active_jobs(&self) -> usize {
        self.jobs
            .lock()
            .expect("job table lock is never poisoned")
            .len()
    }

    /// Stop ticking and wait for in-flight jobs, up to a deadline.
    pub async fn stop(&self) {
        info!("Stopping scheduler...");
        self.cancel.cancel();
        self.tracker.close();

        if tokio::time::timeout(STOP_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("Scheduler stop timed out after {STOP_TIMEOUT:?}; some jobs may not have finished");
        } else {
            info!("Scheduler stopped");
        }
    }

    async fn tick_loop(
        self: Arc<Self>,
        schedule: ScheduleKind,
        spec: Arc<Mutex<BackupSpec>>,
        running: Arc<tokio::sync::Mutex<()>>,
        cancel: CancellationToken,
    ) {
        loop {
            let now = Local::now();
            let Some(next) = schedule.next_after(now) else {
                warn!("Schedule has no upcoming fire times, stopping job");
                return;
            };

            let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let snapshot = spec.lock().expect("job spec lock is never poisoned").clone();

            let Some((running_guard, permit)) = claim(&running, &self.semaphore) else {
                continue;
            };

            self.tracker.spawn(run_job::run_job(
                Arc::clone(&self.config),
                Arc::clone(&self.notifier),
                snapshot,
                cancel.child_token(),
                running_guard,
                permit,
            ));
        }
    }
}

/// Try to claim the right to run a job: the per-spec running slot plus a
/// global semaphore permit. Returns `None`, logging why, when the tick must
/// be dropped.
fn claim(
    running: &Arc<tokio::sync::Mutex<()>>,
    semaphore: &Arc<Semaphore>,
) -> Option<(OwnedMutexGuard<()>, OwnedSemaphorePermit)> {
    let Ok(running_guard) = Arc::clone(running).try_lock_owned() else {
        warn!("Skipping backup tick: previous invocation still running");
        return None;
    };

    let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
        warn!("Skipping backup tick: concurrency limit reached");
        return None;
    };

    Some((running_guard, permit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_skips_while_running() {
        let running = Arc::new(tokio::sync::Mutex::new(()));
        let semaphore = Arc::new(Semaphore::new(4));

        let first = claim(&running, &semaphore);
        assert!(first.is_some());

        // The prior invocation still holds the running slot.
        assert!(claim(&running, &semaphore).is_none());

        drop(first);
        assert!(claim(&running, &semaphore).is_some());
    }

    #[tokio::test]
    async fn claim_respects_concurrency_limit() {
        let semaphore = Arc::new(Semaphore::new(2));

        let slots: Vec<_> = (0..4)
            .map(|_| {
                let running = Arc::new(tokio::sync::Mutex::new(()));
                claim(&running, &semaphore)
            })
            .collect();

        let claimed = slots.iter().filter(|slot| slot.is_some()).count();
        assert_eq!(claimed, 2);

        drop(slots);
        let running = Arc::new(tokio::sync::Mutex::new(()));
        assert!(claim(&running, &semaphore).is_some());
    }
}
