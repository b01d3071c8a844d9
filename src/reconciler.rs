//! Registry to scheduler drift correction.
//!
//! The reconciler is the sole steady-state path from discovered specs to
//! scheduled jobs: a periodic pass pushes every enabled spec into the
//! scheduler (idempotent for unchanged crons) and drops jobs whose container
//! has disappeared or been disabled, repairing any drift from missed events.

use std::sync::Arc;

use tracing::{debug, error};

use crate::{discovery::Watcher, scheduler::Scheduler};

/// Run one reconcile pass.
pub fn reconcile(watcher: &Watcher, scheduler: &Arc<Scheduler>) {
    let registry = watcher.registry_snapshot();

    debug!(
        "Reconciling {} discovered specs against {} scheduled jobs",
        registry.len(),
        scheduler.active_jobs(),
    );

    for (container_id, spec) in &registry {
        if spec.enabled {
            if let Err(schedule_error) = scheduler.add_or_update(container_id, spec.clone()) {
                error!("Failed to schedule job for {container_id}: {schedule_error}");
            }
        } else {
            scheduler.remove(container_id);
        }
    }

    // Jobs whose container has left the registry are drift too.
    for container_id in scheduler.job_ids() {
        if !registry.contains_key(&container_id) {
            scheduler.remove(&container_id);
        }
    }
}
