//! Maintenance sweeps: disk cleanup and health resets on flagged workers,
//! parking idle controlled workers and tearing down dead or long-stopped ones.
//!
//! Every action runs under a maintenance reservation so the scheduler can
//! never hand the worker a job mid-action, and leaves an audit record.

use std::sync::Arc;

use buildfleet_config::MaintenanceSettings;
use buildfleet_core::control::WorkerControl;
use buildfleet_core::id::{WorkerId, WorkerKind};
use buildfleet_core::maintenance::{MaintenanceKind, MaintenanceOperation};
use buildfleet_core::worker::{Reservation, Worker, WorkerStatus};
use buildfleet_db::Store;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::pool::WorkerPool;
use crate::{Collaborators, SchedulerError, SchedulerResult};

const SWEEP: &str = "maintenance-sweep";

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub cleaned: usize,
    pub reset: usize,
    pub recycled: usize,
    pub torn_down: usize,
    pub failed: usize,
}

pub struct MaintenanceCoordinator {
    store: Arc<dyn Store>,
    pool: Arc<WorkerPool>,
    control: Arc<dyn WorkerControl>,
    settings: MaintenanceSettings,
}

fn idle_for(worker: &Worker, now: DateTime<Utc>, limit: Option<std::time::Duration>) -> bool {
    let Some(limit) = limit.and_then(|l| Duration::from_std(l).ok()) else {
        return false;
    };
    worker.idle_since.is_some_and(|since| now - since > limit)
}

impl MaintenanceCoordinator {
    pub fn new(collab: &Collaborators, pool: Arc<WorkerPool>, settings: MaintenanceSettings) -> Self {
        Self {
            store: collab.store.clone(),
            pool,
            control: collab.control.clone(),
            settings,
        }
    }

    /// Flag a worker for a health reset. The reset happens on the next sweep;
    /// the returned operation is finished then.
    pub async fn request_maintenance(
        &self,
        id: WorkerId,
        requested_by: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<MaintenanceOperation> {
        let worker = self.pool.get_worker(id).await?;
        if matches!(worker.status, WorkerStatus::Terminated | WorkerStatus::Errored) {
            return Err(SchedulerError::InvalidState(format!(
                "worker {id} is {}",
                worker.status
            )));
        }
        if let Some(open) = self.open_reset(id).await? {
            return Ok(open);
        }

        self.pool.flag_maintenance(id).await?;
        let op = MaintenanceOperation::new(
            MaintenanceKind::HealthReset,
            Some(id),
            "health reset requested",
            requested_by,
            now,
        );
        self.store.insert_operation(&op).await?;
        info!(worker = %id, %requested_by, "Maintenance requested");
        Ok(op)
    }

    /// A requested reset that has not been attempted yet. Every attempt
    /// finishes its record, so a retry after failure gets a fresh one.
    async fn open_reset(&self, id: WorkerId) -> SchedulerResult<Option<MaintenanceOperation>> {
        Ok(self
            .store
            .list_operations(Some(id), 20)
            .await?
            .into_iter()
            .find(|op| op.kind == MaintenanceKind::HealthReset && !op.is_finished()))
    }

    pub async fn list_operations(
        &self,
        worker: Option<WorkerId>,
        limit: i64,
    ) -> SchedulerResult<Vec<MaintenanceOperation>> {
        Ok(self.store.list_operations(worker, limit).await?)
    }

    /// One pass over the pool.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SchedulerResult<SweepReport> {
        let mut report = SweepReport::default();

        for worker in self.pool.list_workers().await? {
            let result = if worker.status == WorkerStatus::Errored
                && worker.kind() == WorkerKind::Controlled
            {
                self.teardown(&worker, "worker errored", now, &mut report)
                    .await
            } else if !worker.status.is_schedulable() || !worker.reservation.is_free() {
                continue;
            } else if worker.cleanup_queued || worker.wants_maintenance {
                self.service(&worker, now, &mut report).await
            } else if worker.kind() == WorkerKind::Controlled {
                self.retire_idle(&worker, now, &mut report).await
            } else {
                continue;
            };

            if let Err(e) = result {
                if e.is_contention() {
                    debug!(worker = %worker.id, "Worker busy, skipping maintenance");
                } else {
                    warn!(worker = %worker.id, error = %e, "Maintenance failed");
                    report.failed += 1;
                }
            }
        }

        if report != SweepReport::default() {
            info!(?report, "Maintenance sweep complete");
        }
        Ok(report)
    }

    /// Run a remote action on the worker, bounded by the action timeout.
    async fn run_action(&self, worker: &Worker, kind: MaintenanceKind) -> bool {
        match tokio::time::timeout(self.settings.action_timeout, self.control.maintain(worker, kind))
            .await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(worker = %worker.id, action = kind.as_str(), error = %e, "Maintenance action failed");
                false
            }
            Err(_) => {
                warn!(worker = %worker.id, action = kind.as_str(), "Maintenance action timed out");
                false
            }
        }
    }

    async fn record(
        &self,
        kind: MaintenanceKind,
        worker: WorkerId,
        description: String,
        now: DateTime<Utc>,
    ) -> SchedulerResult<MaintenanceOperation> {
        let op = MaintenanceOperation::new(kind, Some(worker), description, SWEEP, now);
        self.store.insert_operation(&op).await?;
        Ok(op)
    }

    async fn finish(&self, op: &MaintenanceOperation, ok: bool) {
        if let Err(e) = self.store.finish_operation(op.id, !ok, Utc::now()).await {
            warn!(operation = %op.id, error = %e, "Failed to finish maintenance record");
        }
    }

    /// Disk cleanup and/or health reset on a flagged worker.
    async fn service(
        &self,
        worker: &Worker,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> SchedulerResult<()> {
        let reserved = self.pool.reserve_for_maintenance(worker).await?;
        let reserved = if reserved.status == WorkerStatus::Idle {
            match self.pool.wake(&reserved, now).await {
                Ok(woken) => woken,
                Err(e) => {
                    self.pool.finish_maintenance(worker.id, false, false, now).await?;
                    return Err(e);
                }
            }
        } else {
            reserved
        };

        let mut cleaned = false;
        if reserved.cleanup_queued {
            let description = match reserved.disk_usage {
                Some(disk) => format!("disk cleanup at {:.0}% used", disk.fraction() * 100.0),
                None => "disk cleanup".to_string(),
            };
            let op = self
                .record(MaintenanceKind::Cleanup, reserved.id, description, now)
                .await?;
            cleaned = self.run_action(&reserved, MaintenanceKind::Cleanup).await;
            self.finish(&op, cleaned).await;
            if cleaned {
                report.cleaned += 1;
            } else {
                report.failed += 1;
            }
        }

        let mut reset = false;
        if reserved.wants_maintenance {
            let op = match self.open_reset(reserved.id).await? {
                Some(op) => op,
                None => {
                    let description = format!(
                        "health reset after {} jobs",
                        reserved.jobs_since_maintenance
                    );
                    self.record(MaintenanceKind::HealthReset, reserved.id, description, now)
                        .await?
                }
            };
            reset = self.run_action(&reserved, MaintenanceKind::HealthReset).await;
            self.finish(&op, reset).await;
            if reset {
                report.reset += 1;
            } else {
                // The flag stays set, so the next sweep retries.
                report.failed += 1;
            }
        }

        self.pool
            .finish_maintenance(reserved.id, cleaned, reset, Utc::now())
            .await?;
        Ok(())
    }

    /// Park controlled workers idle past the stop threshold and tear down
    /// ones stopped past the teardown threshold.
    async fn retire_idle(
        &self,
        worker: &Worker,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> SchedulerResult<()> {
        if worker.status == WorkerStatus::Idle && idle_for(worker, now, self.settings.idle_teardown_after)
        {
            let reserved = self.pool.reserve_for_maintenance(worker).await?;
            return self
                .teardown(&reserved, "stopped past the idle teardown threshold", now, report)
                .await;
        }

        if worker.status == WorkerStatus::Running && idle_for(worker, now, self.settings.idle_stop_after)
        {
            let reserved = self.pool.reserve_for_maintenance(worker).await?;
            let op = self
                .record(
                    MaintenanceKind::Recycle,
                    worker.id,
                    "stop idle instance".to_string(),
                    now,
                )
                .await?;
            let parked = self.pool.park(&reserved, now).await;
            self.finish(&op, parked.is_ok()).await;
            self.pool.finish_maintenance(worker.id, false, false, now).await?;
            parked?;
            report.recycled += 1;
        }
        Ok(())
    }

    async fn teardown(
        &self,
        worker: &Worker,
        reason: &str,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> SchedulerResult<()> {
        let op = self
            .record(MaintenanceKind::Teardown, worker.id, reason.to_string(), now)
            .await?;
        let result = self.pool.decommission(worker.id, now).await;
        self.finish(&op, result.is_ok()).await;
        if result.is_err() && worker.reservation == Reservation::Maintenance {
            self.pool.finish_maintenance(worker.id, false, false, now).await?;
        }
        result?;
        info!(worker = %worker.id, %reason, "Tore down controlled worker");
        report.torn_down += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, instance_spec};
    use buildfleet_core::id::JobKey;

    async fn running_controlled(h: &Harness) -> Worker {
        let mut w = h
            .store
            .insert_controlled(&instance_spec(), Utc::now())
            .await
            .unwrap();
        w.status = WorkerStatus::Running;
        w.running_since = Some(Utc::now());
        w.last_seen_at = Some(Utc::now());
        w.idle_since = Some(Utc::now());
        let id = w.id.id;
        if let Some(c) = w.controlled_mut() {
            c.instance_handle = Some(format!("i-{id}"));
            c.fully_provisioned = true;
        }
        h.store.update_worker(&w).await.unwrap()
    }

    #[tokio::test]
    async fn test_requested_reset_runs_and_finishes_record() {
        let h = Harness::new();
        let worker = h.external("mac-mini", 5).await;

        let op = h
            .maintenance
            .request_maintenance(worker.id, "alice", Utc::now())
            .await
            .unwrap();
        assert!(!op.is_finished());
        assert!(!h.store.get_worker(worker.id).await.unwrap().is_eligible());

        // Asking again while pending returns the same request.
        let again = h
            .maintenance
            .request_maintenance(worker.id, "bob", Utc::now())
            .await
            .unwrap();
        assert_eq!(again.id, op.id);

        let report = h.maintenance.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.reset, 1);
        assert_eq!(
            h.control.maintained(),
            vec![(worker.id, MaintenanceKind::HealthReset)]
        );

        let stored = h.store.get_worker(worker.id).await.unwrap();
        assert!(stored.is_eligible());
        assert_eq!(stored.jobs_since_maintenance, 0);
        assert!(stored.last_maintenance_at.is_some());

        let ops = h.maintenance.list_operations(Some(worker.id), 10).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert!(ops[0].is_finished());
        assert!(!ops[0].failed);
        assert_eq!(ops[0].triggered_by, "alice");
    }

    #[tokio::test]
    async fn test_failed_reset_keeps_worker_out_of_rotation() {
        let h = Harness::new();
        let worker = h.external("mac-mini", 5).await;
        h.maintenance
            .request_maintenance(worker.id, "alice", Utc::now())
            .await
            .unwrap();
        h.control.set_maintenance_fails(true);

        let first = Utc::now();
        let report = h.maintenance.sweep(first).await.unwrap();
        assert_eq!(report.failed, 1);
        let stored = h.store.get_worker(worker.id).await.unwrap();
        assert!(stored.reservation.is_free());
        assert!(stored.wants_maintenance);
        assert!(!stored.is_eligible());

        let ops = h.maintenance.list_operations(Some(worker.id), 10).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert!(ops[0].failed);
        assert!(ops[0].is_finished());

        // The retry is recorded separately.
        h.control.set_maintenance_fails(false);
        let report = h
            .maintenance
            .sweep(first + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(report.reset, 1);
        let ops = h.maintenance.list_operations(Some(worker.id), 10).await.unwrap();
        assert_eq!(ops.len(), 2);
        assert!(ops[0].is_finished());
        assert!(!ops[0].failed);
        assert!(ops[1].failed);
        assert!(h.store.get_worker(worker.id).await.unwrap().is_eligible());
    }

    #[tokio::test]
    async fn test_cleanup_after_full_disk() {
        let h = Harness::new();
        let worker = running_controlled(&h).await;
        h.control.set_disk(worker.id, 95, 100);
        h.scheduler.health_pass(Utc::now()).await.unwrap();
        assert!(h.store.get_worker(worker.id).await.unwrap().cleanup_queued);

        let report = h.maintenance.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.cleaned, 1);
        let stored = h.store.get_worker(worker.id).await.unwrap();
        assert!(!stored.cleanup_queued);
        assert!(stored.is_eligible());

        let ops = h.maintenance.list_operations(Some(worker.id), 10).await.unwrap();
        assert_eq!(ops[0].kind, MaintenanceKind::Cleanup);
        assert!(ops[0].description.contains("95%"));
    }

    #[tokio::test]
    async fn test_busy_worker_is_not_touched() {
        let h = Harness::new();
        let worker = h.external("mac-mini", 5).await;
        h.pool.flag_maintenance(worker.id).await.unwrap();
        let mut busy = h.store.get_worker(worker.id).await.unwrap();
        busy.reservation = Reservation::Job(JobKey::new(1, 1, 1));
        h.store.update_worker(&busy).await.unwrap();

        let report = h.maintenance.sweep(Utc::now()).await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert!(h.control.maintained().is_empty());
    }

    #[tokio::test]
    async fn test_idle_controlled_worker_is_parked_then_torn_down() {
        let h = Harness::with_settings(|c| {
            c.maintenance.idle_stop_after = Some(std::time::Duration::from_secs(600));
            c.maintenance.idle_teardown_after = Some(std::time::Duration::from_secs(3600));
        });
        let worker = running_controlled(&h).await;
        let external = h.external("mac-mini", 5).await;

        let later = Utc::now() + Duration::minutes(20);
        let report = h.maintenance.sweep(later).await.unwrap();
        assert_eq!(report.recycled, 1);
        let parked = h.store.get_worker(worker.id).await.unwrap();
        assert_eq!(parked.status, WorkerStatus::Idle);
        assert!(parked.reservation.is_free());
        assert_eq!(h.cloud.stopped().await, vec![format!("i-{}", worker.id.id)]);
        assert_eq!(
            h.store.get_worker(external.id).await.unwrap().status,
            WorkerStatus::Running
        );

        let much_later = Utc::now() + Duration::hours(2);
        let report = h.maintenance.sweep(much_later).await.unwrap();
        assert_eq!(report.torn_down, 1);
        let gone = h.store.get_worker(worker.id).await.unwrap();
        assert_eq!(gone.status, WorkerStatus::Terminated);
        assert_eq!(h.cloud.destroyed().await.len(), 1);
    }

    #[tokio::test]
    async fn test_errored_worker_is_torn_down() {
        let h = Harness::new();
        let mut worker = h
            .store
            .insert_controlled(&instance_spec(), Utc::now())
            .await
            .unwrap();
        worker.status = WorkerStatus::Errored;
        h.store.update_worker(&worker).await.unwrap();

        let report = h.maintenance.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.torn_down, 1);
        let stored = h.store.get_worker(worker.id).await.unwrap();
        assert_eq!(stored.status, WorkerStatus::Terminated);
        let ops = h.maintenance.list_operations(None, 10).await.unwrap();
        assert_eq!(ops[0].kind, MaintenanceKind::Teardown);
        assert!(ops[0].is_finished());
    }

    #[tokio::test]
    async fn test_request_for_terminated_worker_is_rejected() {
        let h = Harness::new();
        let mut worker = running_controlled(&h).await;
        worker.status = WorkerStatus::Terminated;
        h.store.update_worker(&worker).await.unwrap();

        let err = h
            .maintenance
            .request_maintenance(worker.id, "alice", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidState(_)));
    }
}
