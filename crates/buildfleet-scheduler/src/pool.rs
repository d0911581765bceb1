//! Worker pool manager.
//!
//! Every mutation is a compare-and-swap on the worker's version stamp.
//! Reservation attempts fail fast on conflict; bookkeeping updates (release,
//! health, flags) re-read and retry.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use buildfleet_config::{PoolSettings, PriorityOrder};
use buildfleet_core::cloud::{CloudProvisioner, InstanceState};
use buildfleet_core::control::WorkerControl;
use buildfleet_core::event::{Event, Notifier};
use buildfleet_core::id::{JobKey, WorkerId, WorkerKind};
use buildfleet_core::job::Job;
use buildfleet_core::worker::{
    ExternalWorkerSpec, HealthSnapshot, InstanceSpec, Reservation, Worker, WorkerDetails,
    WorkerStatus,
};
use buildfleet_db::Store;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::{CAS_RETRIES, Collaborators, SchedulerError, SchedulerResult};

/// Constraints a job places on the worker that runs it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobRequirements {
    /// Restrict to one pool. `None` accepts either.
    pub pool: Option<WorkerKind>,
}

impl JobRequirements {
    pub fn for_job(job: &Job) -> Self {
        Self { pool: job.pool }
    }

    pub fn admits(&self, worker: &Worker) -> bool {
        self.pool.is_none_or(|kind| kind == worker.kind())
    }
}

/// Outcome of applying one health snapshot.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub worker: Worker,
    /// Job still held by an unreachable worker. Reported on every snapshot
    /// until the reservation is cleared.
    pub escalate: Option<JobKey>,
}

pub struct WorkerPool {
    store: Arc<dyn Store>,
    control: Arc<dyn WorkerControl>,
    cloud: Arc<dyn CloudProvisioner>,
    notifier: Arc<dyn Notifier>,
    settings: PoolSettings,
    instance: InstanceSpec,
    order: PriorityOrder,
    /// Millisecond timestamp of the last provisioning failure.
    last_provision_failure: AtomicI64,
}

const NO_FAILURE: i64 = i64::MIN;

fn to_chrono(d: std::time::Duration) -> Duration {
    Duration::from_std(d).unwrap_or_else(|_| Duration::days(36_500))
}

impl WorkerPool {
    pub fn new(
        collab: &Collaborators,
        settings: PoolSettings,
        instance: InstanceSpec,
        order: PriorityOrder,
    ) -> Self {
        Self {
            store: collab.store.clone(),
            control: collab.control.clone(),
            cloud: collab.cloud.clone(),
            notifier: collab.notifier.clone(),
            settings,
            instance,
            order,
            last_provision_failure: AtomicI64::new(NO_FAILURE),
        }
    }

    /// Run a provider call under the cloud timeout.
    async fn cloud_call<T, F>(&self, what: &str, call: F) -> SchedulerResult<T>
    where
        F: Future<Output = buildfleet_core::Result<T>>,
    {
        match tokio::time::timeout(self.settings.cloud_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SchedulerError::Timeout(format!(
                "cloud {what} via {} after {:?}",
                self.cloud.name(),
                self.settings.cloud_timeout
            ))),
        }
    }

    fn announce(&self, worker: &Worker) {
        self.notifier.notify(Event::WorkerChanged {
            worker: worker.id,
            status: worker.status,
            reserved: !worker.reservation.is_free(),
        });
    }

    /// Read-modify-write with retry. `apply` returns `false` to leave the
    /// worker untouched, in which case the current record is returned.
    async fn modify<F>(&self, id: WorkerId, mut apply: F) -> SchedulerResult<Worker>
    where
        F: FnMut(&mut Worker) -> bool + Send,
    {
        for _ in 0..CAS_RETRIES {
            let mut worker = self.store.get_worker(id).await?;
            if !apply(&mut worker) {
                return Ok(worker);
            }
            match self.store.update_worker(&worker).await {
                Ok(updated) => {
                    self.announce(&updated);
                    return Ok(updated);
                }
                Err(e) if e.is_conflict() => {
                    debug!(worker = %id, "Worker changed concurrently, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SchedulerError::Contention(format!(
            "worker {id} kept changing"
        )))
    }

    /// Eligible workers for `requirements`, best first: preferred priority,
    /// then warm before cold.
    pub async fn list_eligible(
        &self,
        requirements: &JobRequirements,
    ) -> SchedulerResult<Vec<Worker>> {
        let mut workers = self.store.list_free_workers().await?;
        workers.retain(|w| w.is_eligible() && requirements.admits(w));
        workers.sort_by_key(|w| (self.order.rank(w.priority), !w.is_warm(), w.id));
        Ok(workers)
    }

    /// Reserve `candidate` for `job`. A single CAS against the candidate's
    /// version; on conflict nothing is applied.
    pub async fn try_reserve(&self, candidate: &Worker, job: JobKey) -> SchedulerResult<Worker> {
        self.reserve(candidate, Reservation::Job(job)).await
    }

    /// Reserve `candidate` for a maintenance action.
    pub async fn reserve_for_maintenance(&self, candidate: &Worker) -> SchedulerResult<Worker> {
        if !candidate.status.is_schedulable() || !candidate.reservation.is_free() {
            return Err(SchedulerError::Contention(format!(
                "worker {} is busy",
                candidate.id
            )));
        }
        let mut worker = candidate.clone();
        worker.reservation = Reservation::Maintenance;
        let updated = self.store.update_worker(&worker).await?;
        self.announce(&updated);
        Ok(updated)
    }

    async fn reserve(&self, candidate: &Worker, holder: Reservation) -> SchedulerResult<Worker> {
        if !candidate.is_eligible() {
            return Err(SchedulerError::Contention(format!(
                "worker {} is not eligible",
                candidate.id
            )));
        }
        let mut worker = candidate.clone();
        worker.reservation = holder;
        let updated = self.store.update_worker(&worker).await?;
        debug!(worker = %updated.id, ?holder, "Reserved worker");
        self.announce(&updated);
        Ok(updated)
    }

    /// Clear `holder`'s reservation after the job ran. Releasing a
    /// reservation the worker no longer carries is a no-op.
    pub async fn release(
        &self,
        id: WorkerId,
        holder: Reservation,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Worker> {
        self.free(id, holder, now, true).await
    }

    /// Clear a reservation whose job never reached the worker. The job does
    /// not count towards the maintenance threshold.
    pub async fn release_unused(
        &self,
        id: WorkerId,
        holder: Reservation,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Worker> {
        self.free(id, holder, now, false).await
    }

    async fn free(
        &self,
        id: WorkerId,
        holder: Reservation,
        now: DateTime<Utc>,
        count_job: bool,
    ) -> SchedulerResult<Worker> {
        let threshold = self.settings.maintenance_every_jobs;
        self.modify(id, |worker| {
            if worker.reservation != holder {
                return false;
            }
            worker.reservation = Reservation::Free;
            worker.idle_since = Some(now);
            if count_job && matches!(holder, Reservation::Job(_)) {
                worker.jobs_since_maintenance += 1;
                if threshold > 0 && worker.jobs_since_maintenance >= threshold {
                    worker.wants_maintenance = true;
                }
            }
            true
        })
        .await
    }

    /// Apply a health snapshot.
    pub async fn report_health(
        &self,
        id: WorkerId,
        snapshot: HealthSnapshot,
        now: DateTime<Utc>,
    ) -> SchedulerResult<HealthReport> {
        let unreachable_after = to_chrono(self.settings.unreachable_after);
        let disk_threshold = self.settings.disk_cleanup_threshold;
        let mut became_unreachable = false;

        let worker = self
            .modify(id, |worker| {
                became_unreachable = false;
                if matches!(
                    worker.status,
                    WorkerStatus::Terminated | WorkerStatus::Errored | WorkerStatus::Provisioning
                ) {
                    return false;
                }
                worker.last_checked_at = Some(now);

                if snapshot.reachable {
                    worker.last_seen_at = Some(now);
                    if snapshot.disk_usage.is_some() {
                        worker.disk_usage = snapshot.disk_usage;
                    }
                    if worker.status == WorkerStatus::Unreachable {
                        worker.status = WorkerStatus::Running;
                        worker.start_clock(now);
                    }
                    let over = worker
                        .disk_usage
                        .is_some_and(|d| d.fraction() > disk_threshold);
                    if over && worker.kind() == WorkerKind::Controlled {
                        worker.cleanup_queued = true;
                    }
                    return true;
                }

                let overdue = worker
                    .last_seen_at
                    .is_some_and(|seen| now - seen > unreachable_after);
                if overdue && worker.status != WorkerStatus::Unreachable {
                    worker.status = WorkerStatus::Unreachable;
                    worker.stop_clock(now);
                    became_unreachable = true;
                }
                true
            })
            .await?;

        let escalate = match worker.reservation {
            Reservation::Job(job) if worker.status == WorkerStatus::Unreachable => Some(job),
            _ => None,
        };
        if became_unreachable {
            warn!(worker = %worker.id, job = ?escalate, "Worker became unreachable");
        }
        Ok(HealthReport { worker, escalate })
    }

    /// Probe every running or unreachable worker concurrently. Returns jobs
    /// held by unreachable workers, including ones reported on earlier
    /// passes whose reservation was never cleared.
    pub async fn probe_all(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<(WorkerId, JobKey)>> {
        let workers: Vec<Worker> = self
            .store
            .list_workers()
            .await?
            .into_iter()
            .filter(|w| matches!(w.status, WorkerStatus::Running | WorkerStatus::Unreachable))
            .collect();

        let probes = workers.iter().map(|worker| async move {
            let snapshot =
                match tokio::time::timeout(self.settings.probe_timeout, self.control.probe(worker))
                    .await
                {
                    Ok(Ok(snapshot)) => snapshot,
                    Ok(Err(e)) => {
                        debug!(worker = %worker.id, error = %e, "Health probe failed");
                        HealthSnapshot::unreachable()
                    }
                    Err(_) => {
                        debug!(worker = %worker.id, "Health probe timed out");
                        HealthSnapshot::unreachable()
                    }
                };
            (worker.id, self.report_health(worker.id, snapshot, now).await)
        });

        let mut escalations = Vec::new();
        for (id, result) in join_all(probes).await {
            match result {
                Ok(HealthReport {
                    escalate: Some(job),
                    ..
                }) => escalations.push((id, job)),
                Ok(_) => {}
                Err(e) => warn!(worker = %id, error = %e, "Failed to record health"),
            }
        }
        Ok(escalations)
    }

    /// Number of controlled workers counting against the ceiling, and how
    /// many of those are still provisioning.
    pub async fn controlled_census(&self) -> SchedulerResult<(usize, usize)> {
        let workers = self.store.list_workers().await?;
        let controlled = workers
            .iter()
            .filter(|w| w.kind() == WorkerKind::Controlled && w.is_active());
        let (mut active, mut provisioning) = (0, 0);
        for w in controlled {
            active += 1;
            if w.status == WorkerStatus::Provisioning {
                provisioning += 1;
            }
        }
        Ok((active, provisioning))
    }

    /// Whether a recent provisioning failure still holds back new requests.
    pub fn provisioning_backoff(&self, now: DateTime<Utc>) -> bool {
        let last = self.last_provision_failure.load(Ordering::Relaxed);
        if last == NO_FAILURE {
            return false;
        }
        let backoff = to_chrono(self.settings.provision_backoff).num_milliseconds();
        now.timestamp_millis().saturating_sub(last) < backoff
    }

    fn record_provision_failure(&self, now: DateTime<Utc>) {
        self.last_provision_failure
            .fetch_max(now.timestamp_millis(), Ordering::Relaxed);
    }

    /// Request a new controlled worker. Only the `Provisioning` row is
    /// written here, which keeps the ceiling honoured across passes. The
    /// cloud create is issued by `poll_provisioning`.
    pub async fn provision(&self, now: DateTime<Utc>) -> SchedulerResult<Worker> {
        let placeholder = self.store.insert_controlled(&self.instance, now).await?;
        info!(worker = %placeholder.id, provider = self.cloud.name(), "Requested controlled worker");
        self.announce(&placeholder);
        Ok(placeholder)
    }

    /// Ask the provider for the instance backing a handle-less placeholder.
    async fn request_instance(
        &self,
        worker: &Worker,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Worker> {
        let handle = match self
            .cloud_call("create", self.cloud.create(&self.instance))
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(worker = %worker.id, error = %e, "Cloud create request failed");
                self.record_provision_failure(now);
                return self.mark_errored(worker.id).await;
            }
        };
        info!(worker = %worker.id, %handle, provider = self.cloud.name(), "Provisioning controlled worker");

        let updated = self
            .modify(worker.id, |w| {
                if w.status != WorkerStatus::Provisioning {
                    return false;
                }
                match w.controlled_mut() {
                    Some(c) if c.instance_handle.is_none() => {
                        c.instance_handle = Some(handle.clone());
                        true
                    }
                    _ => false,
                }
            })
            .await?;

        let kept = updated
            .controlled()
            .and_then(|c| c.instance_handle.as_deref())
            == Some(handle.as_str());
        if !kept {
            warn!(worker = %worker.id, %handle, "Placeholder moved on, destroying orphan instance");
            if let Err(e) = self.cloud_call("destroy", self.cloud.destroy(&handle)).await {
                warn!(worker = %worker.id, error = %e, "Failed to destroy orphan instance");
            }
        }
        Ok(updated)
    }

    /// Advance workers in `Provisioning`: issue the create for new
    /// placeholders, move to `Running` when the instance is ready, and to
    /// `Errored` on failure or after the provisioning timeout.
    pub async fn poll_provisioning(&self, now: DateTime<Utc>) -> SchedulerResult<()> {
        let timeout = to_chrono(self.settings.provision_timeout);
        let pending: Vec<Worker> = self
            .store
            .list_workers()
            .await?
            .into_iter()
            .filter(|w| w.status == WorkerStatus::Provisioning)
            .collect();

        for worker in pending {
            let Some(details) = worker.controlled() else {
                continue;
            };
            let expired = details
                .provisioning_started_at
                .is_some_and(|started| now - started > timeout);

            let Some(handle) = details.instance_handle.clone() else {
                let result = if expired {
                    warn!(worker = %worker.id, "Provisioning timed out before the instance was created");
                    self.record_provision_failure(now);
                    self.mark_errored(worker.id).await
                } else {
                    self.request_instance(&worker, now).await
                };
                if let Err(e) = result {
                    warn!(worker = %worker.id, error = %e, "Failed to record provisioning progress");
                }
                continue;
            };

            let state = match self
                .cloud_call("describe", self.cloud.describe(&handle))
                .await
            {
                Ok(state) => state,
                Err(e) => {
                    warn!(worker = %worker.id, error = %e, "Failed to describe instance");
                    InstanceState::Pending
                }
            };

            let result = match state {
                InstanceState::Ready { address } => {
                    info!(worker = %worker.id, %address, "Controlled worker ready");
                    self.modify(worker.id, |w| {
                        if w.status != WorkerStatus::Provisioning {
                            return false;
                        }
                        w.status = WorkerStatus::Running;
                        w.address = Some(address.clone());
                        w.last_seen_at = Some(now);
                        w.idle_since = Some(now);
                        w.start_clock(now);
                        if let Some(c) = w.controlled_mut() {
                            c.fully_provisioned = true;
                        }
                        true
                    })
                    .await
                }
                InstanceState::Failed { message } => {
                    warn!(worker = %worker.id, %message, "Provisioning failed");
                    self.record_provision_failure(now);
                    self.mark_errored(worker.id).await
                }
                InstanceState::Pending | InstanceState::Stopped if expired => {
                    warn!(worker = %worker.id, "Provisioning timed out");
                    self.record_provision_failure(now);
                    if let Err(e) = self.cloud_call("destroy", self.cloud.destroy(&handle)).await {
                        warn!(worker = %worker.id, error = %e, "Failed to destroy timed-out instance");
                    }
                    self.mark_errored(worker.id).await
                }
                InstanceState::Pending | InstanceState::Stopped => continue,
            };

            if let Err(e) = result {
                warn!(worker = %worker.id, error = %e, "Failed to record provisioning progress");
            }
        }
        Ok(())
    }

    async fn mark_errored(&self, id: WorkerId) -> SchedulerResult<Worker> {
        self.modify(id, |w| {
            if w.status != WorkerStatus::Provisioning {
                return false;
            }
            w.status = WorkerStatus::Errored;
            true
        })
        .await
    }

    /// Destroy a controlled worker's cloud resource and mark it terminated.
    pub async fn decommission(&self, id: WorkerId, now: DateTime<Utc>) -> SchedulerResult<Worker> {
        let worker = self.store.get_worker(id).await?;
        let Some(details) = worker.controlled() else {
            return Err(SchedulerError::InvalidState(format!(
                "worker {id} is external and cannot be decommissioned"
            )));
        };
        if matches!(worker.reservation, Reservation::Job(_)) {
            return Err(SchedulerError::InvalidState(format!(
                "worker {id} is running a job"
            )));
        }
        if worker.status == WorkerStatus::Terminated {
            return Ok(worker);
        }

        if let Some(handle) = &details.instance_handle {
            self.cloud_call("destroy", self.cloud.destroy(handle)).await?;
        }
        info!(worker = %id, "Decommissioned controlled worker");

        self.modify(id, |w| {
            w.status = WorkerStatus::Terminated;
            w.stop_clock(now);
            w.reservation = Reservation::Free;
            w.address = None;
            true
        })
        .await
    }

    /// Register a statically configured external worker. Idempotent by name;
    /// an existing registration picks up changed connection details.
    pub async fn register_external(
        &self,
        spec: &ExternalWorkerSpec,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Worker> {
        if let Some(existing) = self.store.find_external_by_name(&spec.name).await? {
            return self
                .modify(existing.id, |w| {
                    let ssh_key_ref = match &w.details {
                        WorkerDetails::External(e) => e.ssh_key_ref.clone(),
                        WorkerDetails::Controlled(_) => None,
                    };
                    if w.address.as_deref() == Some(spec.address.as_str())
                        && w.priority == spec.priority
                        && ssh_key_ref == spec.ssh_key_ref
                    {
                        return false;
                    }
                    w.address = Some(spec.address.clone());
                    w.priority = spec.priority;
                    if let WorkerDetails::External(e) = &mut w.details {
                        e.ssh_key_ref = spec.ssh_key_ref.clone();
                    }
                    true
                })
                .await;
        }

        let worker = self.store.insert_external(spec, now).await?;
        info!(worker = %worker.id, name = %worker.name, "Registered external worker");
        self.announce(&worker);
        Ok(worker)
    }

    /// Start an idle controlled worker's stopped instance.
    pub async fn wake(&self, worker: &Worker, now: DateTime<Utc>) -> SchedulerResult<Worker> {
        if worker.status != WorkerStatus::Idle {
            return Ok(worker.clone());
        }
        let handle = worker
            .controlled()
            .and_then(|c| c.instance_handle.clone())
            .ok_or_else(|| {
                SchedulerError::InvalidState(format!("worker {} has no instance", worker.id))
            })?;
        self.cloud_call("start", self.cloud.start(&handle)).await?;
        let address = match self.cloud_call("describe", self.cloud.describe(&handle)).await {
            Ok(InstanceState::Ready { address }) => Some(address),
            _ => None,
        };
        info!(worker = %worker.id, "Woke idle worker");

        self.modify(worker.id, |w| {
            if w.status != WorkerStatus::Idle {
                return false;
            }
            w.status = WorkerStatus::Running;
            w.last_seen_at = Some(now);
            if let Some(address) = &address {
                w.address = Some(address.clone());
            }
            w.start_clock(now);
            true
        })
        .await
    }

    /// Stop a running controlled worker's instance without destroying it.
    pub async fn park(&self, worker: &Worker, now: DateTime<Utc>) -> SchedulerResult<Worker> {
        if worker.status != WorkerStatus::Running {
            return Err(SchedulerError::InvalidState(format!(
                "worker {} is {}, not running",
                worker.id, worker.status
            )));
        }
        if matches!(worker.reservation, Reservation::Job(_)) {
            return Err(SchedulerError::InvalidState(format!(
                "worker {} is running a job",
                worker.id
            )));
        }
        let handle = worker
            .controlled()
            .and_then(|c| c.instance_handle.clone())
            .ok_or_else(|| {
                SchedulerError::InvalidState(format!("worker {} cannot be parked", worker.id))
            })?;
        self.cloud_call("stop", self.cloud.stop(&handle)).await?;
        info!(worker = %worker.id, "Parked idle worker");

        self.modify(worker.id, |w| {
            if w.status != WorkerStatus::Running {
                return false;
            }
            w.status = WorkerStatus::Idle;
            w.stop_clock(now);
            true
        })
        .await
    }

    /// Flag a worker for a health reset on the next maintenance sweep.
    pub async fn flag_maintenance(&self, id: WorkerId) -> SchedulerResult<Worker> {
        self.modify(id, |w| {
            if w.wants_maintenance {
                return false;
            }
            w.wants_maintenance = true;
            true
        })
        .await
    }

    /// Release a maintenance reservation, clearing the flags whose actions
    /// succeeded.
    pub async fn finish_maintenance(
        &self,
        id: WorkerId,
        cleaned: bool,
        reset: bool,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Worker> {
        self.modify(id, |w| {
            if w.reservation == Reservation::Maintenance {
                w.reservation = Reservation::Free;
                w.idle_since = Some(now);
            }
            if cleaned {
                w.cleanup_queued = false;
            }
            if reset {
                w.wants_maintenance = false;
                w.jobs_since_maintenance = 0;
            }
            if cleaned || reset {
                w.last_maintenance_at = Some(now);
            }
            true
        })
        .await
    }

    pub async fn list_workers(&self) -> SchedulerResult<Vec<Worker>> {
        Ok(self.store.list_workers().await?)
    }

    pub async fn get_worker(&self, id: WorkerId) -> SchedulerResult<Worker> {
        Ok(self.store.get_worker(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{DispatchMode, Harness, instance_spec};
    use buildfleet_core::worker::DiskUsage;
    use std::time::Duration as StdDuration;

    async fn running_controlled(h: &Harness, priority: i32) -> Worker {
        let mut spec = instance_spec();
        spec.priority = priority;
        let mut w = h.store.insert_controlled(&spec, Utc::now()).await.unwrap();
        w.status = WorkerStatus::Running;
        w.running_since = Some(Utc::now());
        w.last_seen_at = Some(Utc::now());
        let id = w.id.id;
        if let Some(c) = w.controlled_mut() {
            c.instance_handle = Some(format!("i-{id}"));
            c.fully_provisioned = true;
        }
        h.store.update_worker(&w).await.unwrap()
    }

    #[tokio::test]
    async fn test_lower_priority_wins_by_default() {
        let h = Harness::new();
        let w1 = running_controlled(&h, 1).await;
        let w2 = h.external("mac-mini", 5).await;

        let eligible = h.pool.list_eligible(&JobRequirements::default()).await.unwrap();
        let ids: Vec<WorkerId> = eligible.iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![w1.id, w2.id]);
    }

    #[tokio::test]
    async fn test_warm_before_cold_at_equal_priority() {
        let h = Harness::new();
        let mut cold = running_controlled(&h, 1).await;
        cold.status = WorkerStatus::Idle;
        cold.running_since = None;
        let cold = h.store.update_worker(&cold).await.unwrap();
        let warm = running_controlled(&h, 1).await;

        let eligible = h.pool.list_eligible(&JobRequirements::default()).await.unwrap();
        assert_eq!(eligible[0].id, warm.id);
        assert_eq!(eligible[1].id, cold.id);
    }

    #[tokio::test]
    async fn test_requirements_filter_pool() {
        let h = Harness::new();
        running_controlled(&h, 1).await;
        let ext = h.external("mac-mini", 5).await;
        let only_external = JobRequirements {
            pool: Some(WorkerKind::External),
        };
        let eligible = h.pool.list_eligible(&only_external).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, ext.id);
    }

    #[tokio::test]
    async fn test_concurrent_reserve_exactly_one_wins() {
        let h = Harness::new();
        let worker = h.external("mac-mini", 5).await;
        let pool = h.pool.clone();

        let attempts = (0..16).map(|i| {
            let pool = pool.clone();
            let worker = worker.clone();
            tokio::spawn(async move { pool.try_reserve(&worker, JobKey::new(1, 1, i)).await })
        });
        let results = join_all(attempts).await;

        let wins = results
            .into_iter()
            .map(|r| r.unwrap())
            .filter(|r| match r {
                Ok(_) => true,
                Err(e) => {
                    assert!(e.is_contention());
                    false
                }
            })
            .count();
        assert_eq!(wins, 1);

        let stored = h.store.get_worker(worker.id).await.unwrap();
        assert!(matches!(stored.reservation, Reservation::Job(_)));
        assert_eq!(stored.version, worker.version.next());
    }

    #[tokio::test]
    async fn test_release_flags_maintenance_at_threshold() {
        let h = Harness::with_settings(|c| c.pool.maintenance_every_jobs = 2);
        let worker = h.external("mac-mini", 5).await;
        let job = JobKey::new(1, 1, 1);

        for _ in 0..2 {
            let fresh = h.store.get_worker(worker.id).await.unwrap();
            h.pool.try_reserve(&fresh, job).await.unwrap();
            h.pool
                .release(worker.id, Reservation::Job(job), Utc::now())
                .await
                .unwrap();
        }

        let stored = h.store.get_worker(worker.id).await.unwrap();
        assert!(stored.reservation.is_free());
        assert_eq!(stored.jobs_since_maintenance, 2);
        assert!(stored.wants_maintenance);
        assert!(!stored.is_eligible());
    }

    #[tokio::test]
    async fn test_release_of_foreign_reservation_is_noop() {
        let h = Harness::new();
        let worker = h.external("mac-mini", 5).await;
        h.pool.try_reserve(&worker, JobKey::new(1, 1, 1)).await.unwrap();

        let after = h
            .pool
            .release(worker.id, Reservation::Job(JobKey::new(1, 1, 2)), Utc::now())
            .await
            .unwrap();
        assert_eq!(after.reservation, Reservation::Job(JobKey::new(1, 1, 1)));
    }

    #[tokio::test]
    async fn test_unreachable_past_threshold_escalates_held_job() {
        let h = Harness::with_settings(|c| c.pool.unreachable_after = StdDuration::from_secs(60));
        let worker = running_controlled(&h, 1).await;
        let job = JobKey::new(1, 1, 1);
        h.pool.try_reserve(&worker, job).await.unwrap();

        // Within the threshold nothing changes.
        let soon = Utc::now() + Duration::seconds(30);
        let report = h
            .pool
            .report_health(worker.id, HealthSnapshot::unreachable(), soon)
            .await
            .unwrap();
        assert_eq!(report.worker.status, WorkerStatus::Running);
        assert!(report.escalate.is_none());

        let later = Utc::now() + Duration::seconds(120);
        let report = h
            .pool
            .report_health(worker.id, HealthSnapshot::unreachable(), later)
            .await
            .unwrap();
        assert_eq!(report.worker.status, WorkerStatus::Unreachable);
        assert_eq!(report.escalate, Some(job));
        assert!(report.worker.controlled().unwrap().total_runtime_secs >= 119);
    }

    #[tokio::test]
    async fn test_reachable_probe_restores_unreachable_worker() {
        let h = Harness::new();
        let mut worker = h.external("mac-mini", 5).await;
        worker.status = WorkerStatus::Unreachable;
        worker.running_since = None;
        let worker = h.store.update_worker(&worker).await.unwrap();

        let report = h
            .pool
            .report_health(
                worker.id,
                HealthSnapshot {
                    reachable: true,
                    disk_usage: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(report.worker.status, WorkerStatus::Running);
        assert!(report.worker.is_eligible());
    }

    #[tokio::test]
    async fn test_full_disk_queues_cleanup_for_controlled_only() {
        let h = Harness::new();
        let controlled = running_controlled(&h, 1).await;
        let external = h.external("mac-mini", 5).await;
        let full = HealthSnapshot {
            reachable: true,
            disk_usage: Some(DiskUsage {
                used_bytes: 95,
                total_bytes: 100,
            }),
        };

        let c = h
            .pool
            .report_health(controlled.id, full, Utc::now())
            .await
            .unwrap();
        let e = h
            .pool
            .report_health(external.id, full, Utc::now())
            .await
            .unwrap();
        assert!(c.worker.cleanup_queued);
        assert!(!e.worker.cleanup_queued);
    }

    #[tokio::test]
    async fn test_probe_timeout_counts_as_unreachable() {
        let h = Harness::with_settings(|c| {
            c.pool.probe_timeout = StdDuration::from_millis(20);
            c.pool.unreachable_after = StdDuration::from_secs(0);
        });
        let worker = h.external("slow-box", 5).await;
        h.control.set_probe_delay(StdDuration::from_secs(5));

        let later = Utc::now() + Duration::seconds(1);
        h.pool.probe_all(later).await.unwrap();
        let stored = h.store.get_worker(worker.id).await.unwrap();
        assert_eq!(stored.status, WorkerStatus::Unreachable);
    }

    async fn handle_of(h: &Harness, id: WorkerId) -> Option<String> {
        let worker = h.store.get_worker(id).await.unwrap();
        worker.controlled().unwrap().instance_handle.clone()
    }

    #[tokio::test]
    async fn test_provision_then_poll_to_running() {
        let h = Harness::new();
        let worker = h.pool.provision(Utc::now()).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Provisioning);
        assert!(worker.controlled().unwrap().instance_handle.is_none());

        // The first poll issues the create.
        h.pool.poll_provisioning(Utc::now()).await.unwrap();
        let handle = handle_of(&h, worker.id).await.unwrap();
        assert_eq!(
            h.store.get_worker(worker.id).await.unwrap().status,
            WorkerStatus::Provisioning
        );

        h.pool.poll_provisioning(Utc::now()).await.unwrap();
        assert_eq!(handle_of(&h, worker.id).await.as_deref(), Some(handle.as_str()));

        h.cloud.set_ready(&handle, "http://10.1.0.7:7000").await;
        h.pool.poll_provisioning(Utc::now()).await.unwrap();
        let ready = h.store.get_worker(worker.id).await.unwrap();
        assert_eq!(ready.status, WorkerStatus::Running);
        assert_eq!(ready.address.as_deref(), Some("http://10.1.0.7:7000"));
        assert!(ready.controlled().unwrap().fully_provisioned);
        assert!(ready.is_eligible());
    }

    #[tokio::test]
    async fn test_provisioning_timeout_errors_worker() {
        let h = Harness::with_settings(|c| c.pool.provision_timeout = StdDuration::from_secs(60));
        let worker = h.pool.provision(Utc::now()).await.unwrap();
        h.pool.poll_provisioning(Utc::now()).await.unwrap();
        assert!(handle_of(&h, worker.id).await.is_some());

        h.pool
            .poll_provisioning(Utc::now() + Duration::seconds(120))
            .await
            .unwrap();
        let stored = h.store.get_worker(worker.id).await.unwrap();
        assert_eq!(stored.status, WorkerStatus::Errored);
        assert_eq!(h.cloud.destroyed().await.len(), 1);
        assert!(h.pool.provisioning_backoff(Utc::now() + Duration::seconds(121)));
    }

    #[tokio::test]
    async fn test_hanging_create_is_bounded_and_errors_worker() {
        let h = Harness::with_settings(|c| c.pool.cloud_timeout = StdDuration::from_millis(50));
        h.cloud.set_create_mode(DispatchMode::Hang);
        let worker = h.pool.provision(Utc::now()).await.unwrap();

        tokio::time::timeout(StdDuration::from_secs(2), h.pool.poll_provisioning(Utc::now()))
            .await
            .expect("create was not bounded")
            .unwrap();
        let stored = h.store.get_worker(worker.id).await.unwrap();
        assert_eq!(stored.status, WorkerStatus::Errored);
        assert!(!stored.is_active());
        assert!(h.pool.provisioning_backoff(Utc::now()));
    }

    #[tokio::test]
    async fn test_failed_create_starts_backoff_window() {
        let h = Harness::with_settings(|c| c.pool.provision_backoff = StdDuration::from_secs(300));
        h.cloud.set_create_mode(DispatchMode::Fail);
        let now = Utc::now();
        assert!(!h.pool.provisioning_backoff(now));

        let worker = h.pool.provision(now).await.unwrap();
        h.pool.poll_provisioning(now).await.unwrap();
        assert_eq!(
            h.store.get_worker(worker.id).await.unwrap().status,
            WorkerStatus::Errored
        );
        assert!(h.pool.provisioning_backoff(now + Duration::seconds(299)));
        assert!(!h.pool.provisioning_backoff(now + Duration::seconds(301)));
    }

    #[tokio::test]
    async fn test_unreachable_worker_keeps_escalating_held_job() {
        let h = Harness::with_settings(|c| c.pool.unreachable_after = StdDuration::from_secs(0));
        let worker = h.external("mac-mini", 5).await;
        let job = JobKey::new(1, 1, 1);
        h.pool.try_reserve(&worker, job).await.unwrap();
        h.control.set_reachable(worker.id, false);

        let first = Utc::now() + Duration::seconds(1);
        assert_eq!(h.pool.probe_all(first).await.unwrap(), vec![(worker.id, job)]);

        // Nobody cleared the reservation, so the next pass reports it again.
        let second = first + Duration::seconds(30);
        assert_eq!(h.pool.probe_all(second).await.unwrap(), vec![(worker.id, job)]);

        h.pool
            .release(worker.id, Reservation::Job(job), second)
            .await
            .unwrap();
        assert!(h.pool.probe_all(second).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_unused_does_not_count_job() {
        let h = Harness::with_settings(|c| c.pool.maintenance_every_jobs = 1);
        let worker = h.external("mac-mini", 5).await;
        let job = JobKey::new(1, 1, 1);
        h.pool.try_reserve(&worker, job).await.unwrap();

        let freed = h
            .pool
            .release_unused(worker.id, Reservation::Job(job), Utc::now())
            .await
            .unwrap();
        assert!(freed.reservation.is_free());
        assert_eq!(freed.jobs_since_maintenance, 0);
        assert!(!freed.wants_maintenance);
        assert!(freed.is_eligible());
    }

    #[tokio::test]
    async fn test_hanging_start_is_bounded() {
        let h = Harness::with_settings(|c| c.pool.cloud_timeout = StdDuration::from_millis(50));
        let worker = running_controlled(&h, 1).await;
        let parked = h.pool.park(&worker, Utc::now()).await.unwrap();
        h.cloud.set_start_mode(DispatchMode::Hang);

        let err = tokio::time::timeout(StdDuration::from_secs(2), h.pool.wake(&parked, Utc::now()))
            .await
            .expect("start was not bounded")
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Timeout(_)));
        assert_eq!(
            h.store.get_worker(worker.id).await.unwrap().status,
            WorkerStatus::Idle
        );
    }

    #[tokio::test]
    async fn test_decommission_folds_runtime() {
        let h = Harness::new();
        let worker = running_controlled(&h, 1).await;
        let later = worker.running_since.unwrap() + Duration::seconds(600);

        let done = h.pool.decommission(worker.id, later).await.unwrap();
        assert_eq!(done.status, WorkerStatus::Terminated);
        assert_eq!(done.controlled().unwrap().total_runtime_secs, 600);
        assert!(!done.is_active());
    }

    #[tokio::test]
    async fn test_external_cannot_be_decommissioned() {
        let h = Harness::new();
        let worker = h.external("mac-mini", 5).await;
        let err = h.pool.decommission(worker.id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_register_external_is_idempotent() {
        let h = Harness::new();
        let spec = ExternalWorkerSpec {
            name: "mac-mini".to_string(),
            address: "http://10.0.0.5:7000".to_string(),
            priority: 5,
            ssh_key_ref: None,
        };
        let first = h.pool.register_external(&spec, Utc::now()).await.unwrap();
        let again = h.pool.register_external(&spec, Utc::now()).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(first.version, again.version);

        let moved = ExternalWorkerSpec {
            address: "http://10.0.0.6:7000".to_string(),
            ..spec
        };
        let updated = h.pool.register_external(&moved, Utc::now()).await.unwrap();
        assert_eq!(updated.id, first.id);
        assert_eq!(updated.address.as_deref(), Some("http://10.0.0.6:7000"));
    }

    #[tokio::test]
    async fn test_park_and_wake() {
        let h = Harness::new();
        let worker = running_controlled(&h, 1).await;

        let parked = h.pool.park(&worker, Utc::now()).await.unwrap();
        assert_eq!(parked.status, WorkerStatus::Idle);
        assert!(!parked.is_warm());
        assert!(parked.is_eligible());

        let woken = h.pool.wake(&parked, Utc::now()).await.unwrap();
        assert_eq!(woken.status, WorkerStatus::Running);
        assert!(woken.is_warm());
    }
}
