//! The scheduler: matches queued jobs to eligible workers and drives each
//! job through dispatch, completion, cancellation and failure.

use std::collections::HashMap;
use std::sync::Arc;

use buildfleet_config::SchedulerSettings;
use buildfleet_core::artifact::ArtifactStore;
use buildfleet_core::control::{DispatchMessage, WorkerControl};
use buildfleet_core::credential;
use buildfleet_core::event::{Event, Notifier};
use buildfleet_core::id::{BuildKey, JobKey, WorkerId, WorkerKind};
use buildfleet_core::job::{Job, JobOutcome, JobState};
use buildfleet_core::project::{Build, NewBuild};
use buildfleet_core::secret::SecretResolver;
use buildfleet_core::worker::{Reservation, Worker, WorkerStatus};
use buildfleet_db::{DbError, Store};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::output::authorize;
use crate::pool::{JobRequirements, WorkerPool};
use crate::{CAS_RETRIES, Collaborators, SchedulerError, SchedulerResult};

/// What one scheduling pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Stuck dispatches rolled back or failed before scheduling.
    pub recovered: usize,
    pub dispatched: usize,
    pub rolled_back: usize,
    pub failed: usize,
    /// Jobs left queued because no eligible worker was free.
    pub waiting: usize,
    pub provisioned: usize,
}

enum Placement {
    Dispatched,
    RolledBack,
    Failed,
    /// Every candidate tried was taken by someone else.
    Contended,
    NoWorker,
    /// The job changed underneath the pass (e.g. cancelled).
    Skipped,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    pool: Arc<WorkerPool>,
    control: Arc<dyn WorkerControl>,
    artifacts: Arc<dyn ArtifactStore>,
    secrets: Arc<dyn SecretResolver>,
    notifier: Arc<dyn Notifier>,
    settings: SchedulerSettings,
    public_url: String,
    wake: Notify,
}

impl Scheduler {
    pub fn new(
        collab: &Collaborators,
        pool: Arc<WorkerPool>,
        settings: SchedulerSettings,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            store: collab.store.clone(),
            pool,
            control: collab.control.clone(),
            artifacts: collab.artifacts.clone(),
            secrets: collab.secrets.clone(),
            notifier: collab.notifier.clone(),
            settings,
            public_url: public_url.into(),
            wake: Notify::new(),
        }
    }

    /// Trigger a pass without waiting for the next interval.
    pub fn wake_up(&self) {
        self.wake.notify_one();
    }

    /// Sleep until the next pass is due or someone calls [`wake_up`](Self::wake_up).
    pub async fn wait_for_work(&self) {
        let _ = tokio::time::timeout(self.settings.interval, self.wake.notified()).await;
    }

    fn announce(&self, job: &Job) {
        self.notifier.notify(Event::JobChanged {
            job: job.key,
            state: job.state,
        });
    }

    /// Create a build and queue its jobs.
    pub async fn enqueue(&self, request: NewBuild) -> SchedulerResult<Build> {
        if request.jobs.is_empty() {
            return Err(SchedulerError::InvalidState(format!(
                "build {}/{} has no jobs",
                request.project_id, request.build_id
            )));
        }
        let project = self.store.get_project(request.project_id).await?;
        if !project.is_schedulable() {
            return Err(SchedulerError::InvalidState(format!(
                "project {} is disabled or deleted",
                project.id
            )));
        }

        let now = Utc::now();
        let build = Build::new(&request, now);
        let jobs: Vec<Job> = request
            .jobs
            .into_iter()
            .map(|spec| Job::new(build.key.job(spec.job_id), spec, now))
            .collect();
        self.store.insert_build(&build, &jobs).await?;

        info!(build = %build.key, jobs = jobs.len(), "Enqueued build");
        for job in &jobs {
            self.announce(job);
        }
        self.notifier.notify(Event::BuildChanged {
            build: build.key,
            status: build.status,
        });
        self.wake_up();
        Ok(build)
    }

    /// One scheduling pass over the queue.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> SchedulerResult<PassReport> {
        let mut report = PassReport {
            recovered: self.recover_stale_dispatches(now).await?,
            ..Default::default()
        };

        let queued = self.store.list_jobs_in_state(JobState::Queued).await?;
        if queued.is_empty() {
            return Ok(report);
        }

        let mut candidates = self.pool.list_eligible(&JobRequirements::default()).await?;
        let mut schedulable: HashMap<i64, bool> = HashMap::new();
        let mut waiting_for_controlled = 0;

        for job in queued {
            let project_id = job.key.project_id;
            let allowed = match schedulable.get(&project_id) {
                Some(allowed) => *allowed,
                None => {
                    let allowed = match self.store.get_project(project_id).await {
                        Ok(project) => project.is_schedulable(),
                        Err(DbError::NotFound(_)) => false,
                        Err(e) => return Err(e.into()),
                    };
                    schedulable.insert(project_id, allowed);
                    allowed
                }
            };
            if !allowed {
                debug!(job = %job.key, "Project not schedulable, leaving job queued");
                continue;
            }

            let key = job.key;
            let requirements = JobRequirements::for_job(&job);
            match self.place(job, &requirements, &mut candidates, now).await {
                Ok(Placement::Dispatched) => report.dispatched += 1,
                Ok(Placement::RolledBack) => report.rolled_back += 1,
                Ok(Placement::Failed) => report.failed += 1,
                Ok(Placement::NoWorker) => {
                    report.waiting += 1;
                    if requirements.pool != Some(WorkerKind::External) {
                        waiting_for_controlled += 1;
                    }
                }
                Ok(Placement::Contended) => report.waiting += 1,
                Ok(Placement::Skipped) => {}
                Err(e) => warn!(job = %key, error = %e, "Failed to place job"),
            }
        }

        if waiting_for_controlled > 0 {
            report.provisioned = self.grow_pool(waiting_for_controlled, now).await;
        }

        if report.dispatched > 0 || report.failed > 0 || report.provisioned > 0 {
            info!(?report, "Scheduling pass complete");
        }
        Ok(report)
    }

    /// Try candidates for `job` in order, bounded by the configured attempts.
    async fn place(
        &self,
        job: Job,
        requirements: &JobRequirements,
        candidates: &mut Vec<Worker>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Placement> {
        let mut attempts = 0;
        while attempts < self.settings.reserve_attempts {
            let Some(pos) = candidates.iter().position(|w| requirements.admits(w)) else {
                return Ok(Placement::NoWorker);
            };
            let candidate = candidates.remove(pos);
            attempts += 1;

            let worker = match self.pool.try_reserve(&candidate, job.key).await {
                Ok(worker) => worker,
                Err(e) if e.is_contention() => {
                    debug!(job = %job.key, worker = %candidate.id, "Lost reservation race");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let worker = if worker.status == WorkerStatus::Idle {
                match self.pool.wake(&worker, now).await {
                    Ok(worker) => worker,
                    Err(e) => {
                        warn!(worker = %worker.id, error = %e, "Failed to wake idle worker");
                        self.pool
                            .release_unused(worker.id, Reservation::Job(job.key), now)
                            .await?;
                        if let Err(e) = self.pool.flag_maintenance(worker.id).await {
                            warn!(worker = %worker.id, error = %e, "Failed to flag worker after wake failure");
                        }
                        continue;
                    }
                }
            } else {
                worker
            };

            return self.dispatch(job, worker, now).await;
        }
        Ok(Placement::Contended)
    }

    async fn dispatch(
        &self,
        mut job: Job,
        worker: Worker,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Placement> {
        let holder = Reservation::Job(job.key);
        let connect = credential::mint();

        let begun = job.begin_dispatch(worker.id, worker.label(), credential::hash(&connect), now);
        let stored = match begun {
            Ok(()) => self.store.update_job(&job).await,
            Err(e) => {
                self.pool.release_unused(worker.id, holder, now).await?;
                return Err(e.into());
            }
        };
        let job = match stored {
            Ok(job) => job,
            Err(e) => {
                self.pool.release_unused(worker.id, holder, now).await?;
                if e.is_conflict() {
                    debug!(job = %job.key, "Job changed before dispatch");
                    return Ok(Placement::Skipped);
                }
                return Err(e.into());
            }
        };
        self.announce(&job);
        info!(job = %job.key, worker = %worker.id, "Dispatching job");

        let message = match self.dispatch_message(&job, connect).await {
            Ok(message) => message,
            Err(e) => {
                let reason = format!("could not prepare dispatch: {e}");
                return self.abandon_dispatch(job, &reason, true, now).await;
            }
        };

        let ack = tokio::time::timeout(
            self.settings.dispatch_timeout,
            self.control.dispatch(&worker, &message),
        )
        .await;
        match ack {
            Ok(Ok(())) => self.acknowledge(job).await,
            Ok(Err(e)) => {
                let reason = format!("dispatch to {} failed: {e}", worker.id);
                self.abandon_dispatch(job, &reason, false, now).await
            }
            Err(_) => {
                let reason = format!("{} did not acknowledge dispatch in time", worker.id);
                self.abandon_dispatch(job, &reason, false, now).await
            }
        }
    }

    async fn dispatch_message(
        &self,
        job: &Job,
        connect_credential: String,
    ) -> SchedulerResult<DispatchMessage> {
        let build = self.store.get_build(job.key.build()).await?;

        let mut secrets = HashMap::new();
        if build.is_safe {
            for name in &job.secret_names {
                let value = self
                    .secrets
                    .resolve(job.key.project_id, name, &job.kind)
                    .await?;
                secrets.insert(name.clone(), value);
            }
        } else if !job.secret_names.is_empty() {
            debug!(job = %job.key, "Build is not safe, withholding secrets");
        }

        Ok(DispatchMessage {
            job: job.key,
            name: job.name.clone(),
            image: job.image.clone(),
            cache_config: job.cache_config.clone(),
            secrets,
            artifacts: self.artifacts.credentials(&job.key).await?,
            output_endpoint: format!(
                "{}/api/v1/jobs/{}/{}/{}",
                self.public_url.trim_end_matches('/'),
                job.key.project_id,
                job.key.build_id,
                job.key.job_id
            ),
            connect_credential,
        })
    }

    /// Dispatching -> Running after the worker acknowledged.
    async fn acknowledge(&self, job: Job) -> SchedulerResult<Placement> {
        let mut running = job.clone();
        running.mark_running(Utc::now())?;
        match self.store.update_job(&running).await {
            Ok(running) => {
                info!(job = %running.key, wait_ms = ?running.wait_ms, "Job running");
                self.announce(&running);
                self.refresh_build(running.key.build()).await;
                Ok(Placement::Dispatched)
            }
            Err(e) if e.is_conflict() => {
                // Completed or cancelled while the acknowledgement was in flight.
                debug!(job = %job.key, "Job changed during dispatch");
                self.refresh_build(job.key.build()).await;
                Ok(Placement::Skipped)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Dispatching -> Queued (counted) or Failed once attempts are used up.
    async fn abandon_dispatch(
        &self,
        job: Job,
        reason: &str,
        force_fail: bool,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Placement> {
        let worker = job.worker;
        let attempt = job.dispatch_attempts + 1;
        let give_up = force_fail || attempt >= self.settings.max_dispatch_attempts;

        let mut next = job.clone();
        if give_up {
            next.fail_infrastructure(format!("{reason} (attempt {attempt})"), now)?;
        } else {
            next.rollback_dispatch()?;
        }

        let next = match self.store.update_job(&next).await {
            Ok(next) => next,
            Err(e) if e.is_conflict() => {
                debug!(job = %job.key, "Job changed while abandoning dispatch");
                return Ok(Placement::Skipped);
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(worker) = worker {
            self.pool
                .release_unused(worker, Reservation::Job(job.key), now)
                .await?;
        }
        self.announce(&next);

        if give_up {
            warn!(job = %job.key, %reason, attempt, "Dispatch failed, giving up");
            self.refresh_build(job.key.build()).await;
            Ok(Placement::Failed)
        } else {
            warn!(job = %job.key, %reason, attempt, "Dispatch failed, job requeued");
            Ok(Placement::RolledBack)
        }
    }

    /// Roll back jobs left in Dispatching by a pass that never finished.
    async fn recover_stale_dispatches(&self, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let limit = Duration::from_std(self.settings.dispatch_timeout * 2)
            .unwrap_or_else(|_| Duration::days(1));
        let stuck = self.store.list_jobs_in_state(JobState::Dispatching).await?;

        let mut recovered = 0;
        for job in stuck {
            let stale = job
                .dispatch_started_at
                .is_none_or(|started| now - started > limit);
            if !stale {
                continue;
            }
            let key = job.key;
            match self
                .abandon_dispatch(job, "dispatch was never acknowledged", false, now)
                .await
            {
                Ok(Placement::Skipped) => {}
                Ok(_) => recovered += 1,
                Err(e) => warn!(job = %key, error = %e, "Failed to recover stale dispatch"),
            }
        }
        Ok(recovered)
    }

    /// Provision controlled workers for jobs left waiting, within the ceiling.
    /// Returns how many were requested.
    async fn grow_pool(&self, waiting: usize, now: DateTime<Utc>) -> usize {
        let max = self.settings.max_controlled_workers;
        let (active, provisioning) = match self.pool.controlled_census().await {
            Ok(census) => census,
            Err(e) => {
                warn!(error = %e, "Failed to count controlled workers");
                return 0;
            }
        };

        let wanted = waiting.saturating_sub(provisioning);
        let room = max.saturating_sub(active);
        if wanted == 0 {
            debug!(waiting, provisioning, "Enough workers already provisioning");
            return 0;
        }
        if self.pool.provisioning_backoff(now) {
            debug!(waiting, "Provisioning backing off after a recent failure");
            return 0;
        }
        if room == 0 {
            warn!(waiting, active, max, "Pool pressure: no eligible worker and controlled fleet at ceiling");
            return 0;
        }

        let mut requested = 0;
        for _ in 0..wanted.min(room) {
            match self.pool.provision(now).await {
                Ok(worker) => {
                    debug!(worker = %worker.id, "Requested controlled worker");
                    requested += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to provision controlled worker");
                    break;
                }
            }
        }
        requested
    }

    /// Completion report from the worker running `key`.
    pub async fn complete_job(
        &self,
        key: JobKey,
        credential: &str,
        outcome: JobOutcome,
    ) -> SchedulerResult<Job> {
        let now = Utc::now();
        let mut job = self.store.get_job(key).await?;
        authorize(&job, credential)?;

        if job.state == JobState::Dispatching {
            // The worker finished before its acknowledgement was recorded.
            job.mark_running(now)?;
        }
        let worker = job.worker;
        job.finish(&outcome, now)?;
        let job = self.store.update_job(&job).await?;

        info!(job = %key, success = outcome.success, "Job finished");
        self.announce(&job);
        if let Some(worker) = worker {
            if let Err(e) = self.pool.release(worker, Reservation::Job(key), now).await {
                warn!(job = %key, worker = %worker, error = %e, "Failed to release worker");
            }
        }
        self.refresh_build(key.build()).await;
        Ok(job)
    }

    /// Cancel a job. Running and dispatching jobs get a best-effort stop
    /// signal bounded by the cancel grace period, then are cancelled
    /// regardless.
    pub async fn cancel_job(&self, key: JobKey) -> SchedulerResult<Job> {
        for _ in 0..CAS_RETRIES {
            let now = Utc::now();
            let mut job = self.store.get_job(key).await?;
            if job.state.is_terminal() {
                return Err(SchedulerError::InvalidState(format!(
                    "job {key} already finished as {}",
                    job.state
                )));
            }

            let worker = job.worker;
            if let Some(worker) = worker {
                self.stop_on_worker(worker, key).await;
            }

            job.cancel(now)?;
            match self.store.update_job(&job).await {
                Ok(job) => {
                    info!(job = %key, "Job cancelled");
                    self.announce(&job);
                    if let Some(worker) = worker {
                        if let Err(e) = self.pool.release(worker, Reservation::Job(key), now).await
                        {
                            warn!(job = %key, worker = %worker, error = %e, "Failed to release worker");
                        }
                    }
                    self.refresh_build(key.build()).await;
                    return Ok(job);
                }
                Err(e) if e.is_conflict() => {
                    debug!(job = %key, "Job changed during cancel, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SchedulerError::Contention(format!("job {key} kept changing")))
    }

    async fn stop_on_worker(&self, id: WorkerId, job: JobKey) {
        let worker = match self.pool.get_worker(id).await {
            Ok(worker) => worker,
            Err(e) => {
                warn!(job = %job, worker = %id, error = %e, "Cannot stop job, worker lookup failed");
                return;
            }
        };
        match tokio::time::timeout(self.settings.cancel_grace, self.control.stop(&worker, &job))
            .await
        {
            Ok(Ok(())) => debug!(job = %job, worker = %id, "Stop signal delivered"),
            Ok(Err(e)) => warn!(job = %job, worker = %id, error = %e, "Stop signal failed"),
            Err(_) => warn!(job = %job, worker = %id, "Stop signal timed out"),
        }
    }

    /// Fail a job for reasons outside its script, e.g. its worker vanished.
    /// Escalations for a job no longer held by `worker` are ignored.
    pub async fn fail_for_infrastructure(
        &self,
        key: JobKey,
        worker: WorkerId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<Job>> {
        for _ in 0..CAS_RETRIES {
            let mut job = self.store.get_job(key).await?;
            if !job.is_assigned_to(worker) {
                debug!(job = %key, worker = %worker, "Stale infrastructure escalation");
                self.pool
                    .release_unused(worker, Reservation::Job(key), now)
                    .await?;
                return Ok(None);
            }

            job.fail_infrastructure(reason, now)?;
            match self.store.update_job(&job).await {
                Ok(job) => {
                    warn!(job = %key, worker = %worker, %reason, "Job failed on infrastructure");
                    self.announce(&job);
                    self.pool.release(worker, Reservation::Job(key), now).await?;
                    self.refresh_build(key.build()).await;
                    return Ok(Some(job));
                }
                Err(e) if e.is_conflict() => {
                    debug!(job = %key, "Job changed during escalation, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SchedulerError::Contention(format!("job {key} kept changing")))
    }

    /// Probe the pool and escalate jobs held by unreachable workers. An
    /// escalation that fails here is retried on the next pass.
    pub async fn health_pass(&self, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let escalations = self.pool.probe_all(now).await?;
        let count = escalations.len();
        for (worker, job) in escalations {
            if let Err(e) = self
                .fail_for_infrastructure(job, worker, "worker became unreachable", now)
                .await
            {
                warn!(job = %job, worker = %worker, error = %e, "Failed to escalate job");
            }
        }
        Ok(count)
    }

    /// Re-derive a build's status from its jobs.
    async fn refresh_build(&self, key: BuildKey) {
        for _ in 0..CAS_RETRIES {
            let result = async {
                let mut build = self.store.get_build(key).await?;
                let jobs = self.store.list_jobs_for_build(key).await?;
                let Some(status) = build.derive_status(jobs.iter().map(|j| &j.state)) else {
                    return Ok(None);
                };
                build.status = status;
                if status.is_terminal() {
                    build.finished_at = Some(Utc::now());
                }
                self.store.update_build(&build).await.map(Some)
            }
            .await;

            match result {
                Ok(Some(build)) => {
                    info!(build = %key, status = build.status.as_str(), "Build status changed");
                    self.notifier.notify(Event::BuildChanged {
                        build: key,
                        status: build.status,
                    });
                    return;
                }
                Ok(None) => return,
                Err(e) if e.is_conflict() => continue,
                Err(e) => {
                    warn!(build = %key, error = %e, "Failed to update build status");
                    return;
                }
            }
        }
        warn!(build = %key, "Build kept changing, status left for the next transition");
    }

    pub async fn get_job(&self, key: JobKey) -> SchedulerResult<Job> {
        Ok(self.store.get_job(key).await?)
    }

    /// A build and its jobs.
    pub async fn get_build(&self, key: BuildKey) -> SchedulerResult<(Build, Vec<Job>)> {
        let build = self.store.get_build(key).await?;
        let jobs = self.store.list_jobs_for_build(key).await?;
        Ok((build, jobs))
    }
}
