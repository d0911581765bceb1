//! Wires the fleet components together and runs their periodic tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use buildfleet_config::SystemConfig;
use buildfleet_core::worker::ExternalWorkerSpec;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::{
    Collaborators, MaintenanceCoordinator, OutputAggregator, Scheduler, SchedulerResult,
    WorkerPool,
};

struct Intervals {
    health: Duration,
    provisioning: Duration,
    maintenance: Duration,
    purge: Duration,
}

pub struct FleetService {
    pool: Arc<WorkerPool>,
    scheduler: Arc<Scheduler>,
    output: Arc<OutputAggregator>,
    maintenance: Arc<MaintenanceCoordinator>,
    external_workers: Vec<ExternalWorkerSpec>,
    intervals: Intervals,
}

impl FleetService {
    pub fn new(collab: Collaborators, config: &SystemConfig) -> Self {
        let pool = Arc::new(WorkerPool::new(
            &collab,
            config.pool.clone(),
            config.instance.clone(),
            config.scheduler.priority_order,
        ));
        let scheduler = Arc::new(Scheduler::new(
            &collab,
            pool.clone(),
            config.scheduler.clone(),
            config.public_url.clone(),
        ));
        let output = Arc::new(OutputAggregator::new(
            collab.store.clone(),
            collab.notifier.clone(),
            config.output.clone(),
        ));
        let maintenance = Arc::new(MaintenanceCoordinator::new(
            &collab,
            pool.clone(),
            config.maintenance.clone(),
        ));

        Self {
            pool,
            scheduler,
            output,
            maintenance,
            external_workers: config.external_workers.clone(),
            intervals: Intervals {
                health: config.pool.health_interval,
                provisioning: config.pool.provision_poll_interval,
                maintenance: config.maintenance.interval,
                purge: config.output.purge_interval,
            },
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn output(&self) -> &Arc<OutputAggregator> {
        &self.output
    }

    pub fn maintenance(&self) -> &Arc<MaintenanceCoordinator> {
        &self.maintenance
    }

    /// Register the statically configured external workers.
    pub async fn bootstrap(&self) -> SchedulerResult<()> {
        let now = Utc::now();
        for spec in &self.external_workers {
            self.pool.register_external(spec, now).await?;
        }
        info!(external_workers = self.external_workers.len(), "Fleet bootstrapped");
        Ok(())
    }

    /// Start the background loops. They run until aborted.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let scheduler = self.scheduler.clone();
        let schedule = tokio::spawn(async move {
            loop {
                if let Err(e) = scheduler.run_pass(Utc::now()).await {
                    warn!(error = %e, "Scheduling pass failed");
                }
                scheduler.wait_for_work().await;
            }
        });

        let scheduler = self.scheduler.clone();
        let health = every("health", self.intervals.health, move || {
            let scheduler = scheduler.clone();
            async move { scheduler.health_pass(Utc::now()).await.map(|_| ()) }
        });

        let pool = self.pool.clone();
        let provisioning = every("provisioning", self.intervals.provisioning, move || {
            let pool = pool.clone();
            async move { pool.poll_provisioning(Utc::now()).await }
        });

        let maintenance = self.maintenance.clone();
        let sweep = every("maintenance", self.intervals.maintenance, move || {
            let maintenance = maintenance.clone();
            async move { maintenance.sweep(Utc::now()).await.map(|_| ()) }
        });

        let output = self.output.clone();
        let purge = every("purge", self.intervals.purge, move || {
            let output = output.clone();
            async move { output.purge_expired(Utc::now()).await.map(|_| ()) }
        });

        vec![schedule, health, provisioning, sweep, purge]
    }
}

/// Run `task` every `period`, logging failures.
fn every<F, Fut>(name: &'static str, period: Duration, task: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = SchedulerResult<()>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = task().await {
                warn!(task = name, error = %e, "Periodic task failed");
            }
        }
    })
}
