//! Scheduling and fleet management for BuildFleet.
//!
//! - [`WorkerPool`]: authoritative view of workers and reservations
//! - [`Scheduler`]: matches queued jobs to workers and drives the job lifecycle
//! - [`OutputAggregator`]: authenticated, append-only job output
//! - [`MaintenanceCoordinator`]: cleanup, recycling and teardown sweeps
//! - [`FleetService`]: wires the above together and runs the periodic tasks
//!
//! All state changes go through compare-and-swap writes on version stamps.
//! There is no pool-wide lock.

pub mod control;
pub mod error;
pub mod maintenance;
pub mod output;
pub mod pool;
pub mod scheduler;
pub mod service;

pub use control::HttpWorkerControl;
pub use error::{SchedulerError, SchedulerResult};
pub use maintenance::{MaintenanceCoordinator, SweepReport};
pub use output::{OutputAggregator, OutputChunk, SectionSummary};
pub use pool::{JobRequirements, WorkerPool};
pub use scheduler::{PassReport, Scheduler};
pub use service::FleetService;

use std::sync::Arc;

use buildfleet_core::artifact::ArtifactStore;
use buildfleet_core::cloud::CloudProvisioner;
use buildfleet_core::control::WorkerControl;
use buildfleet_core::event::Notifier;
use buildfleet_core::secret::SecretResolver;
use buildfleet_db::Store;

/// External collaborators shared by every component.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub control: Arc<dyn WorkerControl>,
    pub cloud: Arc<dyn CloudProvisioner>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub secrets: Arc<dyn SecretResolver>,
    pub notifier: Arc<dyn Notifier>,
}

/// Retries for read-modify-write cycles that lost a version race.
pub(crate) const CAS_RETRIES: usize = 5;

#[cfg(test)]
pub(crate) mod testing;
