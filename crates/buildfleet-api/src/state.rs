//! Application state.

use std::sync::Arc;

use buildfleet_core::event::BroadcastNotifier;
use buildfleet_db::Store;
use buildfleet_scheduler::{
    FleetService, MaintenanceCoordinator, OutputAggregator, Scheduler, WorkerPool,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub scheduler: Arc<Scheduler>,
    pub pool: Arc<WorkerPool>,
    pub output: Arc<OutputAggregator>,
    pub maintenance: Arc<MaintenanceCoordinator>,
    pub events: Arc<BroadcastNotifier>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, service: &FleetService, events: Arc<BroadcastNotifier>) -> Self {
        Self {
            store,
            scheduler: service.scheduler().clone(),
            pool: service.pool().clone(),
            output: service.output().clone(),
            maintenance: service.maintenance().clone(),
            events,
        }
    }
}
