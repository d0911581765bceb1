//! Repository traits and their PostgreSQL implementations.
//!
//! Every mutable record carries a version stamp. `update_*` methods are
//! compare-and-swap writes: they commit only when the stored version equals
//! the version on the record passed in, and return the record with its new
//! version. A stale writer gets `DbError::VersionConflict`.

pub mod build;
pub mod maintenance;
pub mod output;
pub mod project;
pub mod worker;

pub use build::BuildRepo;
pub use maintenance::MaintenanceRepo;
pub use output::OutputRepo;
pub use project::ProjectRepo;
pub use worker::WorkerRepo;

use sqlx::PgPool;

/// Everything the scheduler persists.
pub trait Store: ProjectRepo + BuildRepo + WorkerRepo + OutputRepo + MaintenanceRepo {}

impl<T> Store for T where T: ProjectRepo + BuildRepo + WorkerRepo + OutputRepo + MaintenanceRepo {}

/// PostgreSQL implementation of all repositories.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
