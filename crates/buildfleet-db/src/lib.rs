//! Database layer for the BuildFleet scheduler.
//!
//! Provides repository traits, a PostgreSQL implementation and an
//! in-memory implementation with the same compare-and-swap semantics.

pub mod error;
pub mod memory;
pub mod repo;

pub use error::{DbError, DbResult};
pub use memory::MemoryStore;
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Turn a unique-key violation into `DbError::Duplicate`.
pub(crate) fn map_insert_error(err: sqlx::Error, what: String) -> DbError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => DbError::Duplicate(what),
        _ => DbError::Database(err),
    }
}
