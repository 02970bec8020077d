//! Matchday Shared
//!
//! Infrastructure pieces used by both the API server and the worker:
//! database pool construction, the migration runner, and normalization of
//! provider timestamps at the store boundary.

pub mod timestamp;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub use timestamp::normalize_event_timestamp;

/// Create the application database pool.
///
/// Sized for the API server; the worker uses the same settings with a
/// smaller ceiling via `PgPoolOptions` directly if it ever needs to.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::info!("Database pool created");
    Ok(pool)
}

/// Create a pool for running migrations.
///
/// Migrations need a direct connection (PgBouncer in transaction mode does
/// not support the prepared statements sqlx's migrator issues) and tolerate
/// longer statements than request handling does.
pub async fn create_migration_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
}

/// Run all pending migrations from the workspace `migrations/` directory.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}
