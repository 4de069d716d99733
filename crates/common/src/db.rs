use std::time::Duration;

use anyhow::Context;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create the pool shared by the outbox worker, the campaign scheduler and their stores.
///
/// Connections are held only for a claim, a status update or one campaign batch
/// transaction, never across a provider call, so the pool size bounds store concurrency
/// rather than send concurrency. A worker that cannot get a connection within the acquire
/// timeout logs a transient store error and tries again on its next loop.
pub async fn create_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(300))
        .connect(database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    tracing::info!(max_connections, "Connected to PostgreSQL");
    Ok(pool)
}

/// Create or upgrade the `notifications_outbox` and `notify_campaign*` tables.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("Failed to apply notification migrations")?;
    tracing::info!("Database migrations applied");
    Ok(())
}
