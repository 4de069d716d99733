use anyhow::Context;
use redis::Client;
use redis::aio::ConnectionManager;

/// Connect the Redis idempotency store.
///
/// The connection is checked with a `PING` up front: when `REDIS_URL` is set but wrong,
/// startup fails instead of every delivery later failing its idempotency check.
/// `ConnectionManager` reconnects on its own afterwards, so one clone per store is enough.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url).context("Invalid REDIS_URL")?;
    let mut manager = ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;

    let _: String = redis::cmd("PING")
        .query_async(&mut manager)
        .await
        .context("Redis did not answer PING")?;

    tracing::info!("Connected to Redis");
    Ok(manager)
}
