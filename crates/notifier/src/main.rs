use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use courier_common::config::AppConfig;
use courier_common::{db, redis_pool};
use courier_engine::idempotency::{
    IdempotencyStore, InMemoryIdempotencyStore, RedisIdempotencyStore,
};
use courier_engine::rate_limiter::{RateLimiter, RateLimiterConfig};
use courier_engine::retry::RetryPolicy;
use courier_notifier::campaign::PgCampaignStore;
use courier_notifier::outbox::PgOutboxStore;
use courier_notifier::scheduler::{CampaignScheduler, SchedulerConfig};
use courier_notifier::telegram::TelegramDispatcher;
use courier_notifier::telemetry;
use courier_notifier::worker::{OutboxWorker, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_notifier=info,courier_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Courier notifier starting...");

    let config = AppConfig::from_env()?;
    let limits = &config.limits;

    let bot_token = config
        .telegram_bot_token
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("TELEGRAM_BOT_TOKEN environment variable is required"))?;

    if let Some(addr) = config.metrics_addr {
        telemetry::install_prometheus(addr, &limits.duration_percentiles)?;
    }

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::migrate(&pool).await?;

    let idempotency: Arc<dyn IdempotencyStore> = match &config.redis_url {
        Some(url) => {
            let redis = redis_pool::create_redis_pool(url).await?;
            Arc::new(RedisIdempotencyStore::new(redis, limits.idempotency_ttl))
        }
        None => {
            tracing::warn!("REDIS_URL not set, idempotency marks are process-local");
            Arc::new(InMemoryIdempotencyStore::new(
                limits.idempotency_ttl,
                limits.idempotency_cleanup_size,
            ))
        }
    };

    let outbox = Arc::new(PgOutboxStore::new(pool.clone()));
    let campaigns = Arc::new(PgCampaignStore::new(pool));
    let dispatcher = Arc::new(TelegramDispatcher::new(&config.telegram_api_url, bot_token)?);
    let limiter = Arc::new(RateLimiter::new(&RateLimiterConfig::from(limits)));

    let worker = OutboxWorker::new(
        outbox.clone(),
        dispatcher,
        limiter,
        idempotency,
        RetryPolicy::from(limits),
        WorkerConfig::from(limits),
    );
    let scheduler = CampaignScheduler::new(campaigns, outbox, SchedulerConfig::from(limits));

    let cancel = CancellationToken::new();
    let worker_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });
    let scheduler_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");
    cancel.cancel();

    // Claimed batches are finished before the worker returns.
    let (worker_result, scheduler_result) = tokio::join!(worker_task, scheduler_task);
    if let Err(e) = worker_result {
        tracing::error!(error = %e, "Outbox worker task failed");
    }
    if let Err(e) = scheduler_result {
        tracing::error!(error = %e, "Campaign scheduler task failed");
    }

    tracing::info!("Courier notifier stopped.");
    Ok(())
}
