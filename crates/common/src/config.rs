use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string. When set, idempotency marks are shared through Redis.
    pub redis_url: Option<String>,

    /// Telegram bot token
    pub telegram_bot_token: Option<String>,

    /// Bot API base URL (default: https://api.telegram.org)
    pub telegram_api_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Listen address for the Prometheus scrape endpoint
    pub metrics_addr: Option<SocketAddr>,

    /// Delivery, rate-limit and token-store tuning
    pub limits: NotifyLimits,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL").ok(),
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_api_url: std::env::var("TELEGRAM_API_URL")
                .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 20)?,
            metrics_addr: std::env::var("METRICS_ADDR")
                .ok()
                .map(|raw| {
                    raw.parse()
                        .map_err(|_| anyhow::anyhow!("METRICS_ADDR must be a socket address"))
                })
                .transpose()?,
            limits: NotifyLimits::from_env()?,
        })
    }
}

/// Tunables for the delivery pipeline.
///
/// Defaults mirror the production limits: a 24h idempotency window, 5 minute
/// one-time tokens, 500ms..15s send backoff with three attempts.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifyLimits {
    // Idempotency
    pub idempotency_ttl: Duration,
    pub idempotency_cleanup_size: usize,

    // One-time tokens
    pub ott_ttl: Duration,
    pub ott_min_ttl: Duration,
    pub ott_max_ttl: Duration,
    pub ott_max_entries: usize,
    pub ott_min_entries: usize,
    pub ott_cleanup_threshold: usize,
    pub ott_token_base_bytes: usize,
    pub ott_token_extra_bytes: usize,
    pub ott_token_max_length: usize,

    // Send backoff
    pub send_base_backoff: Duration,
    pub send_max_backoff: Duration,
    pub send_jitter: Duration,
    pub send_max_attempts: u32,
    pub retry_after_fallback: Duration,
    pub backoff_max_shift: u32,
    pub duration_percentiles: Vec<f64>,

    // Admission control
    pub global_capacity: f64,
    pub global_refill_per_sec: f64,
    pub chat_capacity: f64,
    pub chat_refill_per_sec: f64,
    pub subject_ttl: Duration,
    pub subject_cleanup_threshold: usize,

    // Outbox worker
    pub worker_parallelism: usize,
    pub worker_batch_size: usize,
    pub worker_idle_delay: Duration,
    pub admission_max_delay: Duration,
    pub stale_claim_grace: Duration,

    // Campaign scheduler
    pub campaign_batch_size: usize,
    pub campaign_tick_interval: Duration,
    pub outbox_depth_ceiling: u64,
}

impl Default for NotifyLimits {
    fn default() -> Self {
        Self {
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            idempotency_cleanup_size: 50_000,

            ott_ttl: Duration::from_secs(300),
            ott_min_ttl: Duration::from_secs(30),
            ott_max_ttl: Duration::from_secs(3600),
            ott_max_entries: 100_000,
            ott_min_entries: 1,
            ott_cleanup_threshold: 10_000,
            ott_token_base_bytes: 20,
            ott_token_extra_bytes: 4,
            ott_token_max_length: 64,

            send_base_backoff: Duration::from_millis(500),
            send_max_backoff: Duration::from_millis(15_000),
            send_jitter: Duration::from_millis(100),
            send_max_attempts: 3,
            retry_after_fallback: Duration::from_secs(1),
            backoff_max_shift: 20,
            duration_percentiles: vec![0.5, 0.95],

            global_capacity: 30.0,
            global_refill_per_sec: 30.0,
            chat_capacity: 1.0,
            chat_refill_per_sec: 1.0,
            subject_ttl: Duration::from_secs(600),
            subject_cleanup_threshold: 10_000,

            worker_parallelism: 4,
            worker_batch_size: 50,
            worker_idle_delay: Duration::from_millis(1000),
            admission_max_delay: Duration::from_millis(1000),
            stale_claim_grace: Duration::from_secs(300),

            campaign_batch_size: 1_000,
            campaign_tick_interval: Duration::from_secs(10),
            outbox_depth_ceiling: 50_000,
        }
    }
}

impl NotifyLimits {
    /// Load limits from the environment, falling back to defaults for unset variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let d = Self::default();

        Ok(Self {
            idempotency_ttl: secs_or("NOTIFY_IDEMPOTENCY_TTL_SECS", d.idempotency_ttl)?,
            idempotency_cleanup_size: env_or(
                "NOTIFY_IDEMPOTENCY_CLEANUP_SIZE",
                d.idempotency_cleanup_size,
            )?,

            ott_ttl: secs_or("OTT_TTL_SECS", d.ott_ttl)?,
            ott_min_ttl: secs_or("OTT_MIN_TTL_SECS", d.ott_min_ttl)?,
            ott_max_ttl: secs_or("OTT_MAX_TTL_SECS", d.ott_max_ttl)?,
            ott_max_entries: env_or("OTT_MAX_ENTRIES", d.ott_max_entries)?,
            ott_min_entries: env_or("OTT_MIN_ENTRIES", d.ott_min_entries)?,
            ott_cleanup_threshold: env_or("OTT_CLEANUP_THRESHOLD", d.ott_cleanup_threshold)?,
            ott_token_base_bytes: env_or("OTT_TOKEN_BASE_BYTES", d.ott_token_base_bytes)?,
            ott_token_extra_bytes: env_or("OTT_TOKEN_EXTRA_BYTES", d.ott_token_extra_bytes)?,
            ott_token_max_length: env_or("OTT_TOKEN_MAX_LENGTH", d.ott_token_max_length)?,

            send_base_backoff: millis_or("NOTIFY_BASE_BACKOFF_MS", d.send_base_backoff)?,
            send_max_backoff: millis_or("NOTIFY_MAX_BACKOFF_MS", d.send_max_backoff)?,
            send_jitter: millis_or("NOTIFY_JITTER_MS", d.send_jitter)?,
            send_max_attempts: env_or("NOTIFY_MAX_ATTEMPTS", d.send_max_attempts)?,
            retry_after_fallback: millis_or(
                "NOTIFY_RETRY_AFTER_FALLBACK_MS",
                d.retry_after_fallback,
            )?,
            backoff_max_shift: env_or("NOTIFY_BACKOFF_MAX_SHIFT", d.backoff_max_shift)?,
            duration_percentiles: match std::env::var("NOTIFY_DURATION_PERCENTILES") {
                Ok(raw) => parse_percentiles(&raw)?,
                Err(_) => d.duration_percentiles,
            },

            global_capacity: env_or("NOTIFY_GLOBAL_CAPACITY", d.global_capacity)?,
            global_refill_per_sec: env_or("NOTIFY_GLOBAL_RPS", d.global_refill_per_sec)?,
            chat_capacity: env_or("NOTIFY_CHAT_CAPACITY", d.chat_capacity)?,
            chat_refill_per_sec: env_or("NOTIFY_CHAT_RPS", d.chat_refill_per_sec)?,
            subject_ttl: secs_or("NOTIFY_SUBJECT_TTL_SECS", d.subject_ttl)?,
            subject_cleanup_threshold: env_or(
                "NOTIFY_SUBJECT_CLEANUP_THRESHOLD",
                d.subject_cleanup_threshold,
            )?,

            worker_parallelism: env_or("NOTIFY_WORKER_PARALLELISM", d.worker_parallelism)?,
            worker_batch_size: env_or("NOTIFY_WORKER_BATCH_SIZE", d.worker_batch_size)?,
            worker_idle_delay: millis_or("NOTIFY_WORKER_IDLE_MS", d.worker_idle_delay)?,
            admission_max_delay: millis_or("NOTIFY_ADMISSION_MAX_DELAY_MS", d.admission_max_delay)?,
            stale_claim_grace: secs_or("NOTIFY_STALE_CLAIM_GRACE_SECS", d.stale_claim_grace)?,

            campaign_batch_size: env_or("SCHEDULER_BATCH", d.campaign_batch_size)?,
            campaign_tick_interval: millis_or("SCHEDULER_TICK_MS", d.campaign_tick_interval)?,
            outbox_depth_ceiling: env_or("NOTIFY_OUTBOX_DEPTH_CEILING", d.outbox_depth_ceiling)?,
        })
    }
}

/// Read and parse an environment variable, using `default` when it is unset.
fn env_or<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}

fn secs_or(name: &str, default: Duration) -> anyhow::Result<Duration> {
    env_or(name, default.as_secs()).map(Duration::from_secs)
}

fn millis_or(name: &str, default: Duration) -> anyhow::Result<Duration> {
    env_or(name, default.as_millis() as u64).map(Duration::from_millis)
}

/// Parse a comma-separated list of quantiles such as `0.5,0.95`.
fn parse_percentiles(raw: &str) -> anyhow::Result<Vec<f64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let q: f64 = s
                .parse()
                .map_err(|_| anyhow::anyhow!("NOTIFY_DURATION_PERCENTILES: invalid value {:?}", s))?;
            if !(0.0..=1.0).contains(&q) {
                anyhow::bail!("NOTIFY_DURATION_PERCENTILES: {} is outside 0..=1", q);
            }
            Ok(q)
        })
        .collect()
}
