//! Delivery idempotency marks.
//!
//! The outbox's unique key already stops duplicate rows. These marks cover the gap
//! between a successful provider call and the row being marked SENT: if that write is
//! lost, the recovered row is recognised as delivered instead of being sent again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;

use courier_common::error::AppError;

const REDIS_KEY_PREFIX: &str = "notify:idempotency:";

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Whether `key` was marked within the TTL.
    async fn seen(&self, key: &str) -> Result<bool, AppError>;

    async fn mark(&self, key: &str) -> Result<(), AppError>;
}

/// Process-local marks with TTL expiry.
pub struct InMemoryIdempotencyStore {
    ttl: Duration,
    cleanup_size: usize,
    entries: DashMap<String, Instant>,
    cleaning: AtomicBool,
}

impl InMemoryIdempotencyStore {
    pub fn new(ttl: Duration, cleanup_size: usize) -> Self {
        Self {
            ttl,
            cleanup_size: cleanup_size.max(1),
            entries: DashMap::new(),
            cleaning: AtomicBool::new(false),
        }
    }

    pub fn seen_at(&self, key: &str, now: Instant) -> bool {
        let expired = match self.entries.get(key) {
            Some(expires_at) => now >= *expires_at,
            None => return false,
        };
        if expired {
            self.entries.remove_if(key, |_, expires_at| now >= *expires_at);
            return false;
        }
        true
    }

    pub fn mark_at(&self, key: &str, now: Instant) {
        self.entries.insert(key.to_owned(), now + self.ttl);
        if self.entries.len() > self.cleanup_size {
            self.cleanup(now);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn cleanup(&self, now: Instant) {
        if self
            .cleaning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at > now);
        self.cleaning.store(false, Ordering::Release);

        tracing::debug!(
            removed = before.saturating_sub(self.entries.len()),
            remaining = self.entries.len(),
            "Idempotency marks cleaned up"
        );
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn seen(&self, key: &str) -> Result<bool, AppError> {
        Ok(self.seen_at(key, Instant::now()))
    }

    async fn mark(&self, key: &str) -> Result<(), AppError> {
        self.mark_at(key, Instant::now());
        Ok(())
    }
}

/// Marks shared between processes through Redis keys with an expiry.
pub struct RedisIdempotencyStore {
    redis: ConnectionManager,
    ttl_secs: u64,
}

impl RedisIdempotencyStore {
    pub fn new(redis: ConnectionManager, ttl: Duration) -> Self {
        Self {
            redis,
            ttl_secs: ttl.as_secs().max(1),
        }
    }

    fn key(key: &str) -> String {
        format!("{}{}", REDIS_KEY_PREFIX, key)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn seen(&self, key: &str) -> Result<bool, AppError> {
        let mut conn = self.redis.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(Self::key(key))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    async fn mark(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        // SET NX keeps the original expiry when the key is marked twice.
        let _: Option<String> = redis::cmd("SET")
            .arg(Self::key(key))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
