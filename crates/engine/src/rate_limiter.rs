//! Admission control: a global token bucket plus one bucket per subject (chat).
//!
//! Refill is lazy: tokens are recomputed from elapsed time whenever somebody tries to
//! take one, so there is no background timer. Subject buckets live in a concurrent map
//! and are evicted from within `try_acquire` once the map grows past a threshold and an
//! entry has not been touched for the configured TTL.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use courier_common::config::NotifyLimits;

/// Smallest accepted bucket capacity.
const MIN_CAPACITY: f64 = 1.0;

/// Smallest accepted refill rate, tokens per second.
const MIN_REFILL_PER_SEC: f64 = 0.1;

/// Upper bound on how often a subject sweep may run.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    /// Provider asked us to back off this bucket until then.
    blocked_until: Option<Instant>,
}

/// Thread-safe token bucket.
///
/// Out-of-range settings are clamped rather than rejected: capacity to at least 1 token,
/// refill rate to at least 0.1 tokens per second.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self::new_at(capacity, refill_per_sec, Instant::now())
    }

    /// Create a full bucket whose refill clock starts at `now`.
    pub fn new_at(capacity: f64, refill_per_sec: f64, now: Instant) -> Self {
        // f64::max returns the other operand for NaN, so NaN clamps too.
        let capacity = capacity.max(MIN_CAPACITY);
        let refill_per_sec = refill_per_sec.max(MIN_REFILL_PER_SEC);
        Self {
            capacity,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
                blocked_until: None,
            }),
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }

    /// Try to take one token. Never blocks.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        if let Some(until) = state.blocked_until {
            if now < until {
                return false;
            }
            state.blocked_until = None;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Give back a token taken by a send that did not go out. Never exceeds capacity.
    pub fn refund(&self) {
        let mut state = self.state.lock();
        state.tokens = (state.tokens + 1.0).min(self.capacity);
    }

    /// Deny every acquisition until `until`. Exactly one token is available when the block
    /// lifts; refill resumes from that point.
    pub fn block_until(&self, until: Instant) {
        let mut state = self.state.lock();
        state.tokens = 1.0_f64.min(self.capacity);
        state.last_refill = until.max(state.last_refill);
        state.blocked_until = Some(state.blocked_until.map_or(until, |b| b.max(until)));
    }

    /// How long until one token will be available.
    pub fn retry_after_at(&self, now: Instant) -> Duration {
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        let blocked = state
            .blocked_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default();
        let missing = (1.0 - state.tokens).max(0.0);
        let refill = Duration::from_secs_f64(missing / self.refill_per_sec);

        blocked.max(refill)
    }

    /// Currently available tokens, after refilling up to `now`.
    pub fn available_at(&self, now: Instant) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }
        state.tokens =
            (state.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }
}

#[derive(Debug)]
struct SubjectEntry {
    bucket: TokenBucket,
    last_seen: Instant,
}

/// Per-subject buckets with lazy TTL eviction.
#[derive(Debug)]
pub struct SubjectBucketStore {
    capacity: f64,
    refill_per_sec: f64,
    ttl: Duration,
    cleanup_threshold: usize,
    entries: DashMap<String, SubjectEntry>,
    sweeping: AtomicBool,
    last_sweep: Mutex<Option<Instant>>,
}

impl SubjectBucketStore {
    pub fn new(capacity: f64, refill_per_sec: f64, ttl: Duration, cleanup_threshold: usize) -> Self {
        Self {
            capacity,
            refill_per_sec,
            ttl,
            cleanup_threshold: cleanup_threshold.max(1),
            entries: DashMap::new(),
            sweeping: AtomicBool::new(false),
            last_sweep: Mutex::new(None),
        }
    }

    pub fn try_acquire(&self, subject: &str) -> bool {
        self.try_acquire_at(subject, Instant::now())
    }

    /// Take a token from the subject's bucket, creating the bucket on first use.
    ///
    /// The entry is touched and debited while its shard lock is held, so a concurrent
    /// sweep either sees the fresh `last_seen` or runs strictly before the touch.
    pub fn try_acquire_at(&self, subject: &str, now: Instant) -> bool {
        let granted = match self.entries.get_mut(subject) {
            Some(mut entry) => {
                entry.last_seen = now;
                entry.bucket.try_acquire_at(now)
            }
            None => {
                let mut entry = self
                    .entries
                    .entry(subject.to_owned())
                    .or_insert_with(|| SubjectEntry {
                        bucket: TokenBucket::new_at(self.capacity, self.refill_per_sec, now),
                        last_seen: now,
                    });
                entry.last_seen = now;
                entry.bucket.try_acquire_at(now)
            }
        };

        self.cleanup_if_needed(now);
        granted
    }

    /// Block a subject until `until`, creating its bucket if needed.
    pub fn block_until(&self, subject: &str, now: Instant, until: Instant) {
        let mut entry = self
            .entries
            .entry(subject.to_owned())
            .or_insert_with(|| SubjectEntry {
                bucket: TokenBucket::new_at(self.capacity, self.refill_per_sec, now),
                last_seen: now,
            });
        entry.last_seen = now;
        entry.bucket.block_until(until);
    }

    pub fn retry_after_at(&self, subject: &str, now: Instant) -> Duration {
        self.entries
            .get(subject)
            .map(|entry| entry.bucket.retry_after_at(now))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict stale subjects once the map has grown past the threshold.
    ///
    /// Only one sweep runs at a time and sweeps are spaced by `min(ttl, 1s)`, which keeps
    /// the amortized cost per acquisition constant even when nothing is stale yet.
    fn cleanup_if_needed(&self, now: Instant) {
        if self.entries.len() < self.cleanup_threshold {
            return;
        }

        let min_gap = self.ttl.min(MAX_SWEEP_INTERVAL);
        {
            let last = self.last_sweep.lock();
            if let Some(at) = *last
                && now.saturating_duration_since(at) < min_gap
            {
                return;
            }
        }

        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| now.saturating_duration_since(e.last_seen) >= self.ttl)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0usize;
        for key in stale {
            // Re-check under the shard write lock: the entry may have been touched since.
            if self
                .entries
                .remove_if(&key, |_, e| {
                    now.saturating_duration_since(e.last_seen) >= self.ttl
                })
                .is_some()
            {
                removed += 1;
            }
        }

        *self.last_sweep.lock() = Some(now);
        self.sweeping.store(false, Ordering::Release);

        if removed > 0 {
            tracing::debug!(
                removed,
                remaining = self.entries.len(),
                "Evicted stale subject buckets"
            );
        }
    }
}

/// Which bucket denied a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    Global,
    Subject,
}

impl LimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitScope::Global => "global",
            LimitScope::Subject => "subject",
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// Not an error: the caller should defer the send by roughly `retry_after`.
    Denied {
        scope: LimitScope,
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

/// Bucket settings for the limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub global_capacity: f64,
    pub global_refill_per_sec: f64,
    pub subject_capacity: f64,
    pub subject_refill_per_sec: f64,
    pub subject_ttl: Duration,
    pub cleanup_threshold: usize,
}

impl From<&NotifyLimits> for RateLimiterConfig {
    fn from(limits: &NotifyLimits) -> Self {
        Self {
            global_capacity: limits.global_capacity,
            global_refill_per_sec: limits.global_refill_per_sec,
            subject_capacity: limits.chat_capacity,
            subject_refill_per_sec: limits.chat_refill_per_sec,
            subject_ttl: limits.subject_ttl,
            cleanup_threshold: limits.subject_cleanup_threshold,
        }
    }
}

/// Two-tier limiter: the global bucket guards aggregate throughput, subject buckets
/// guard per-chat bursts. Both must grant before a send proceeds.
#[derive(Debug)]
pub struct RateLimiter {
    global: TokenBucket,
    subjects: SubjectBucketStore,
}

impl RateLimiter {
    pub fn new(config: &RateLimiterConfig) -> Self {
        Self {
            global: TokenBucket::new(config.global_capacity, config.global_refill_per_sec),
            subjects: SubjectBucketStore::new(
                config.subject_capacity,
                config.subject_refill_per_sec,
                config.subject_ttl,
                config.cleanup_threshold,
            ),
        }
    }

    pub fn try_acquire(&self, subject: &str) -> Admission {
        self.try_acquire_at(subject, Instant::now())
    }

    /// Global bucket first, then the subject bucket.
    ///
    /// A global token taken for a send the subject bucket then denies is refunded, so
    /// a busy chat cannot burn aggregate throughput it never uses.
    pub fn try_acquire_at(&self, subject: &str, now: Instant) -> Admission {
        if !self.global.try_acquire_at(now) {
            return Admission::Denied {
                scope: LimitScope::Global,
                retry_after: self.global.retry_after_at(now),
            };
        }

        if !self.subjects.try_acquire_at(subject, now) {
            self.global.refund();
            return Admission::Denied {
                scope: LimitScope::Subject,
                retry_after: self.subjects.retry_after_at(subject, now),
            };
        }

        Admission::Granted
    }

    /// Feed a provider rate-limit signal back into the subject's bucket.
    pub fn penalize(&self, subject: &str, retry_after: Duration) {
        let now = Instant::now();
        self.subjects.block_until(subject, now, now + retry_after);
        tracing::debug!(
            subject,
            retry_after_ms = retry_after.as_millis() as u64,
            "Subject blocked after provider throttling"
        );
    }

    pub fn tracked_subjects(&self) -> usize {
        self.subjects.len()
    }
}
