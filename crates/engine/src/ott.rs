//! One-time tokens: short-lived, single-use handles for a payload (deep links,
//! confirmation buttons and the like).
//!
//! Tokens are base64url strings of OS-random bytes. The store is bounded: once it is
//! full, expired entries go first and then the oldest issued ones, so `issue` never fails.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};

use courier_common::config::NotifyLimits;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OttError {
    /// Unknown, malformed or already consumed.
    #[error("token not found")]
    NotFound,

    #[error("token expired")]
    Expired,
}

/// Store limits and token shape.
#[derive(Debug, Clone)]
pub struct OttConfig {
    pub default_ttl: Duration,
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    pub max_entries: usize,
    pub cleanup_threshold: usize,
    pub token_base_bytes: usize,
    pub token_extra_bytes: usize,
    pub token_max_length: usize,
}

impl Default for OttConfig {
    fn default() -> Self {
        Self::from(&NotifyLimits::default())
    }
}

impl From<&NotifyLimits> for OttConfig {
    fn from(limits: &NotifyLimits) -> Self {
        let max_entries = limits.ott_max_entries.max(limits.ott_min_entries).max(1);
        let min_ttl = limits.ott_min_ttl;
        let max_ttl = limits.ott_max_ttl.max(min_ttl);
        Self {
            default_ttl: limits.ott_ttl.clamp(min_ttl, max_ttl),
            min_ttl,
            max_ttl,
            max_entries,
            cleanup_threshold: limits
                .ott_cleanup_threshold
                .min(max_entries / 2)
                .max(1),
            token_base_bytes: limits.ott_token_base_bytes.max(1),
            token_extra_bytes: limits.ott_token_extra_bytes,
            token_max_length: limits.ott_token_max_length.max(1),
        }
    }
}

#[derive(Debug)]
struct Issued<T> {
    payload: T,
    expires_at: Instant,
}

/// Bounded single-use token store.
pub struct OneTimeTokenStore<T> {
    config: OttConfig,
    entries: DashMap<String, Issued<T>>,
    /// Tokens in issuance order. May hold consumed tokens until compacted; its length stays
    /// within twice the live count or the cleanup threshold, whichever is larger.
    order: Mutex<VecDeque<String>>,
}

impl<T> OneTimeTokenStore<T> {
    pub fn new(config: OttConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
        }
    }

    /// Issue a token for `payload`. `ttl` defaults to the configured TTL and is clamped
    /// to the allowed range.
    pub fn issue(&self, payload: T, ttl: Option<Duration>) -> String {
        self.issue_at(payload, ttl, Instant::now())
    }

    pub fn issue_at(&self, payload: T, ttl: Option<Duration>, now: Instant) -> String {
        let ttl = ttl
            .unwrap_or(self.config.default_ttl)
            .clamp(self.config.min_ttl, self.config.max_ttl);

        let mut order = self.order.lock();
        self.make_room(&mut order, now);

        let token = loop {
            let candidate = self.generate_token();
            if let Entry::Vacant(slot) = self.entries.entry(candidate.clone()) {
                slot.insert(Issued {
                    payload,
                    expires_at: now + ttl,
                });
                break candidate;
            }
        };
        order.push_back(token.clone());

        metrics::counter!("ott.issued").increment(1);
        token
    }

    /// Redeem a token. Succeeds at most once per issued token.
    pub fn consume(&self, token: &str) -> Result<T, OttError> {
        self.consume_at(token, Instant::now())
    }

    pub fn consume_at(&self, token: &str, now: Instant) -> Result<T, OttError> {
        let Some((_, entry)) = self.entries.remove(token) else {
            metrics::counter!("ott.replayed").increment(1);
            return Err(OttError::NotFound);
        };

        if now >= entry.expires_at {
            return Err(OttError::Expired);
        }

        metrics::counter!("ott.consumed").increment(1);
        Ok(entry.payload)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn make_room(&self, order: &mut VecDeque<String>, now: Instant) {
        if self.entries.len() > self.config.cleanup_threshold {
            self.sweep_expired(order, now);
        }

        // Consumed tokens leave `entries` only.
        let live = self.entries.len();
        if order.len() > live.saturating_mul(2).max(self.config.cleanup_threshold) {
            order.retain(|token| self.entries.contains_key(token));
        }

        if self.entries.len() < self.config.max_entries {
            return;
        }

        self.sweep_expired(order, now);
        let mut evicted = 0usize;
        while self.entries.len() >= self.config.max_entries {
            let Some(oldest) = order.pop_front() else {
                break;
            };
            if self.entries.remove(&oldest).is_some() {
                evicted += 1;
            }
        }

        if evicted > 0 {
            tracing::warn!(
                evicted,
                max_entries = self.config.max_entries,
                "One-time token store full, evicted oldest tokens"
            );
        }
    }

    fn sweep_expired(&self, order: &mut VecDeque<String>, now: Instant) {
        self.entries.retain(|_, entry| entry.expires_at > now);
        order.retain(|token| self.entries.contains_key(token));
    }

    fn generate_token(&self) -> String {
        let mut rng = OsRng;
        let len = self.config.token_base_bytes + rng.gen_range(0..=self.config.token_extra_bytes);
        let mut bytes = vec![0u8; len];
        rng.fill_bytes(&mut bytes);

        let mut token = URL_SAFE_NO_PAD.encode(&bytes);
        token.truncate(self.config.token_max_length);
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_entries: usize) -> OttConfig {
        OttConfig {
            max_entries,
            cleanup_threshold: (max_entries / 2).max(1),
            ..OttConfig::default()
        }
    }

    #[test]
    fn test_token_is_single_use() {
        let store = OneTimeTokenStore::new(OttConfig::default());
        let token = store.issue("order:42".to_string(), None);

        assert_eq!(store.consume(&token), Ok("order:42".to_string()));
        assert_eq!(store.consume(&token), Err(OttError::NotFound));
        assert!(store.is_empty());
    }

    #[test]
    fn test_token_shape() {
        let store = OneTimeTokenStore::new(OttConfig::default());
        for _ in 0..200 {
            let token = store.issue((), None);
            // 20..=24 bytes encode to 27..=32 characters.
            assert!((27..=32).contains(&token.len()), "{token}");
            assert!(
                token
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            );
        }
        assert_eq!(store.len(), 200);
    }

    #[test]
    fn test_token_truncated_to_max_length() {
        let store = OneTimeTokenStore::new(OttConfig {
            token_base_bytes: 64,
            token_max_length: 16,
            ..OttConfig::default()
        });
        assert_eq!(store.issue(1, None).len(), 16);
    }

    #[test]
    fn test_expired_token_is_rejected_and_removed() {
        let store = OneTimeTokenStore::new(OttConfig::default());
        let now = Instant::now();
        let token = store.issue_at(7, Some(Duration::from_secs(60)), now);

        assert_eq!(
            store.consume_at(&token, now + Duration::from_secs(61)),
            Err(OttError::Expired)
        );
        assert_eq!(
            store.consume_at(&token, now + Duration::from_secs(61)),
            Err(OttError::NotFound)
        );
    }

    #[test]
    fn test_ttl_is_clamped() {
        let store = OneTimeTokenStore::new(OttConfig::default());
        let now = Instant::now();

        // 1s is raised to the 30s minimum.
        let short = store.issue_at(1, Some(Duration::from_secs(1)), now);
        assert_eq!(store.consume_at(&short, now + Duration::from_secs(20)), Ok(1));

        // 1 day is capped at the 1h maximum.
        let long = store.issue_at(2, Some(Duration::from_secs(86_400)), now);
        assert_eq!(
            store.consume_at(&long, now + Duration::from_secs(3_601)),
            Err(OttError::Expired)
        );
    }

    #[test]
    fn test_malformed_tokens_are_not_found() {
        let store: OneTimeTokenStore<u8> = OneTimeTokenStore::new(OttConfig::default());
        let long = "x".repeat(10_000);
        for token in ["", "not a token", "💥", long.as_str()] {
            assert_eq!(store.consume(token), Err(OttError::NotFound));
        }
    }

    #[test]
    fn test_full_store_evicts_expired_before_oldest() {
        let store = OneTimeTokenStore::new(config(3));
        let now = Instant::now();
        let minute = Duration::from_secs(60);

        let oldest = store.issue_at("a", Some(Duration::from_secs(600)), now);
        let short_lived = store.issue_at("b", Some(minute), now);
        let third = store.issue_at("c", Some(Duration::from_secs(600)), now);

        // "b" has expired by now, so it makes room instead of the oldest.
        let later = now + Duration::from_secs(120);
        let fourth = store.issue_at("d", None, later);
        assert_eq!(store.len(), 3);
        assert_eq!(store.consume_at(&short_lived, later), Err(OttError::NotFound));

        // Nothing expired any more: the oldest issued token goes.
        let fifth = store.issue_at("e", None, later);
        assert_eq!(store.len(), 3);
        assert_eq!(store.consume_at(&oldest, later), Err(OttError::NotFound));
        assert_eq!(store.consume_at(&third, later), Ok("c"));
        assert_eq!(store.consume_at(&fourth, later), Ok("d"));
        assert_eq!(store.consume_at(&fifth, later), Ok("e"));
    }

    #[test]
    fn test_eviction_skips_already_consumed_tokens() {
        let store = OneTimeTokenStore::new(config(2));
        let now = Instant::now();

        let first = store.issue_at(1, None, now);
        let second = store.issue_at(2, None, now);
        assert_eq!(store.consume_at(&first, now), Ok(1));

        let third = store.issue_at(3, None, now);
        let fourth = store.issue_at(4, None, now);

        assert_eq!(store.len(), 2);
        assert_eq!(store.consume_at(&second, now), Err(OttError::NotFound));
        assert_eq!(store.consume_at(&third, now), Ok(3));
        assert_eq!(store.consume_at(&fourth, now), Ok(4));
    }

    #[test]
    fn test_issue_consume_cycle_keeps_order_bounded() {
        let store = OneTimeTokenStore::new(config(1_000));
        let now = Instant::now();

        for i in 0..20_000 {
            let token = store.issue_at(i, None, now);
            assert_eq!(store.consume_at(&token, now), Ok(i));
        }

        assert!(store.is_empty());
        let queued = store.order.lock().len();
        assert!(queued <= store.config.cleanup_threshold + 1, "{queued}");
    }

    #[test]
    fn test_compaction_keeps_live_tokens_in_order() {
        let store = OneTimeTokenStore::new(OttConfig {
            max_entries: 4,
            cleanup_threshold: 2,
            ..OttConfig::default()
        });
        let now = Instant::now();

        let keep = store.issue_at("keep", None, now);
        for _ in 0..50 {
            let token = store.issue_at("churn", None, now);
            store.consume_at(&token, now).unwrap();
        }
        let second = store.issue_at("second", None, now);
        let third = store.issue_at("third", None, now);
        let fourth = store.issue_at("fourth", None, now);

        // Still the oldest live token, so it is the one evicted.
        let fifth = store.issue_at("fifth", None, now);
        assert_eq!(store.consume_at(&keep, now), Err(OttError::NotFound));
        assert_eq!(store.consume_at(&second, now), Ok("second"));
        assert_eq!(store.consume_at(&third, now), Ok("third"));
        assert_eq!(store.consume_at(&fourth, now), Ok("fourth"));
        assert_eq!(store.consume_at(&fifth, now), Ok("fifth"));
    }

    #[test]
    fn test_concurrent_consume_succeeds_once() {
        let store = std::sync::Arc::new(OneTimeTokenStore::new(OttConfig::default()));
        let token = store.issue(99u32, None);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let token = token.clone();
                std::thread::spawn(move || store.consume(&token).is_ok())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
    }
}
