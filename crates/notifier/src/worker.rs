//! Outbox worker: claims due rows in batches and delivers them with bounded concurrency.
//!
//! Per message the worker consults the idempotency marks, asks the rate limiter for
//! admission, calls the dispatcher and records the outcome on the row. Admission denial
//! only defers the row; provider throttling and transient failures count as attempts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use courier_common::config::NotifyLimits;
use courier_common::error::AppError;
use courier_common::types::{OutboxMessage, OutboxStatus};
use courier_engine::idempotency::IdempotencyStore;
use courier_engine::rate_limiter::{Admission, RateLimiter};
use courier_engine::retry::RetryPolicy;

use crate::dispatcher::{DispatchResult, Dispatcher};
use crate::outbox::OutboxStore;
use crate::telemetry;

/// Shortest deferral after an admission denial.
const MIN_ADMISSION_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub parallelism: usize,
    pub idle_delay: Duration,
    /// Upper bound on how far an admission denial pushes a row out.
    pub admission_max_delay: Duration,
    pub stale_claim_grace: Duration,
}

impl From<&NotifyLimits> for WorkerConfig {
    fn from(limits: &NotifyLimits) -> Self {
        Self {
            batch_size: limits.worker_batch_size.max(1),
            parallelism: limits.worker_parallelism.max(1),
            idle_delay: limits.worker_idle_delay,
            admission_max_delay: limits.admission_max_delay,
            stale_claim_grace: limits.stale_claim_grace,
        }
    }
}

/// What happened to one claimed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    /// Finished without a provider call: already delivered or a duplicate.
    Deduplicated,
    /// Admission denied; back to NEW with the attempt count untouched.
    Deferred,
    /// Provider throttled or a transient failure; back to NEW for another attempt.
    Retrying,
    /// Permanently rejected by the provider.
    Failed,
    Dead,
    /// The outcome could not be stored; the row stays SENDING until recovered.
    Abandoned,
    /// The claim was recovered and given to another worker before the outcome was stored.
    LostClaim,
}

/// Counts for one claimed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub claimed: usize,
    pub sent: usize,
    pub deduplicated: usize,
    pub deferred: usize,
    pub retrying: usize,
    pub failed: usize,
    pub dead: usize,
    pub abandoned: usize,
    pub lost_claims: usize,
}

impl TickStats {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Sent => self.sent += 1,
            Outcome::Deduplicated => self.deduplicated += 1,
            Outcome::Deferred => self.deferred += 1,
            Outcome::Retrying => self.retrying += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Dead => self.dead += 1,
            Outcome::Abandoned => self.abandoned += 1,
            Outcome::LostClaim => self.lost_claims += 1,
        }
    }
}

pub struct OutboxWorker {
    worker_id: String,
    outbox: Arc<dyn OutboxStore>,
    dispatcher: Arc<dyn Dispatcher>,
    limiter: Arc<RateLimiter>,
    idempotency: Arc<dyn IdempotencyStore>,
    retry: RetryPolicy,
    config: WorkerConfig,
}

impl OutboxWorker {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        dispatcher: Arc<dyn Dispatcher>,
        limiter: Arc<RateLimiter>,
        idempotency: Arc<dyn IdempotencyStore>,
        retry: RetryPolicy,
        config: WorkerConfig,
    ) -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            outbox,
            dispatcher,
            limiter,
            idempotency,
            retry,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Drain the outbox until `cancel` fires. A batch that was already claimed is always
    /// processed to the end before the loop exits.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            worker_id = %self.worker_id,
            batch_size = self.config.batch_size,
            parallelism = self.config.parallelism,
            "Outbox worker started"
        );

        let mut last_recovery: Option<Instant> = None;

        while !cancel.is_cancelled() {
            if last_recovery.is_none_or(|at| at.elapsed() >= self.config.stale_claim_grace) {
                self.recover_stale().await;
                last_recovery = Some(Instant::now());
            }

            let claimed = match self.run_once().await {
                Ok(stats) => stats.claimed,
                Err(e) => {
                    log_store_error(&e, "Failed to claim outbox batch");
                    0
                }
            };

            if claimed == 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.idle_delay) => {}
                }
            }
        }

        tracing::info!(worker_id = %self.worker_id, "Outbox worker stopped");
    }

    /// Claim one batch and process it with at most `parallelism` messages in flight.
    pub async fn run_once(&self) -> Result<TickStats, AppError> {
        let fetch_started = Instant::now();
        let batch = self
            .outbox
            .claim_batch(self.config.batch_size, Utc::now(), &self.worker_id)
            .await?;
        metrics::histogram!(telemetry::FETCH_DURATION_MS).record(elapsed_ms(fetch_started));

        let stats = Mutex::new(TickStats {
            claimed: batch.len(),
            ..TickStats::default()
        });
        if batch.is_empty() {
            return Ok(stats.into_inner());
        }

        let stats_ref = &stats;
        futures::stream::iter(batch)
            .for_each_concurrent(self.config.parallelism, |message| async move {
                let outcome = self.process(message).await;
                stats_ref.lock().record(outcome);
            })
            .await;

        let stats = stats.into_inner();
        tracing::debug!(
            worker_id = %self.worker_id,
            claimed = stats.claimed,
            sent = stats.sent,
            deferred = stats.deferred,
            retrying = stats.retrying,
            dead = stats.dead,
            lost_claims = stats.lost_claims,
            "Outbox batch processed"
        );
        Ok(stats)
    }

    async fn recover_stale(&self) {
        match self.outbox.recover_stale(self.config.stale_claim_grace).await {
            Ok(0) => {}
            Ok(recovered) => {
                tracing::warn!(recovered, "Released stale outbox claims");
            }
            Err(e) => log_store_error(&e, "Failed to release stale outbox claims"),
        }
    }

    async fn process(&self, message: OutboxMessage) -> Outcome {
        let started = Instant::now();
        let outcome = match self.deliver(&message).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log_store_error(&e, "Failed to record delivery outcome");
                tracing::warn!(message_id = message.id, "Outbox row left for recovery");
                Outcome::Abandoned
            }
        };
        metrics::histogram!(telemetry::PROCESS_DURATION_MS).record(elapsed_ms(started));
        outcome
    }

    async fn deliver(&self, message: &OutboxMessage) -> Result<Outcome, AppError> {
        let method = message.method.as_str();
        let threaded = telemetry::threaded_label(message.is_threaded());
        let key = message.idempotency_key.as_str();

        // Delivered before, but the SENT write was lost.
        if self.idempotency.seen(key).await? {
            if !self
                .finish(message, OutboxStatus::Sent, message.attempt_count, None)
                .await?
            {
                return Ok(self.lost_claim(message));
            }
            metrics::counter!(telemetry::DEDUPLICATED, "method" => method, "threaded" => threaded)
                .increment(1);
            tracing::info!(
                message_id = message.id,
                idempotency_key = key,
                "Message already delivered, marked SENT"
            );
            return Ok(Outcome::Deduplicated);
        }

        if self.outbox.is_sent(key).await? {
            if !self
                .finish(
                    message,
                    OutboxStatus::Failed,
                    message.attempt_count,
                    Some("duplicate"),
                )
                .await?
            {
                return Ok(self.lost_claim(message));
            }
            metrics::counter!(telemetry::DEDUPLICATED, "method" => method, "threaded" => threaded)
                .increment(1);
            return Ok(Outcome::Deduplicated);
        }

        let subject = message.chat_id.to_string();
        if let Admission::Denied { scope, retry_after } = self.limiter.try_acquire(&subject) {
            let delay = retry_after
                .min(self.config.admission_max_delay)
                .max(MIN_ADMISSION_DELAY);
            if !self
                .outbox
                .reschedule(
                    message.id,
                    &self.worker_id,
                    due_in(delay),
                    message.attempt_count,
                    None,
                )
                .await?
            {
                return Ok(self.lost_claim(message));
            }
            metrics::counter!(telemetry::DEFERRED, "method" => method, "threaded" => threaded)
                .increment(1);
            tracing::debug!(
                message_id = message.id,
                chat_id = message.chat_id,
                scope = scope.as_str(),
                delay_ms = delay.as_millis() as u64,
                "Send deferred by rate limiter"
            );
            return Ok(Outcome::Deferred);
        }

        let send_started = Instant::now();
        let result = self
            .dispatcher
            .send(
                message.method,
                message.chat_id,
                &message.payload.0,
                message.thread_id,
            )
            .await;
        metrics::histogram!(telemetry::SEND_DURATION_MS).record(elapsed_ms(send_started));

        let attempts = message.attempt_count + 1;
        match result {
            DispatchResult::Ok(provider_message_id) => {
                // Mark first: if the SENT write below is lost, the recovered row is
                // recognised instead of being sent twice.
                if let Err(e) = self.idempotency.mark(key).await {
                    tracing::warn!(
                        message_id = message.id,
                        error = %e,
                        "Failed to store idempotency mark"
                    );
                }
                if !self
                    .finish(message, OutboxStatus::Sent, attempts, None)
                    .await?
                {
                    return Ok(self.lost_claim(message));
                }
                metrics::counter!(telemetry::SENT, "method" => method, "threaded" => threaded)
                    .increment(1);
                tracing::debug!(
                    message_id = message.id,
                    chat_id = message.chat_id,
                    provider_message_id,
                    attempt = attempts,
                    "Message sent"
                );
                Ok(Outcome::Sent)
            }
            DispatchResult::RateLimited(provider_delay) => {
                let delay = self.retry.retry_after(provider_delay);
                self.limiter.penalize(&subject, delay);
                metrics::counter!(telemetry::RATE_LIMITED, "method" => method, "threaded" => threaded)
                    .increment(1);
                self.retry_or_dead(message, attempts, delay, "rate limited by provider")
                    .await
            }
            DispatchResult::Failed(failure) if failure.permanent => {
                if !self
                    .finish(message, OutboxStatus::Failed, attempts, Some(&failure.reason))
                    .await?
                {
                    return Ok(self.lost_claim(message));
                }
                metrics::counter!(telemetry::FAILED, "method" => method, "threaded" => threaded)
                    .increment(1);
                tracing::warn!(
                    message_id = message.id,
                    chat_id = message.chat_id,
                    reason = %failure.reason,
                    "Message rejected by provider"
                );
                Ok(Outcome::Failed)
            }
            DispatchResult::Failed(failure) => {
                metrics::counter!(telemetry::FAILED, "method" => method, "threaded" => threaded)
                    .increment(1);
                let delay = self.retry.backoff(attempts.max(1) as u32);
                self.retry_or_dead(message, attempts, delay, &failure.reason)
                    .await
            }
        }
    }

    async fn retry_or_dead(
        &self,
        message: &OutboxMessage,
        attempts: i32,
        delay: Duration,
        reason: &str,
    ) -> Result<Outcome, AppError> {
        if self.retry.is_exhausted(attempts.max(0) as u32) {
            if !self
                .finish(message, OutboxStatus::Dead, attempts, Some(reason))
                .await?
            {
                return Ok(self.lost_claim(message));
            }
            metrics::counter!(
                telemetry::DEAD,
                "method" => message.method.as_str(),
                "threaded" => telemetry::threaded_label(message.is_threaded())
            )
            .increment(1);
            tracing::error!(
                message_id = message.id,
                chat_id = message.chat_id,
                attempt = attempts,
                reason,
                "Message moved to DEAD after exhausting retries"
            );
            return Ok(Outcome::Dead);
        }

        if !self
            .outbox
            .reschedule(
                message.id,
                &self.worker_id,
                due_in(delay),
                attempts,
                Some(reason),
            )
            .await?
        {
            return Ok(self.lost_claim(message));
        }
        tracing::info!(
            message_id = message.id,
            chat_id = message.chat_id,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            reason,
            "Send failed, retry scheduled"
        );
        Ok(Outcome::Retrying)
    }

    async fn finish(
        &self,
        message: &OutboxMessage,
        status: OutboxStatus,
        attempts: i32,
        error: Option<&str>,
    ) -> Result<bool, AppError> {
        self.outbox
            .mark_terminal(message.id, &self.worker_id, status, attempts, error)
            .await
    }

    fn lost_claim(&self, message: &OutboxMessage) -> Outcome {
        metrics::counter!(telemetry::LOST_CLAIM).increment(1);
        tracing::warn!(
            worker_id = %self.worker_id,
            message_id = message.id,
            "Outbox row was reclaimed by another worker, outcome dropped"
        );
        Outcome::LostClaim
    }
}

fn due_in(delay: Duration) -> chrono::DateTime<Utc> {
    let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(delay)
        .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC)
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1_000.0
}

fn log_store_error(e: &AppError, what: &str) {
    if e.is_transient() {
        tracing::warn!(error = %e, "{}", what);
    } else {
        tracing::error!(error = %e, "{}", what);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_stats_record() {
        let mut stats = TickStats::default();
        for outcome in [
            Outcome::Sent,
            Outcome::Sent,
            Outcome::Deferred,
            Outcome::Dead,
            Outcome::Abandoned,
            Outcome::LostClaim,
        ] {
            stats.record(outcome);
        }
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.deferred, 1);
        assert_eq!(stats.dead, 1);
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.lost_claims, 1);
    }

    #[test]
    fn test_worker_config_clamps_zero_values() {
        let limits = NotifyLimits {
            worker_batch_size: 0,
            worker_parallelism: 0,
            ..NotifyLimits::default()
        };
        let config = WorkerConfig::from(&limits);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.parallelism, 1);
    }

    #[test]
    fn test_due_in_saturates() {
        let far = due_in(Duration::MAX);
        assert!(far > Utc::now());
    }
}
