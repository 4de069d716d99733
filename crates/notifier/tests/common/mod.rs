//! In-memory stores and scripted dispatchers shared by the worker and scheduler tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::types::Json;
use tokio::sync::Notify;

use courier_common::config::NotifyLimits;
use courier_common::error::AppError;
use courier_common::types::{
    Campaign, CampaignProgress, CampaignStatus, MessageContent, NewOutboxMessage, OutboxMessage,
    OutboxStatus, SendMethod, campaign_target_key,
};
use courier_engine::idempotency::{IdempotencyStore, InMemoryIdempotencyStore};
use courier_engine::rate_limiter::{RateLimiter, RateLimiterConfig};
use courier_engine::retry::RetryPolicy;
use courier_notifier::campaign::CampaignStore;
use courier_notifier::dispatcher::{DispatchResult, Dispatcher};
use courier_notifier::outbox::OutboxStore;
use courier_notifier::worker::{OutboxWorker, WorkerConfig};

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryOutbox {
    rows: Mutex<Vec<OutboxMessage>>,
    claim_calls: AtomicUsize,
}

impl InMemoryOutbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rows(&self) -> Vec<OutboxMessage> {
        self.rows.lock().clone()
    }

    pub fn row(&self, id: i64) -> OutboxMessage {
        self.rows
            .lock()
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .expect("row exists")
    }

    pub fn count(&self, status: OutboxStatus) -> usize {
        self.rows.lock().iter().filter(|r| r.status == status).count()
    }

    /// How many times `claim_batch` was called.
    pub fn claim_calls(&self) -> usize {
        self.claim_calls.load(Ordering::SeqCst)
    }

    /// Insert a row that looks like it was claimed by a worker that died `age` ago.
    pub fn insert_stale_claim(&self, message: &NewOutboxMessage, age: Duration) -> i64 {
        let mut rows = self.rows.lock();
        let id = rows.len() as i64 + 1;
        let updated_at = Utc::now() - chrono::Duration::from_std(age).unwrap();
        let mut row = to_row(id, message);
        row.status = OutboxStatus::Sending;
        row.claimed_by = Some("worker-gone".into());
        row.updated_at = updated_at;
        rows.push(row);
        id
    }

    fn update<F>(&self, id: i64, worker_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut OutboxMessage),
    {
        let mut rows = self.rows.lock();
        match rows.iter_mut().find(|r| {
            r.id == id
                && r.status == OutboxStatus::Sending
                && r.claimed_by.as_deref() == Some(worker_id)
        }) {
            Some(row) => {
                f(row);
                row.claimed_by = None;
                row.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }
}

fn to_row(id: i64, message: &NewOutboxMessage) -> OutboxMessage {
    let now = Utc::now();
    OutboxMessage {
        id,
        chat_id: message.chat_id,
        thread_id: message.thread_id,
        method: message.method,
        payload: Json(message.payload.clone()),
        idempotency_key: message.idempotency_key.clone(),
        campaign_id: message.campaign_id,
        status: OutboxStatus::New,
        attempt_count: 0,
        next_attempt_at: now,
        last_error: None,
        claimed_by: None,
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn enqueue(&self, message: &NewOutboxMessage) -> Result<bool, AppError> {
        let mut rows = self.rows.lock();
        if rows
            .iter()
            .any(|r| r.idempotency_key == message.idempotency_key)
        {
            return Ok(false);
        }
        let id = rows.len() as i64 + 1;
        rows.push(to_row(id, message));
        Ok(true)
    }

    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        worker_id: &str,
    ) -> Result<Vec<OutboxMessage>, AppError> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.lock();
        let mut ready: Vec<&mut OutboxMessage> = rows
            .iter_mut()
            .filter(|r| r.status == OutboxStatus::New && r.next_attempt_at <= now)
            .collect();
        ready.sort_by_key(|r| (r.next_attempt_at, r.id));

        Ok(ready
            .into_iter()
            .take(limit)
            .map(|row| {
                row.status = OutboxStatus::Sending;
                row.claimed_by = Some(worker_id.to_string());
                row.updated_at = Utc::now();
                row.clone()
            })
            .collect())
    }

    async fn mark_terminal(
        &self,
        id: i64,
        worker_id: &str,
        status: OutboxStatus,
        attempt_count: i32,
        error: Option<&str>,
    ) -> Result<bool, AppError> {
        assert!(status.is_terminal());
        Ok(self.update(id, worker_id, |row| {
            row.status = status;
            row.attempt_count = attempt_count;
            row.last_error = error.map(str::to_string);
        }))
    }

    async fn reschedule(
        &self,
        id: i64,
        worker_id: &str,
        next_attempt_at: DateTime<Utc>,
        attempt_count: i32,
        error: Option<&str>,
    ) -> Result<bool, AppError> {
        Ok(self.update(id, worker_id, |row| {
            row.status = OutboxStatus::New;
            row.next_attempt_at = next_attempt_at;
            row.attempt_count = attempt_count;
            if let Some(error) = error {
                row.last_error = Some(error.to_string());
            }
        }))
    }

    async fn is_sent(&self, idempotency_key: &str) -> Result<bool, AppError> {
        Ok(self
            .rows
            .lock()
            .iter()
            .any(|r| r.idempotency_key == idempotency_key && r.status == OutboxStatus::Sent))
    }

    async fn depth(&self) -> Result<u64, AppError> {
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|r| !r.status.is_terminal())
            .count() as u64)
    }

    async fn recover_stale(&self, older_than: Duration) -> Result<u64, AppError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap();
        let mut recovered = 0;
        for row in self.rows.lock().iter_mut() {
            if row.status == OutboxStatus::Sending && row.updated_at < cutoff {
                row.status = OutboxStatus::New;
                row.claimed_by = None;
                row.next_attempt_at = Utc::now();
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

// ---------------------------------------------------------------------------
// Campaigns
// ---------------------------------------------------------------------------

pub struct InMemoryCampaigns {
    outbox: Arc<InMemoryOutbox>,
    campaigns: Mutex<HashMap<i64, (Campaign, Vec<i64>)>>,
    failing: Mutex<Option<i64>>,
}

impl InMemoryCampaigns {
    pub fn new(outbox: Arc<InMemoryOutbox>) -> Arc<Self> {
        Arc::new(Self {
            outbox,
            campaigns: Mutex::new(HashMap::new()),
            failing: Mutex::new(None),
        })
    }

    pub fn create(&self, chat_ids: Vec<i64>, status: CampaignStatus) -> i64 {
        self.insert(chat_ids, status, None, None)
    }

    pub fn create_at(
        &self,
        chat_ids: Vec<i64>,
        status: CampaignStatus,
        starts_at: Option<DateTime<Utc>>,
    ) -> i64 {
        self.insert(chat_ids, status, starts_at, None)
    }

    pub fn create_scheduled(&self, chat_ids: Vec<i64>, schedule_cron: &str) -> i64 {
        self.insert(
            chat_ids,
            CampaignStatus::Active,
            None,
            Some(schedule_cron.to_string()),
        )
    }

    fn insert(
        &self,
        chat_ids: Vec<i64>,
        status: CampaignStatus,
        starts_at: Option<DateTime<Utc>>,
        schedule_cron: Option<String>,
    ) -> i64 {
        let mut campaigns = self.campaigns.lock();
        let id = campaigns.len() as i64 + 1;
        let now = Utc::now();
        let campaign = Campaign {
            id,
            title: format!("campaign {id}"),
            status,
            method: SendMethod::Text,
            payload: Json(MessageContent::text("Doors open at 21:00")),
            thread_id: None,
            total: chat_ids.len() as i64,
            enqueued: 0,
            target_cursor: 0,
            starts_at,
            schedule_cron,
            created_at: now,
            updated_at: now,
        };
        campaigns.insert(id, (campaign, chat_ids));
        id
    }

    pub fn get(&self, id: i64) -> Campaign {
        self.campaigns.lock()[&id].0.clone()
    }

    /// Make `enqueue_targets` fail for this campaign.
    pub fn fail_enqueue_for(&self, id: Option<i64>) {
        *self.failing.lock() = id;
    }
}

#[async_trait]
impl CampaignStore for InMemoryCampaigns {
    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>, AppError> {
        let mut active: Vec<Campaign> = self
            .campaigns
            .lock()
            .values()
            .map(|(c, _)| c.clone())
            .filter(|c| matches!(c.status, CampaignStatus::Active | CampaignStatus::Sending))
            .filter(|c| c.starts_at.is_none_or(|at| at <= now))
            .collect();
        active.sort_by_key(|c| c.id);
        Ok(active)
    }

    async fn mark_sending(&self, campaign_id: i64) -> Result<bool, AppError> {
        let mut campaigns = self.campaigns.lock();
        let (campaign, _) = campaigns.get_mut(&campaign_id).expect("campaign exists");
        if campaign.status != CampaignStatus::Active {
            return Ok(false);
        }
        campaign.status = CampaignStatus::Sending;
        Ok(true)
    }

    async fn enqueue_targets(&self, campaign_id: i64, limit: usize) -> Result<u64, AppError> {
        if *self.failing.lock() == Some(campaign_id) {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }

        let (campaign, pending) = {
            let campaigns = self.campaigns.lock();
            let (campaign, targets) = &campaigns[&campaign_id];
            let pending: Vec<(i64, i64)> = targets
                .iter()
                .enumerate()
                .map(|(i, chat)| (i as i64 + 1, *chat))
                .filter(|(seq, _)| *seq > campaign.target_cursor)
                .take(limit)
                .collect();
            (campaign.clone(), pending)
        };

        for (seq, chat_id) in &pending {
            let message = NewOutboxMessage {
                chat_id: *chat_id,
                thread_id: campaign.thread_id,
                method: campaign.method,
                payload: campaign.payload.0.clone(),
                idempotency_key: campaign_target_key(campaign_id, *seq),
                campaign_id: Some(campaign_id),
            };
            self.outbox.enqueue(&message).await?;
        }

        if let Some((last_seq, _)) = pending.last() {
            let mut campaigns = self.campaigns.lock();
            let (campaign, _) = campaigns.get_mut(&campaign_id).expect("campaign exists");
            campaign.enqueued = (campaign.enqueued + pending.len() as i64).min(campaign.total);
            campaign.target_cursor = *last_seq;
        }
        Ok(pending.len() as u64)
    }

    async fn progress(&self, campaign_id: i64) -> Result<CampaignProgress, AppError> {
        let campaign = self.get(campaign_id);
        let outstanding = self
            .outbox
            .rows()
            .iter()
            .filter(|r| r.campaign_id == Some(campaign_id) && !r.status.is_terminal())
            .count() as i64;
        Ok(CampaignProgress {
            enqueued: campaign.enqueued,
            total: campaign.total,
            outstanding,
        })
    }

    async fn mark_done(&self, campaign_id: i64) -> Result<bool, AppError> {
        let mut campaigns = self.campaigns.lock();
        let (campaign, _) = campaigns.get_mut(&campaign_id).expect("campaign exists");
        if !matches!(
            campaign.status,
            CampaignStatus::Active | CampaignStatus::Sending
        ) {
            return Ok(false);
        }
        campaign.status = CampaignStatus::Done;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Dispatchers
// ---------------------------------------------------------------------------

/// Replays scripted results per chat and falls back to `Ok` once a script runs out.
#[derive(Default)]
pub struct ScriptedDispatcher {
    scripts: Mutex<HashMap<i64, VecDeque<DispatchResult>>>,
    fallback: Mutex<Option<DispatchResult>>,
    calls: Mutex<Vec<(i64, Instant)>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl ScriptedDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, chat_id: i64, results: Vec<DispatchResult>) {
        self.scripts.lock().insert(chat_id, results.into());
    }

    /// Result returned for every call without a script.
    pub fn always(&self, result: DispatchResult) {
        *self.fallback.lock() = Some(result);
    }

    /// Park every send until `gate` is notified, once per send.
    pub fn hold(&self, gate: Arc<Notify>) {
        *self.gate.lock() = Some(gate);
    }

    pub fn calls(&self) -> Vec<(i64, Instant)> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, chat_id: i64) -> Vec<Instant> {
        self.calls
            .lock()
            .iter()
            .filter(|(chat, _)| *chat == chat_id)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn send(
        &self,
        _method: SendMethod,
        chat_id: i64,
        _content: &MessageContent,
        _thread_id: Option<i32>,
    ) -> DispatchResult {
        self.calls.lock().push((chat_id, Instant::now()));
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(result) = self
            .scripts
            .lock()
            .get_mut(&chat_id)
            .and_then(|script| script.pop_front())
        {
            return result;
        }
        self.fallback
            .lock()
            .clone()
            .unwrap_or(DispatchResult::Ok(Some(chat_id)))
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Limits with generous buckets and millisecond backoff, so tests run fast.
pub fn fast_limits() -> NotifyLimits {
    NotifyLimits {
        global_capacity: 1_000.0,
        global_refill_per_sec: 1_000.0,
        chat_capacity: 10.0,
        chat_refill_per_sec: 10.0,
        send_base_backoff: Duration::from_millis(1),
        send_max_backoff: Duration::from_millis(5),
        send_jitter: Duration::ZERO,
        worker_batch_size: 100,
        worker_parallelism: 8,
        worker_idle_delay: Duration::from_millis(10),
        ..NotifyLimits::default()
    }
}

pub struct Harness {
    pub outbox: Arc<InMemoryOutbox>,
    pub dispatcher: Arc<ScriptedDispatcher>,
    pub idempotency: Arc<InMemoryIdempotencyStore>,
    pub worker: OutboxWorker,
}

pub fn harness(limits: &NotifyLimits) -> Harness {
    harness_with_outbox(limits, InMemoryOutbox::new())
}

pub fn harness_with_outbox(limits: &NotifyLimits, outbox: Arc<InMemoryOutbox>) -> Harness {
    let dispatcher = ScriptedDispatcher::new();
    let idempotency = Arc::new(InMemoryIdempotencyStore::new(
        limits.idempotency_ttl,
        limits.idempotency_cleanup_size,
    ));
    let limiter = Arc::new(RateLimiter::new(&RateLimiterConfig::from(limits)));
    let worker = OutboxWorker::new(
        outbox.clone(),
        dispatcher.clone(),
        limiter,
        idempotency.clone() as Arc<dyn IdempotencyStore>,
        RetryPolicy::from(limits),
        WorkerConfig::from(limits),
    );
    Harness {
        outbox,
        dispatcher,
        idempotency,
        worker,
    }
}

/// Run the worker until nothing is due right now.
pub async fn drain(worker: &OutboxWorker) {
    for _ in 0..100 {
        let stats = worker.run_once().await.expect("claim succeeds");
        if stats.claimed == 0 {
            return;
        }
    }
    panic!("outbox did not drain");
}

/// Poll `done` every few milliseconds for up to two seconds.
pub async fn wait_for<F>(mut done: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..400 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    done()
}

/// Keep running the worker until `done` holds or `timeout` passes.
pub async fn run_until<F>(worker: &OutboxWorker, timeout: Duration, mut done: F) -> bool
where
    F: FnMut() -> bool,
{
    let started = Instant::now();
    while started.elapsed() < timeout {
        worker.run_once().await.expect("claim succeeds");
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    done()
}
