use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

use crate::cron::CronSchedule;

/// Provider call used to deliver an outbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SendMethod {
    Text,
    Photo,
    MediaGroup,
}

impl SendMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendMethod::Text => "TEXT",
            SendMethod::Photo => "PHOTO",
            SendMethod::MediaGroup => "MEDIA_GROUP",
        }
    }
}

impl std::fmt::Display for SendMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbox row delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxStatus {
    /// Waiting for `next_attempt_at`.
    New,
    /// Claimed by a worker; only the claimer may move it on.
    Sending,
    Sent,
    /// Rejected by the provider in a way retrying cannot fix.
    Failed,
    /// Retries exhausted.
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::New => "NEW",
            OutboxStatus::Sending => "SENDING",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Failed => "FAILED",
            OutboxStatus::Dead => "DEAD",
        }
    }

    /// Terminal rows are never claimed again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OutboxStatus::Sent | OutboxStatus::Failed | OutboxStatus::Dead
        )
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Campaign lifecycle: ACTIVE → SENDING → DONE. PAUSED campaigns are left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum CampaignStatus {
    Active,
    Paused,
    Sending,
    Done,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Active => "ACTIVE",
            CampaignStatus::Paused => "PAUSED",
            CampaignStatus::Sending => "SENDING",
            CampaignStatus::Done => "DONE",
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One photo of a media group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    /// URL or provider file id
    pub url: String,
    pub caption: Option<String>,
}

/// Content of a message, interpreted according to the row's `SendMethod`.
///
/// All fields are optional so one shape covers text, photo and media group sends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Provider formatting mode, e.g. `HTML` or `MarkdownV2`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<String>,
    /// URL or provider file id of a single photo
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaItem>,
    /// Inline keyboard or other markup, passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_markup: Option<serde_json::Value>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn photo(photo: impl Into<String>, caption: Option<String>) -> Self {
        Self {
            photo: Some(photo.into()),
            caption,
            ..Self::default()
        }
    }
}

/// A persisted outbox row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxMessage {
    pub id: i64,
    pub chat_id: i64,
    pub thread_id: Option<i32>,
    pub method: SendMethod,
    pub payload: Json<MessageContent>,
    pub idempotency_key: String,
    pub campaign_id: Option<i64>,
    pub status: OutboxStatus,
    pub attempt_count: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxMessage {
    pub fn is_threaded(&self) -> bool {
        self.thread_id.is_some()
    }
}

/// A message a producer wants delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOutboxMessage {
    pub chat_id: i64,
    pub thread_id: Option<i32>,
    pub method: SendMethod,
    pub payload: MessageContent,
    /// Unique per logical notification; a second enqueue with the same key is ignored.
    pub idempotency_key: String,
    pub campaign_id: Option<i64>,
}

impl NewOutboxMessage {
    pub fn text(chat_id: i64, text: impl Into<String>, idempotency_key: impl Into<String>) -> Self {
        Self {
            chat_id,
            thread_id: None,
            method: SendMethod::Text,
            payload: MessageContent::text(text),
            idempotency_key: idempotency_key.into(),
            campaign_id: None,
        }
    }

    pub fn with_thread(mut self, thread_id: i32) -> Self {
        self.thread_id = Some(thread_id);
        self
    }
}

/// A broadcast campaign feeding the outbox in batches.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Campaign {
    pub id: i64,
    pub title: String,
    pub status: CampaignStatus,
    pub method: SendMethod,
    pub payload: Json<MessageContent>,
    pub thread_id: Option<i32>,
    /// Number of targets
    pub total: i64,
    /// Number of targets already turned into outbox rows
    pub enqueued: i64,
    /// Sequence number of the last enqueued target
    pub target_cursor: i64,
    /// Not due before this instant
    pub starts_at: Option<DateTime<Utc>>,
    /// Five-field cron expression; an ACTIVE campaign starts only in a matching minute
    pub schedule_cron: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Whether the scheduler may advance the campaign at `now`.
    ///
    /// The cron expression only gates the start: once SENDING, a campaign keeps going on
    /// every tick. An expression that does not parse never matches.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.starts_at.is_some_and(|at| at > now) {
            return false;
        }
        if self.status != CampaignStatus::Active {
            return true;
        }
        self.schedule_cron
            .as_deref()
            .is_none_or(|expr| CronSchedule::parse(expr).is_ok_and(|cron| cron.matches(now)))
    }

    pub fn remaining(&self) -> i64 {
        (self.total - self.enqueued).max(0)
    }
}

/// Snapshot of a campaign's delivery progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignProgress {
    pub enqueued: i64,
    pub total: i64,
    /// Outbox rows of the campaign that are not yet terminal
    pub outstanding: i64,
}

impl CampaignProgress {
    /// Everything is enqueued and every row reached a terminal status.
    pub fn is_complete(&self) -> bool {
        self.enqueued >= self.total && self.outstanding == 0
    }
}

/// Idempotency key for the `seq`-th target of a campaign.
pub fn campaign_target_key(campaign_id: i64, seq: i64) -> String {
    format!("campaign:{}:{}", campaign_id, seq)
}
