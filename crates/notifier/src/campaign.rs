use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;

use courier_common::cron::CronSchedule;
use courier_common::error::AppError;
use courier_common::types::{
    Campaign, CampaignProgress, CampaignStatus, MessageContent, NewOutboxMessage, SendMethod,
    campaign_target_key,
};

use crate::outbox::insert_message;

const CAMPAIGN_COLUMNS: &str = "id, title, status, method, payload, thread_id, total, enqueued, \
     target_cursor, starts_at, schedule_cron, created_at, updated_at";

#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// ACTIVE and SENDING campaigns whose start time has passed at `now`. Cron gating is
    /// left to [`Campaign::is_due`].
    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>, AppError>;

    /// ACTIVE → SENDING. Returns `false` if the campaign was not ACTIVE.
    async fn mark_sending(&self, campaign_id: i64) -> Result<bool, AppError>;

    /// Turn up to `limit` pending targets into outbox rows and advance the counter.
    /// Returns the number of targets consumed.
    async fn enqueue_targets(&self, campaign_id: i64, limit: usize) -> Result<u64, AppError>;

    async fn progress(&self, campaign_id: i64) -> Result<CampaignProgress, AppError>;

    /// Returns `false` if the campaign was already DONE or PAUSED.
    async fn mark_done(&self, campaign_id: i64) -> Result<bool, AppError>;
}

/// A campaign to create, with its recipients in delivery order.
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub title: String,
    pub method: SendMethod,
    pub payload: MessageContent,
    pub thread_id: Option<i32>,
    pub starts_at: Option<DateTime<Utc>>,
    /// Five-field cron expression restricting when sending may start
    pub schedule_cron: Option<String>,
    pub chat_ids: Vec<i64>,
}

#[derive(Clone)]
pub struct PgCampaignStore {
    pool: PgPool,
}

impl PgCampaignStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a campaign and its targets, numbered from 1 in the given order.
    pub async fn create(&self, campaign: &NewCampaign) -> Result<Campaign, AppError> {
        if let Some(expr) = &campaign.schedule_cron {
            CronSchedule::parse(expr)?;
        }

        let mut tx = self.pool.begin().await?;

        let created = sqlx::query_as::<_, Campaign>(&format!(
            r#"
            INSERT INTO notify_campaigns
                (title, method, payload, thread_id, total, starts_at, schedule_cron)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {}
            "#,
            CAMPAIGN_COLUMNS
        ))
        .bind(&campaign.title)
        .bind(campaign.method)
        .bind(Json(&campaign.payload))
        .bind(campaign.thread_id)
        .bind(campaign.chat_ids.len() as i64)
        .bind(campaign.starts_at)
        .bind(&campaign.schedule_cron)
        .fetch_one(&mut *tx)
        .await?;

        let seqs: Vec<i64> = (1..=campaign.chat_ids.len() as i64).collect();
        sqlx::query(
            r#"
            INSERT INTO notify_campaign_targets (campaign_id, seq, chat_id)
            SELECT $1, t.seq, t.chat_id
            FROM UNNEST($2::BIGINT[], $3::BIGINT[]) AS t(seq, chat_id)
            "#,
        )
        .bind(created.id)
        .bind(&seqs)
        .bind(&campaign.chat_ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            campaign_id = created.id,
            total = created.total,
            "Campaign created"
        );
        Ok(created)
    }

    /// Pause or resume a campaign that is not DONE. A resumed campaign continues from
    /// its cursor; one that had already started goes straight back to SENDING.
    pub async fn set_paused(&self, campaign_id: i64, paused: bool) -> Result<bool, AppError> {
        let query = if paused {
            r#"
            UPDATE notify_campaigns
            SET status = 'PAUSED', updated_at = NOW()
            WHERE id = $1 AND status IN ('ACTIVE', 'SENDING')
            "#
        } else {
            r#"
            UPDATE notify_campaigns
            SET status = CASE WHEN enqueued > 0 THEN 'SENDING' ELSE 'ACTIVE' END,
                updated_at = NOW()
            WHERE id = $1 AND status = 'PAUSED'
            "#
        };

        let result = sqlx::query(query)
            .bind(campaign_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get(&self, campaign_id: i64) -> Result<Campaign, AppError> {
        sqlx::query_as::<_, Campaign>(&format!(
            "SELECT {} FROM notify_campaigns WHERE id = $1",
            CAMPAIGN_COLUMNS
        ))
        .bind(campaign_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("campaign {}", campaign_id)))
    }
}

#[async_trait]
impl CampaignStore for PgCampaignStore {
    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>, AppError> {
        let campaigns = sqlx::query_as::<_, Campaign>(&format!(
            r#"
            SELECT {}
            FROM notify_campaigns
            WHERE status IN ('ACTIVE', 'SENDING')
              AND (starts_at IS NULL OR starts_at <= $1)
            ORDER BY id
            "#,
            CAMPAIGN_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(campaigns)
    }

    async fn mark_sending(&self, campaign_id: i64) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notify_campaigns
            SET status = 'SENDING', updated_at = NOW()
            WHERE id = $1 AND status = 'ACTIVE'
            "#,
        )
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn enqueue_targets(&self, campaign_id: i64, limit: usize) -> Result<u64, AppError> {
        let mut tx = self.pool.begin().await?;

        // The row lock serialises overlapping ticks and processes on the cursor.
        let campaign = sqlx::query_as::<_, Campaign>(&format!(
            "SELECT {} FROM notify_campaigns WHERE id = $1 FOR UPDATE",
            CAMPAIGN_COLUMNS
        ))
        .bind(campaign_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("campaign {}", campaign_id)))?;

        if !matches!(
            campaign.status,
            CampaignStatus::Active | CampaignStatus::Sending
        ) || campaign.remaining() == 0
        {
            return Ok(0);
        }

        let limit = limit.min(campaign.remaining() as usize);
        let targets: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT seq, chat_id
            FROM notify_campaign_targets
            WHERE campaign_id = $1 AND seq > $2
            ORDER BY seq
            LIMIT $3
            "#,
        )
        .bind(campaign_id)
        .bind(campaign.target_cursor)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        let Some(&(last_seq, _)) = targets.last() else {
            // Fewer targets than announced: nothing left to feed.
            tracing::warn!(
                campaign_id,
                enqueued = campaign.enqueued,
                total = campaign.total,
                "Campaign has no targets left, closing the counter"
            );
            sqlx::query(
                "UPDATE notify_campaigns SET enqueued = total, updated_at = NOW() WHERE id = $1",
            )
            .bind(campaign_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(0);
        };

        let mut inserted = 0u64;
        for &(seq, chat_id) in &targets {
            let message = NewOutboxMessage {
                chat_id,
                thread_id: campaign.thread_id,
                method: campaign.method,
                payload: campaign.payload.0.clone(),
                idempotency_key: campaign_target_key(campaign_id, seq),
                campaign_id: Some(campaign_id),
            };
            if insert_message(&mut *tx, &message).await? {
                inserted += 1;
            }
        }

        let consumed = targets.len() as i64;
        sqlx::query(
            r#"
            UPDATE notify_campaigns
            SET enqueued = LEAST(total, enqueued + $2),
                target_cursor = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(campaign_id)
        .bind(consumed)
        .bind(last_seq)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            campaign_id,
            consumed,
            inserted,
            cursor = last_seq,
            "Campaign targets enqueued"
        );
        Ok(consumed as u64)
    }

    async fn progress(&self, campaign_id: i64) -> Result<CampaignProgress, AppError> {
        let row: Option<(i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT c.enqueued, c.total,
                   (SELECT COUNT(*) FROM notifications_outbox o
                    WHERE o.campaign_id = c.id AND o.status IN ('NEW', 'SENDING'))
            FROM notify_campaigns c
            WHERE c.id = $1
            "#,
        )
        .bind(campaign_id)
        .fetch_optional(&self.pool)
        .await?;

        let (enqueued, total, outstanding) =
            row.ok_or_else(|| AppError::NotFound(format!("campaign {}", campaign_id)))?;
        Ok(CampaignProgress {
            enqueued,
            total,
            outstanding,
        })
    }

    async fn mark_done(&self, campaign_id: i64) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notify_campaigns
            SET status = 'DONE', updated_at = NOW()
            WHERE id = $1 AND status IN ('ACTIVE', 'SENDING')
            "#,
        )
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
