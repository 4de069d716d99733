//! Campaign scheduler: feeds campaign targets into the outbox in batches.
//!
//! Backpressure comes from the outbox itself. While the number of undelivered rows is at
//! or above the ceiling, campaigns are not advanced; they resume on a later tick.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use courier_common::config::NotifyLimits;
use courier_common::error::AppError;
use courier_common::types::{Campaign, CampaignStatus};

use crate::campaign::CampaignStore;
use crate::outbox::OutboxStore;
use crate::telemetry;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub batch_size: usize,
    pub tick_interval: Duration,
    /// Outbox depth at which campaigns stop being advanced.
    pub depth_ceiling: u64,
}

impl From<&NotifyLimits> for SchedulerConfig {
    fn from(limits: &NotifyLimits) -> Self {
        Self {
            batch_size: limits.campaign_batch_size.max(1),
            tick_interval: limits.campaign_tick_interval.max(Duration::from_millis(10)),
            depth_ceiling: limits.outbox_depth_ceiling,
        }
    }
}

/// Summary of one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Campaigns advanced this tick.
    pub processed: usize,
    /// Targets turned into outbox rows.
    pub enqueued: u64,
    /// Campaigns held back by backpressure.
    pub throttled: usize,
    /// Campaigns marked DONE.
    pub completed: usize,
    /// Campaigns skipped because another tick is working on them.
    pub skipped: usize,
    pub errors: usize,
    /// Targets not yet enqueued, summed over the campaigns advanced this tick.
    pub remaining: u64,
}

pub struct CampaignScheduler {
    campaigns: Arc<dyn CampaignStore>,
    outbox: Arc<dyn OutboxStore>,
    config: SchedulerConfig,
    in_flight: Mutex<HashSet<i64>>,
}

/// Removes a campaign from the in-flight set when its processing ends.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<i64>>,
    campaign_id: i64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.campaign_id);
    }
}

impl CampaignScheduler {
    pub fn new(
        campaigns: Arc<dyn CampaignStore>,
        outbox: Arc<dyn OutboxStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            campaigns,
            outbox,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            tick_ms = self.config.tick_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            depth_ceiling = self.config.depth_ceiling,
            "Campaign scheduler started"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(report) if report.processed > 0 || report.errors > 0 => {
                            tracing::debug!(
                                processed = report.processed,
                                enqueued = report.enqueued,
                                throttled = report.throttled,
                                completed = report.completed,
                                errors = report.errors,
                                "Scheduler tick finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) if e.is_transient() => {
                            tracing::warn!(error = %e, "Scheduler tick failed");
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Scheduler tick failed");
                        }
                    }
                }
            }
        }

        tracing::info!("Campaign scheduler stopped");
    }

    /// Advance every due campaign by at most one batch.
    pub async fn tick(&self) -> Result<TickReport, AppError> {
        let now = Utc::now();
        let campaigns = self.campaigns.list_active(now).await?;
        let mut report = TickReport::default();
        if campaigns.is_empty() {
            metrics::gauge!(telemetry::CAMPAIGN_REMAINING).set(0.0);
            return Ok(report);
        }

        // One depth read per tick; batches enqueued below are added locally.
        let mut depth = self.outbox.depth().await?;

        for campaign in campaigns {
            if !campaign.is_due(now) {
                continue;
            }
            let Some(_guard) = self.enter(campaign.id) else {
                report.skipped += 1;
                continue;
            };

            match self.advance(&campaign, &mut depth, &mut report).await {
                Ok(()) => report.processed += 1,
                Err(e) => {
                    report.errors += 1;
                    if e.is_transient() {
                        tracing::warn!(campaign_id = campaign.id, error = %e, "Campaign tick failed");
                    } else {
                        tracing::error!(campaign_id = campaign.id, error = %e, "Campaign tick failed");
                    }
                }
            }
        }

        metrics::gauge!(telemetry::CAMPAIGN_REMAINING).set(report.remaining as f64);
        Ok(report)
    }

    fn enter(&self, campaign_id: i64) -> Option<InFlight<'_>> {
        if !self.in_flight.lock().insert(campaign_id) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            campaign_id,
        })
    }

    async fn advance(
        &self,
        campaign: &Campaign,
        depth: &mut u64,
        report: &mut TickReport,
    ) -> Result<(), AppError> {
        if campaign.status == CampaignStatus::Active
            && self.campaigns.mark_sending(campaign.id).await?
        {
            tracing::info!(
                campaign_id = campaign.id,
                total = campaign.total,
                "Campaign sending started"
            );
        }

        if campaign.enqueued < campaign.total {
            if *depth >= self.config.depth_ceiling {
                report.throttled += 1;
                metrics::counter!(telemetry::CAMPAIGN_THROTTLED).increment(1);
                tracing::debug!(
                    campaign_id = campaign.id,
                    depth = *depth,
                    ceiling = self.config.depth_ceiling,
                    "Outbox full, campaign held back"
                );
            } else {
                let enqueued = self
                    .campaigns
                    .enqueue_targets(campaign.id, self.config.batch_size)
                    .await?;
                *depth += enqueued;
                report.enqueued += enqueued;
                metrics::counter!(telemetry::CAMPAIGN_ENQUEUED).increment(enqueued);
            }
        }

        let progress = self.campaigns.progress(campaign.id).await?;
        report.remaining += (progress.total - progress.enqueued).max(0) as u64;

        if progress.is_complete() && self.campaigns.mark_done(campaign.id).await? {
            report.completed += 1;
            tracing::info!(
                campaign_id = campaign.id,
                total = progress.total,
                "Campaign done"
            );
        }

        Ok(())
    }
}
