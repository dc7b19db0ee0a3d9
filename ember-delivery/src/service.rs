//! Service trait abstraction for campaign operations
//!
//! Control interfaces talk to the engine through [`CampaignService`] rather
//! than the concrete [`CampaignProcessor`], so they can be tested against a
//! mock and never reach into processor internals.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ember_store::{
    AccountId, Campaign, CampaignId, CampaignStatus, PauseReason, SendStats, model::percentage,
};
use serde::{Deserialize, Serialize};

use crate::{CampaignProcessor, error::Result};

/// Window over which `current_send_rate` is averaged
const SEND_RATE_WINDOW_SECS: i64 = 5 * 60;

/// Read-only view of a campaign for operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub id: CampaignId,
    pub account_id: AccountId,
    pub name: String,
    pub status: CampaignStatus,
    pub pause_reason: Option<PauseReason>,
    pub suspension_reason: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_sending_at: Option<DateTime<Utc>>,
    pub finished_sending_at: Option<DateTime<Utc>>,
    pub total_recipients: u64,
    pub sent_count: u64,
    pub delivered_count: u64,
    pub bounced_count: u64,
    pub complained_count: u64,
    pub opened_count: u64,
    pub clicked_count: u64,
    pub unsubscribed_count: u64,
    pub failed_count: u64,
    pub canary_size: usize,
    pub percent_complete: f64,
    pub open_rate: f64,
    pub click_rate: f64,
    pub bounce_rate: f64,
    pub failure_rate: f64,
    /// Sends per second over the last five minutes, zero unless sending
    pub current_send_rate: f64,
    pub preparation_progress: u8,
    pub preparing_sends: bool,
    pub preparation_complete: bool,
}

impl CampaignReport {
    /// Build a report from a campaign, its send tallies and the number of
    /// sends in the last five minutes
    #[must_use]
    #[allow(clippy::cast_precision_loss, reason = "send counts stay far below 2^52")]
    pub fn new(campaign: &Campaign, stats: &SendStats, sent_recently: u64) -> Self {
        let current_send_rate = if campaign.status == CampaignStatus::Sending {
            let per_second = sent_recently as f64 / SEND_RATE_WINDOW_SECS as f64;
            (per_second * 10.0).round() / 10.0
        } else {
            0.0
        };

        Self {
            id: campaign.id,
            account_id: campaign.account_id,
            name: campaign.name.clone(),
            status: campaign.status,
            pause_reason: campaign.pause_reason,
            suspension_reason: campaign.suspension_reason.clone(),
            scheduled_at: campaign.scheduled_at,
            started_sending_at: campaign.started_sending_at,
            finished_sending_at: campaign.finished_sending_at,
            total_recipients: campaign.total_recipients,
            sent_count: campaign.sent_count,
            delivered_count: campaign.delivered_count,
            bounced_count: campaign.bounced_count,
            complained_count: campaign.complained_count,
            opened_count: campaign.opened_count,
            clicked_count: campaign.clicked_count,
            unsubscribed_count: campaign.unsubscribed_count,
            failed_count: stats.failed,
            canary_size: campaign.canary_send_ids.as_ref().map_or(0, |ids| ids.len()),
            percent_complete: campaign.percent_complete(),
            open_rate: campaign.open_rate(),
            click_rate: campaign.click_rate(),
            bounce_rate: campaign.bounce_rate(),
            failure_rate: percentage(stats.failed, campaign.total_recipients, 2),
            current_send_rate,
            preparation_progress: campaign.preparation_progress,
            preparing_sends: campaign.preparing_sends(),
            preparation_complete: campaign.preparation_complete(),
        }
    }

    #[must_use]
    pub const fn has_failures(&self) -> bool {
        self.failed_count > 0
    }
}

impl fmt::Display for CampaignReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Campaign:     {} ({})", self.name, self.id)?;
        write!(f, "Status:       {}", self.status)?;
        if let Some(reason) = self.pause_reason {
            write!(f, " ({reason})")?;
        }
        writeln!(f)?;
        if let Some(reason) = &self.suspension_reason {
            writeln!(f, "Suspended:    {reason}")?;
        }
        if let Some(at) = self.scheduled_at {
            writeln!(f, "Scheduled:    {at}")?;
        }
        if self.preparing_sends {
            writeln!(f, "Preparing:    {}%", self.preparation_progress)?;
        }
        writeln!(
            f,
            "Progress:     {}/{} ({:.1}%)",
            self.sent_count, self.total_recipients, self.percent_complete
        )?;
        writeln!(f, "Send rate:    {:.1}/s", self.current_send_rate)?;
        writeln!(
            f,
            "Delivered:    {}  bounced: {} ({:.2}%)  complaints: {}",
            self.delivered_count, self.bounced_count, self.bounce_rate, self.complained_count
        )?;
        writeln!(
            f,
            "Opened:       {} ({:.2}%)  clicked: {} ({:.2}%)  unsubscribed: {}",
            self.opened_count,
            self.open_rate,
            self.clicked_count,
            self.click_rate,
            self.unsubscribed_count
        )?;
        write!(
            f,
            "Failed:       {} ({:.2}%)",
            self.failed_count, self.failure_rate
        )
    }
}

/// Engine-wide numbers for `system status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub queued_jobs: usize,
    pub campaigns_by_status: Vec<(CampaignStatus, usize)>,
}

/// Operations the control surface needs from the engine
#[async_trait]
pub trait CampaignService: Send + Sync {
    /// # Errors
    ///
    /// If the campaign is unknown or the store fails
    async fn report(&self, id: &CampaignId) -> Result<CampaignReport>;

    /// All campaigns, optionally with one status
    ///
    /// # Errors
    ///
    /// If the store fails
    async fn list(&self, status: Option<CampaignStatus>) -> Result<Vec<CampaignReport>>;

    /// # Errors
    ///
    /// If the engine is not running
    async fn engine_status(&self) -> Result<EngineStatus>;

    /// The command methods return `Ok(false)` when the campaign is not in a
    /// state that allows them.
    ///
    /// # Errors
    ///
    /// If the store fails
    async fn schedule_campaign(&self, id: &CampaignId, at: DateTime<Utc>) -> Result<bool>;

    /// # Errors
    ///
    /// If the store fails
    async fn start_campaign(&self, id: &CampaignId) -> Result<bool>;

    /// # Errors
    ///
    /// If the store fails
    async fn pause_campaign(&self, id: &CampaignId) -> Result<bool>;

    /// # Errors
    ///
    /// If the store fails
    async fn resume_campaign(&self, id: &CampaignId) -> Result<bool>;

    /// # Errors
    ///
    /// If the store fails
    async fn cancel_campaign(&self, id: &CampaignId) -> Result<bool>;
}

impl CampaignProcessor {
    async fn build_report(&self, campaign: &Campaign) -> Result<CampaignReport> {
        let runtime = self.runtime()?;
        let stats = runtime.store.send_stats(&campaign.id, None).await?;
        let since = runtime.clock.now() - chrono::Duration::seconds(SEND_RATE_WINDOW_SECS);
        let sent_recently = runtime.store.count_sent_since(&campaign.id, since).await?;
        Ok(CampaignReport::new(campaign, &stats, sent_recently))
    }
}

#[async_trait]
impl CampaignService for CampaignProcessor {
    async fn report(&self, id: &CampaignId) -> Result<CampaignReport> {
        let campaign = self.runtime()?.store.campaign(id).await?;
        self.build_report(&campaign).await
    }

    async fn list(&self, status: Option<CampaignStatus>) -> Result<Vec<CampaignReport>> {
        let campaigns = self.runtime()?.store.campaigns(status).await?;
        let mut reports = Vec::with_capacity(campaigns.len());
        for campaign in &campaigns {
            reports.push(self.build_report(campaign).await?);
        }
        Ok(reports)
    }

    async fn engine_status(&self) -> Result<EngineStatus> {
        let runtime = self.runtime()?;
        let campaigns = runtime.store.campaigns(None).await?;

        let campaigns_by_status = CampaignStatus::ALL
            .iter()
            .map(|status| {
                (
                    *status,
                    campaigns.iter().filter(|c| c.status == *status).count(),
                )
            })
            .filter(|(_, count)| *count > 0)
            .collect();

        Ok(EngineStatus {
            queued_jobs: runtime.scheduler.len(),
            campaigns_by_status,
        })
    }

    async fn schedule_campaign(&self, id: &CampaignId, at: DateTime<Utc>) -> Result<bool> {
        self.schedule(id, at).await
    }

    async fn start_campaign(&self, id: &CampaignId) -> Result<bool> {
        self.start(id).await
    }

    async fn pause_campaign(&self, id: &CampaignId) -> Result<bool> {
        self.pause(id, PauseReason::Manual).await
    }

    async fn resume_campaign(&self, id: &CampaignId) -> Result<bool> {
        self.resume(id).await
    }

    async fn cancel_campaign(&self, id: &CampaignId) -> Result<bool> {
        self.cancel(id).await
    }
}
