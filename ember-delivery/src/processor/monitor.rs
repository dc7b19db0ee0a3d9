//! Periodic checks over all campaigns in a given state

use std::time::Duration;

use ember_common::tracing;
use ember_store::CampaignStatus;
use serde::{Deserialize, Serialize};

use super::CampaignProcessor;
use crate::{error::Result, risk::CanaryVerdict, scheduler::deadline};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// How often campaigns waiting in review are checked (in seconds)
    ///
    /// Default: 60 seconds
    #[serde(default = "default_review_interval")]
    pub review_interval_secs: u64,

    /// How often canary campaigns are checked for analysis (in seconds)
    ///
    /// Default: 60 seconds
    #[serde(default = "default_canary_interval")]
    pub canary_interval_secs: u64,

    /// How often sending campaigns are checked against the kill-switch
    /// (in seconds)
    ///
    /// Default: 30 seconds
    #[serde(default = "default_kill_switch_interval")]
    pub kill_switch_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            review_interval_secs: default_review_interval(),
            canary_interval_secs: default_canary_interval(),
            kill_switch_interval_secs: default_kill_switch_interval(),
        }
    }
}

const fn default_review_interval() -> u64 {
    60
}

const fn default_canary_interval() -> u64 {
    60
}

const fn default_kill_switch_interval() -> u64 {
    30
}

impl MonitorConfig {
    #[must_use]
    pub const fn review_interval(&self) -> Duration {
        Duration::from_secs(self.review_interval_secs)
    }

    #[must_use]
    pub const fn canary_interval(&self) -> Duration {
        Duration::from_secs(self.canary_interval_secs)
    }

    #[must_use]
    pub const fn kill_switch_interval(&self) -> Duration {
        Duration::from_secs(self.kill_switch_interval_secs)
    }
}

impl CampaignProcessor {
    /// Move every campaign whose review cooldown has passed into
    /// materialization. Returns how many were moved on.
    ///
    /// # Errors
    ///
    /// If the campaign list cannot be read
    pub async fn process_review_queue(&self) -> Result<usize> {
        let runtime = self.runtime()?;
        let queued = runtime
            .store
            .campaigns(Some(CampaignStatus::QueuedForReview))
            .await?;

        let mut advanced = 0;
        for campaign in queued {
            match self.process_after_cooldown(&campaign.id).await {
                Ok(true) => advanced += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(
                    campaign_id = %campaign.id,
                    error = %e,
                    "Failed to process campaign after review"
                ),
            }
        }

        Ok(advanced)
    }

    /// Analyse every canary sample whose observation window has elapsed.
    /// Returns how many campaigns were decided.
    ///
    /// # Errors
    ///
    /// If the campaign list cannot be read
    pub async fn process_canaries(&self) -> Result<usize> {
        let runtime = self.runtime()?;
        let now = runtime.clock.now();
        let window = self.risk.canary_window();

        let canaries = runtime
            .store
            .campaigns(Some(CampaignStatus::CanaryProcessing))
            .await?;

        let mut decided = 0;
        for campaign in canaries {
            let due = campaign
                .canary_started_at
                .is_none_or(|started| deadline(started, window) <= now);
            if !due {
                continue;
            }

            match self.analyze_canary(&campaign.id).await {
                Ok(None | Some(CanaryVerdict::NotReady)) => {}
                Ok(Some(_)) => decided += 1,
                Err(e) => tracing::error!(
                    campaign_id = %campaign.id,
                    error = %e,
                    "Failed to analyse canary batch"
                ),
            }
        }

        Ok(decided)
    }

    /// Run the kill-switch over every sending campaign. Returns how many were
    /// suspended.
    ///
    /// # Errors
    ///
    /// If the campaign list cannot be read
    pub async fn process_kill_switch(&self) -> Result<usize> {
        let runtime = self.runtime()?;
        let sending = runtime
            .store
            .campaigns(Some(CampaignStatus::Sending))
            .await?;

        let mut suspended = 0;
        for campaign in sending {
            match self.check_kill_switch(&campaign.id).await {
                Ok(true) => suspended += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(
                    campaign_id = %campaign.id,
                    error = %e,
                    "Kill-switch check failed"
                ),
            }
        }

        Ok(suspended)
    }

    /// Run all three monitors once
    ///
    /// # Errors
    ///
    /// If a campaign list cannot be read
    pub async fn run_monitors(&self) -> Result<()> {
        self.process_review_queue().await?;
        self.process_canaries().await?;
        self.process_kill_switch().await?;
        Ok(())
    }
}
