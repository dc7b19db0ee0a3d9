//! Creating send rows from the recipient source

use std::time::Duration;

use ember_common::tracing;
use ember_store::{Campaign, CampaignId, CampaignSend, CampaignStatus};
use serde::{Deserialize, Serialize};

use super::{CampaignProcessor, Flight};
use crate::{error::Result, scheduler::Job};

/// Configuration for materialization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterializeConfig {
    /// Audiences up to this size are materialized inline; larger ones run as
    /// a background job that reports progress
    ///
    /// Default: 1000
    #[serde(default = "default_sync_limit")]
    pub sync_limit: u64,

    /// Recipients fetched per page
    ///
    /// Default: 1000
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Progress is recorded after this many sends
    ///
    /// Default: 100
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
}

impl Default for MaterializeConfig {
    fn default() -> Self {
        Self {
            sync_limit: default_sync_limit(),
            page_size: default_page_size(),
            progress_interval: default_progress_interval(),
        }
    }
}

const fn default_sync_limit() -> u64 {
    1000
}

const fn default_page_size() -> usize {
    1000
}

const fn default_progress_interval() -> u64 {
    100
}

/// Percentage of `expected` reached so far, held below 100 until the run ends
#[allow(
    clippy::cast_possible_truncation,
    reason = "the value is clamped to 0..=99 first"
)]
fn progress(created: u64, expected: u64) -> u8 {
    if expected == 0 {
        return 0;
    }
    (created.saturating_mul(100) / expected).min(99) as u8
}

impl CampaignProcessor {
    /// Create the campaign's sends now, or queue a background job for large
    /// audiences.
    ///
    /// # Errors
    ///
    /// If the recipient source or the store fails
    pub async fn prepare_sends(&self, campaign: &Campaign) -> Result<()> {
        let runtime = self.runtime()?;
        let expected = runtime.recipients.count(&campaign.audience()).await?;

        if expected > self.materialize.sync_limit {
            runtime
                .store
                .set_total_recipients(&campaign.id, expected)
                .await?;
            runtime
                .scheduler
                .schedule_in(Job::Materialize(campaign.id), runtime.clock.now(), Duration::ZERO);
            tracing::info!(
                campaign_id = %campaign.id,
                expected,
                "Queued background materialization"
            );
            return Ok(());
        }

        self.materialize(&campaign.id).await.map(drop)
    }

    /// Create one send per recipient and move the campaign on.
    ///
    /// Safe to re-run: existing sends are kept, and the recipient total is
    /// reconciled to the number of sends the campaign ends up with. Returns
    /// `false` if another materialization of the same campaign is running or
    /// the campaign no longer needs one.
    ///
    /// # Errors
    ///
    /// If the recipient source or the store fails
    #[tracing::instrument(level = tracing::Level::DEBUG, skip_all, fields(campaign_id = %id))]
    pub async fn materialize(&self, id: &CampaignId) -> Result<bool> {
        let runtime = self.runtime()?;
        let Some(_flight) = Flight::enter(&runtime.materializing, *id) else {
            return Ok(false);
        };

        let store = &runtime.store;
        let campaign = store.campaign(id).await?;
        // paused campaigns still get their sends; resume dispatches them
        if !matches!(
            campaign.status,
            CampaignStatus::QueuedForReview | CampaignStatus::Sending | CampaignStatus::Paused
        ) {
            return Ok(false);
        }

        let audience = campaign.audience();
        let expected = runtime.recipients.count(&audience).await?;
        let background = expected > self.materialize.sync_limit;
        store.set_total_recipients(id, expected).await?;

        let mut created = 0_u64;
        let mut after = None;

        loop {
            let page = runtime
                .recipients
                .page(&audience, after, self.materialize.page_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.subscriber_id);
            let full_page = page.len() == self.materialize.page_size;

            for recipient in page {
                let mut send = CampaignSend::new(*id, recipient.subscriber_id, recipient.email);
                send.recipient_name = recipient.name;
                store.insert_send(send).await?;
                created += 1;

                if background && created % self.materialize.progress_interval == 0 {
                    store
                        .set_preparation(id, created, progress(created, expected))
                        .await?;
                }
            }

            if !full_page {
                break;
            }
        }

        store.set_total_recipients(id, created).await?;
        store.set_preparation(id, created, 100).await?;

        if created != expected {
            tracing::warn!(
                expected,
                created,
                "Recipient count changed during materialization"
            );
        }
        tracing::info!(created, "Materialized campaign sends");

        let campaign = store.campaign(id).await?;
        match campaign.status {
            CampaignStatus::QueuedForReview => {
                self.continue_after_preparation(id).await?;
            }
            CampaignStatus::Sending => {
                runtime.notifier.sending_started(&campaign);
                self.schedule_dispatch(runtime, *id, Duration::ZERO);
            }
            _ => {}
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_capped_until_done() {
        assert_eq!(progress(0, 2_000), 0);
        assert_eq!(progress(100, 2_000), 5);
        assert_eq!(progress(1_999, 2_000), 99);
        assert_eq!(progress(2_000, 2_000), 99);
        assert_eq!(progress(10, 0), 0);
    }
}
