//! The per-campaign batch loop
//!
//! One dispatcher runs per sending campaign at a time. Each run pulls a batch
//! of pending sends, hands them to per-send jobs and queues itself again;
//! once every send exists and nothing is left outstanding it completes the
//! campaign.

use std::time::Duration;

use ember_common::tracing;
use ember_store::{Campaign, CampaignId, CampaignStatus, PauseReason, model::percentage};
use serde::{Deserialize, Serialize};

use super::{CampaignProcessor, Flight, Runtime};
use crate::{error::Result, scheduler::Job};

/// Configuration for the batch loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum sends in flight per campaign; each run tops up to this
    ///
    /// Default: 100
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Delay between batches (in seconds)
    ///
    /// Default: 5 seconds
    #[serde(default = "default_batch_delay")]
    pub batch_delay_secs: u64,

    /// Delay before checking again when sends are still outstanding
    /// elsewhere (in seconds)
    ///
    /// Default: 30 seconds
    #[serde(default = "default_recheck_delay")]
    pub recheck_delay_secs: u64,

    /// Failed sends over total recipients, in percent, above which the
    /// campaign is paused
    ///
    /// Default: 10.0
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    /// The failure-rate check only applies above this many recipients
    ///
    /// Default: 100
    #[serde(default = "default_failure_rate_min_recipients")]
    pub failure_rate_min_recipients: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_delay_secs: default_batch_delay(),
            recheck_delay_secs: default_recheck_delay(),
            failure_rate_threshold: default_failure_rate_threshold(),
            failure_rate_min_recipients: default_failure_rate_min_recipients(),
        }
    }
}

const fn default_batch_size() -> usize {
    100
}

const fn default_batch_delay() -> u64 {
    5
}

const fn default_recheck_delay() -> u64 {
    30
}

const fn default_failure_rate_threshold() -> f64 {
    10.0
}

const fn default_failure_rate_min_recipients() -> u64 {
    100
}

impl DispatchConfig {
    #[must_use]
    pub const fn batch_delay(&self) -> Duration {
        Duration::from_secs(self.batch_delay_secs)
    }

    #[must_use]
    pub const fn recheck_delay(&self) -> Duration {
        Duration::from_secs(self.recheck_delay_secs)
    }
}

/// What one dispatcher run did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Another run for the same campaign is active, or it is not sending
    Skipped,
    /// The campaign was paused instead of dispatching
    Paused(PauseReason),
    /// Sends were queued and the next run scheduled
    Queued(usize),
    /// Nothing to pull yet; the next run was scheduled
    Waiting,
    /// Every send has left `pending` and `sending`
    Completed,
}

impl CampaignProcessor {
    /// Run the dispatcher for a campaign once.
    ///
    /// # Errors
    ///
    /// If the store cannot be read or written
    #[tracing::instrument(level = tracing::Level::DEBUG, skip_all, fields(campaign_id = %id))]
    pub async fn dispatch(&self, id: &CampaignId) -> Result<DispatchOutcome> {
        let runtime = self.runtime()?;
        let Some(_flight) = Flight::enter(&runtime.dispatching, *id) else {
            tracing::debug!("Dispatcher already running");
            return Ok(DispatchOutcome::Skipped);
        };

        let store = &runtime.store;
        let campaign = store.campaign(id).await?;
        if campaign.status != CampaignStatus::Sending {
            return Ok(DispatchOutcome::Skipped);
        }

        let account = store.account(&campaign.account_id).await?;
        if account.quota_exceeded() {
            self.pause(id, PauseReason::QuotaExceeded).await?;
            return Ok(DispatchOutcome::Paused(PauseReason::QuotaExceeded));
        }

        let stats = store.send_stats(id, None).await?;
        let failure_rate = percentage(stats.failed, campaign.total_recipients, 2);
        if campaign.total_recipients > self.dispatch.failure_rate_min_recipients
            && failure_rate > self.dispatch.failure_rate_threshold
        {
            tracing::warn!(
                failure_rate,
                failed = stats.failed,
                total_recipients = campaign.total_recipients,
                "Failure rate too high, pausing campaign"
            );
            self.pause(id, PauseReason::TooManyFailures).await?;
            return Ok(DispatchOutcome::Paused(PauseReason::TooManyFailures));
        }

        // canary sends still owned by their own jobs are in flight too
        let exclude = runtime.in_flight(id);
        let capacity = self.dispatch.batch_size.saturating_sub(exclude.len());
        if capacity == 0 {
            self.schedule_dispatch(runtime, *id, self.dispatch.batch_delay());
            return Ok(DispatchOutcome::Waiting);
        }

        let batch = store.pending_sends(id, capacity, &exclude).await?;

        if batch.is_empty() {
            if !runtime.sends_prepared(&campaign) {
                tracing::debug!(
                    sends_created = campaign.sends_created_count,
                    total_recipients = campaign.total_recipients,
                    "Sends still being created, checking again later"
                );
                self.schedule_dispatch(runtime, *id, self.dispatch.recheck_delay());
                return Ok(DispatchOutcome::Waiting);
            }

            if stats.outstanding() == 0 {
                self.complete(id).await?;
                return Ok(DispatchOutcome::Completed);
            }

            tracing::debug!(
                outstanding = stats.outstanding(),
                "Sends still outstanding, checking again later"
            );
            self.schedule_dispatch(runtime, *id, self.dispatch.recheck_delay());
            return Ok(DispatchOutcome::Waiting);
        }

        runtime.tenants.resize(
            &account.id,
            runtime.rate_limiter.concurrency_limit(&account),
        );

        let now = runtime.clock.now();
        for send_id in &batch {
            self.enqueue_send(runtime, &campaign, *send_id, now);
        }

        tracing::debug!(queued = batch.len(), "Queued batch of sends");
        self.schedule_dispatch(runtime, *id, self.dispatch.batch_delay());

        Ok(DispatchOutcome::Queued(batch.len()))
    }
}

impl Runtime {
    /// Whether every send of the campaign exists. Queues a materialization
    /// when the sends are incomplete and none is running or queued.
    fn sends_prepared(&self, campaign: &Campaign) -> bool {
        let job = Job::Materialize(campaign.id);
        let materializing = self.materializing.contains(&campaign.id)
            || self.scheduler.scheduled_at(&job).is_some();

        if campaign.preparation_complete() && !materializing {
            return true;
        }

        if !materializing {
            tracing::info!(campaign_id = %campaign.id, "Sends incomplete, queueing materialization");
            self.scheduler.schedule_at(job, self.clock.now());
        }
        false
    }
}
