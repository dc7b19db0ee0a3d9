//! Campaign state transitions
//!
//! Every command is a compare-and-set against the store: it names the
//! statuses it may start from, and returns `Ok(false)` without changing
//! anything when the campaign is elsewhere. Side effects (notifications,
//! queued jobs) only happen after the transition has been applied.

use std::{collections::HashSet, time::Duration};

use chrono::{DateTime, Utc};
use ember_common::{internal, tracing};
use ember_store::{CampaignId, CampaignPatch, CampaignStatus, PauseReason};

use super::CampaignProcessor;
use crate::{
    error::Result,
    risk::{self, CanaryVerdict},
    scheduler::{Job, deadline},
};

impl CampaignProcessor {
    /// Schedule a draft to start at `at`, which must be in the future
    ///
    /// # Errors
    ///
    /// If the store fails
    pub async fn schedule(&self, id: &CampaignId, at: DateTime<Utc>) -> Result<bool> {
        let runtime = self.runtime()?;
        if at <= runtime.clock.now() {
            return Ok(false);
        }

        let transitioned = runtime
            .store
            .transition(
                id,
                &[CampaignStatus::Draft],
                CampaignStatus::Scheduled,
                CampaignPatch::default().scheduled_at(at),
            )
            .await?;

        if transitioned.is_none() {
            return Ok(false);
        }

        runtime.scheduler.schedule_at(Job::StartScheduled(*id), at);
        internal!(level = INFO, "Campaign {id} scheduled for {at}");
        Ok(true)
    }

    /// The scheduled-start job. Re-arms itself when woken early.
    pub(crate) async fn start_scheduled(&self, id: &CampaignId) -> Result<bool> {
        let runtime = self.runtime()?;
        let campaign = runtime.store.campaign(id).await?;
        if campaign.status != CampaignStatus::Scheduled {
            return Ok(false);
        }

        let now = runtime.clock.now();
        if let Some(at) = campaign.scheduled_at.filter(|at| *at > now) {
            runtime.scheduler.schedule_at(Job::StartScheduled(*id), at);
            return Ok(false);
        }

        self.start(id).await
    }

    /// Start a draft or scheduled campaign.
    ///
    /// Accounts on a plan with the sandbox workflow go through review; all
    /// others start sending as soon as the sends exist.
    ///
    /// # Errors
    ///
    /// If the store or recipient source fails
    pub async fn start(&self, id: &CampaignId) -> Result<bool> {
        let runtime = self.runtime()?;
        let store = &runtime.store;

        let campaign = store.campaign(id).await?;
        if !campaign.is_startable() {
            return Ok(false);
        }

        let account = store.account(&campaign.account_id).await?;
        if !account.can_send_email() {
            tracing::info!(
                campaign_id = %id,
                account_id = %account.id,
                active = account.active,
                paused = account.is_paused(),
                quota_exceeded = account.quota_exceeded(),
                "Account cannot send, not starting campaign"
            );
            return Ok(false);
        }

        if account.requires_sandbox_workflow() {
            return self.queue_for_review(id).await;
        }

        let Some(campaign) = store
            .transition(
                id,
                &[CampaignStatus::Draft, CampaignStatus::Scheduled],
                CampaignStatus::Sending,
                CampaignPatch::default().started_sending_at(runtime.clock.now()),
            )
            .await?
        else {
            return Ok(false);
        };

        internal!(level = INFO, "Campaign {id} started");
        self.prepare_sends(&campaign).await?;
        Ok(true)
    }

    /// Hold a campaign for review before anything is created or sent
    ///
    /// # Errors
    ///
    /// If the store fails
    pub async fn queue_for_review(&self, id: &CampaignId) -> Result<bool> {
        let runtime = self.runtime()?;
        let queued = runtime
            .store
            .transition(
                id,
                &[CampaignStatus::Draft, CampaignStatus::Scheduled],
                CampaignStatus::QueuedForReview,
                CampaignPatch::default().queued_at(runtime.clock.now()),
            )
            .await?;

        if queued.is_some() {
            internal!(level = INFO, "Campaign {id} queued for review");
        }
        Ok(queued.is_some())
    }

    /// Begin materialization once the review cooldown has passed
    ///
    /// # Errors
    ///
    /// If the store or recipient source fails
    pub async fn process_after_cooldown(&self, id: &CampaignId) -> Result<bool> {
        let runtime = self.runtime()?;
        let campaign = runtime.store.campaign(id).await?;
        if campaign.status != CampaignStatus::QueuedForReview {
            return Ok(false);
        }

        let now = runtime.clock.now();
        let cooled = campaign
            .queued_at
            .is_none_or(|queued| deadline(queued, self.risk.review_cooldown()) <= now);
        if !cooled
            || runtime.materializing.contains(id)
            || runtime.scheduler.scheduled_at(&Job::Materialize(*id)).is_some()
        {
            return Ok(false);
        }

        if campaign.preparation_complete() {
            return self.continue_after_preparation(id).await;
        }

        self.prepare_sends(&campaign).await?;
        Ok(true)
    }

    /// Route a reviewed campaign whose sends exist: a canary batch for large
    /// campaigns, straight to sending otherwise.
    ///
    /// # Errors
    ///
    /// If the store fails
    pub async fn continue_after_preparation(&self, id: &CampaignId) -> Result<bool> {
        let runtime = self.runtime()?;
        let campaign = runtime.store.campaign(id).await?;
        if campaign.status != CampaignStatus::QueuedForReview {
            return Ok(false);
        }

        if self.risk.needs_canary(campaign.total_recipients) {
            return self.send_canary_batch(id).await;
        }

        let Some(campaign) = runtime
            .store
            .transition(
                id,
                &[CampaignStatus::QueuedForReview],
                CampaignStatus::Sending,
                CampaignPatch::default().started_sending_at(runtime.clock.now()),
            )
            .await?
        else {
            return Ok(false);
        };

        runtime.notifier.sending_started(&campaign);
        self.schedule_dispatch(runtime, *id, Duration::ZERO);
        Ok(true)
    }

    /// Pick the canary sample and send only that
    ///
    /// # Errors
    ///
    /// If the store fails
    pub async fn send_canary_batch(&self, id: &CampaignId) -> Result<bool> {
        let runtime = self.runtime()?;
        let store = &runtime.store;

        let pending = store.pending_send_ids(id).await?;
        let sample = risk::select_canary(pending, self.risk.canary_size, &mut rand::rng());
        let now = runtime.clock.now();

        let Some(campaign) = store
            .transition(
                id,
                &[CampaignStatus::QueuedForReview],
                CampaignStatus::CanaryProcessing,
                CampaignPatch::default().canary(sample.clone(), now),
            )
            .await?
        else {
            return Ok(false);
        };

        tracing::info!(
            campaign_id = %id,
            canary_size = sample.len(),
            total_recipients = campaign.total_recipients,
            "Sending canary batch"
        );

        runtime.notifier.sending_started(&campaign);
        for send_id in sample {
            self.enqueue_send(runtime, &campaign, send_id, now);
        }

        Ok(true)
    }

    /// Judge the canary sample and approve or suspend. Returns the verdict,
    /// or `None` if the campaign is not in its canary phase.
    ///
    /// A sample that has not gone out yet is left undecided and its pending
    /// sends are queued again.
    ///
    /// # Errors
    ///
    /// If the store fails
    pub async fn analyze_canary(&self, id: &CampaignId) -> Result<Option<CanaryVerdict>> {
        let runtime = self.runtime()?;
        let campaign = runtime.store.campaign(id).await?;
        if campaign.status != CampaignStatus::CanaryProcessing {
            return Ok(None);
        }

        let stats = runtime
            .store
            .send_stats(id, campaign.canary_send_ids.as_ref())
            .await?;

        let verdict = risk::analyze_canary(&stats, self.risk.canary);
        match &verdict {
            CanaryVerdict::Approve | CanaryVerdict::Empty => {
                tracing::info!(
                    campaign_id = %id,
                    canary_total = stats.total,
                    canary_sent = stats.sent,
                    permanent_bounces = stats.permanent_bounces,
                    complaints = stats.complaints,
                    "Canary batch passed"
                );
                self.start_full_send(id).await?;
            }
            CanaryVerdict::Suspend { reason } => {
                self.suspend(id, reason).await?;
            }
            CanaryVerdict::NotReady => {
                let pending: HashSet<_> =
                    runtime.store.pending_send_ids(id).await?.into_iter().collect();
                let in_flight = runtime.in_flight(id);
                let now = runtime.clock.now();

                let mut requeued = 0_usize;
                for send_id in campaign
                    .canary_send_ids
                    .iter()
                    .flatten()
                    .filter(|send| pending.contains(*send) && !in_flight.contains(*send))
                {
                    self.enqueue_send(runtime, &campaign, *send_id, now);
                    requeued += 1;
                }

                tracing::info!(
                    campaign_id = %id,
                    outstanding = stats.outstanding(),
                    requeued,
                    "Canary batch not sent yet, analysis postponed"
                );
            }
        }

        Ok(Some(verdict))
    }

    /// Approve a canary campaign and release the rest of its sends
    ///
    /// # Errors
    ///
    /// If the store fails
    pub async fn start_full_send(&self, id: &CampaignId) -> Result<bool> {
        let runtime = self.runtime()?;
        let store = &runtime.store;

        let approved = store
            .transition(
                id,
                &[CampaignStatus::CanaryProcessing],
                CampaignStatus::Approved,
                CampaignPatch::default(),
            )
            .await?;
        if approved.is_none() {
            return Ok(false);
        }

        let sending = store
            .transition(
                id,
                &[CampaignStatus::Approved],
                CampaignStatus::Sending,
                CampaignPatch::default().started_sending_at(runtime.clock.now()),
            )
            .await?;
        if sending.is_none() {
            return Ok(false);
        }

        internal!(level = INFO, "Campaign {id} approved for full send");
        self.schedule_dispatch(runtime, *id, Duration::ZERO);
        Ok(true)
    }

    /// Stop a canary or sending campaign for good
    ///
    /// # Errors
    ///
    /// If the store fails
    pub async fn suspend(&self, id: &CampaignId, reason: &str) -> Result<bool> {
        let runtime = self.runtime()?;
        let Some(campaign) = runtime
            .store
            .transition(
                id,
                &[CampaignStatus::CanaryProcessing, CampaignStatus::Sending],
                CampaignStatus::Suspended,
                CampaignPatch::default().suspension_reason(reason),
            )
            .await?
        else {
            return Ok(false);
        };

        tracing::warn!(campaign_id = %id, reason, "Campaign suspended");
        runtime.notifier.sending_failed(&campaign, reason);
        Ok(true)
    }

    /// Suspend a sending campaign whose cumulative bounce or complaint rate
    /// is over its plan's limits. Returns `true` if it was suspended.
    ///
    /// # Errors
    ///
    /// If the store fails
    pub async fn check_kill_switch(&self, id: &CampaignId) -> Result<bool> {
        let runtime = self.runtime()?;
        let campaign = runtime.store.campaign(id).await?;
        if campaign.status != CampaignStatus::Sending {
            return Ok(false);
        }

        let account = runtime.store.account(&campaign.account_id).await?;
        let stats = runtime.store.send_stats(id, None).await?;
        let limits = self.risk.kill_switch_thresholds(account.plan);

        match risk::evaluate_kill_switch(&stats, limits, self.risk.kill_switch_min_sample) {
            Some(reason) => self.suspend(id, &reason).await,
            None => Ok(false),
        }
    }

    /// Pause a sending campaign
    ///
    /// # Errors
    ///
    /// If the store fails
    pub async fn pause(&self, id: &CampaignId, reason: PauseReason) -> Result<bool> {
        let runtime = self.runtime()?;
        let Some(campaign) = runtime
            .store
            .transition(
                id,
                &[CampaignStatus::Sending],
                CampaignStatus::Paused,
                CampaignPatch::default().pause_reason(reason),
            )
            .await?
        else {
            return Ok(false);
        };

        tracing::info!(campaign_id = %id, %reason, "Campaign paused");
        match reason {
            PauseReason::QuotaExceeded => runtime.notifier.quota_exceeded(&campaign),
            PauseReason::TooManyFailures => runtime
                .notifier
                .sending_failed(&campaign, "Too many send failures"),
            PauseReason::Manual | PauseReason::ConfigurationError | PauseReason::AccountPaused => {}
        }

        Ok(true)
    }

    /// Resume a paused campaign and restart its dispatcher
    ///
    /// # Errors
    ///
    /// If the store fails
    pub async fn resume(&self, id: &CampaignId) -> Result<bool> {
        let runtime = self.runtime()?;
        let resumed = runtime
            .store
            .transition(
                id,
                &[CampaignStatus::Paused],
                CampaignStatus::Sending,
                CampaignPatch::default(),
            )
            .await?;

        if resumed.is_none() {
            return Ok(false);
        }

        tracing::info!(campaign_id = %id, "Campaign resumed");
        self.schedule_dispatch(runtime, *id, Duration::ZERO);
        Ok(true)
    }

    /// Mark a sending campaign as sent
    ///
    /// # Errors
    ///
    /// If the store fails
    pub async fn complete(&self, id: &CampaignId) -> Result<bool> {
        let runtime = self.runtime()?;
        let Some(campaign) = runtime
            .store
            .transition(
                id,
                &[CampaignStatus::Sending],
                CampaignStatus::Sent,
                CampaignPatch::default().finished_sending_at(runtime.clock.now()),
            )
            .await?
        else {
            return Ok(false);
        };

        runtime.notifier.sending_completed(&campaign);
        Ok(true)
    }

    /// Cancel a campaign that has not started
    ///
    /// # Errors
    ///
    /// If the store fails
    pub async fn cancel(&self, id: &CampaignId) -> Result<bool> {
        let runtime = self.runtime()?;
        let cancelled = runtime
            .store
            .transition(
                id,
                &[CampaignStatus::Draft, CampaignStatus::Scheduled],
                CampaignStatus::Cancelled,
                CampaignPatch::default(),
            )
            .await?;

        if cancelled.is_some() {
            internal!(level = INFO, "Campaign {id} cancelled");
        }
        Ok(cancelled.is_some())
    }
}
