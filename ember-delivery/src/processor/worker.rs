//! Delivering one send
//!
//! A per-send job re-checks everything before touching the send: the send
//! must still be pending and its campaign must still accept it. The campaign
//! is checked again after the send is claimed, so a pause or suspension that
//! lands in between leaves the send pending.

use std::time::Duration;

use ember_common::tracing;
use ember_store::{
    AccountId, Campaign, CampaignId, PauseReason, Recipient, SendId, SendStatus,
};

use super::{CampaignProcessor, Runtime};
use crate::{
    error::Result,
    policy::FailureAction,
    rate_limiter::RateDecision,
    scheduler::{Job, deadline},
    transport::{OutboundMessage, mailbox},
};

/// Shortest delay before retrying a send held back by the daily quota
const MIN_QUOTA_WAIT: Duration = Duration::from_secs(1);

/// What happened to a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The provider accepted it
    Sent,
    /// Failed for good
    Failed,
    /// Failed; a retry is queued
    RetryScheduled,
    /// Held back by the rate limiter; the job is queued again
    Deferred,
    /// The campaign was paused; the send is left for resumption
    CampaignPaused,
    /// Nothing to do: the send or campaign moved on
    Skipped,
}

impl CampaignProcessor {
    /// Per-send job entry point: wait for the account's concurrency slot and
    /// deliver.
    pub(crate) async fn deliver(
        &self,
        send_id: &SendId,
        campaign_id: &CampaignId,
        account_id: &AccountId,
    ) -> Result<SendOutcome> {
        let runtime = self.runtime()?;

        let limit = match runtime.tenants.limit(account_id) {
            Some(limit) => limit,
            None => {
                let account = runtime.store.account(account_id).await?;
                let limit = runtime.rate_limiter.concurrency_limit(&account);
                runtime.tenants.resize(account_id, limit);
                limit
            }
        };

        let result = match runtime.tenants.acquire(account_id, limit).await {
            Ok(_permit) => self.process_send(send_id).await,
            Err(e) => Err(e),
        };

        if !matches!(result, Ok(SendOutcome::Deferred)) {
            runtime.untrack(campaign_id, send_id);
        }

        result
    }

    /// Deliver one send.
    ///
    /// # Errors
    ///
    /// Store failures. Provider failures are handled here and reported
    /// through the outcome.
    #[tracing::instrument(level = tracing::Level::TRACE, skip_all, fields(send_id = %send_id))]
    pub async fn process_send(&self, send_id: &SendId) -> Result<SendOutcome> {
        let runtime = self.runtime()?;
        let store = &runtime.store;

        let send = store.send(send_id).await?;
        if send.status != SendStatus::Pending {
            return Ok(SendOutcome::Skipped);
        }

        let campaign = store.campaign(&send.campaign_id).await?;
        if !campaign.accepts_send(send_id) {
            return Ok(SendOutcome::Skipped);
        }

        let account = store.account(&campaign.account_id).await?;
        if !account.active || account.is_paused() {
            tracing::warn!(
                campaign_id = %campaign.id,
                %send_id,
                error_class = "account_paused",
                "Account cannot send, pausing campaign"
            );
            return Ok(if self.pause(&campaign.id, PauseReason::AccountPaused).await? {
                SendOutcome::CampaignPaused
            } else {
                SendOutcome::Skipped
            });
        }

        let now = runtime.clock.now();
        match runtime.rate_limiter.try_acquire(&account, now) {
            RateDecision::Allowed => {}
            RateDecision::RateLimited { wait } => {
                self.defer(runtime, &campaign, *send_id, wait);
                return Ok(SendOutcome::Deferred);
            }
            RateDecision::QuotaExhausted { wait } => {
                return self.hold_for_quota(runtime, &campaign, *send_id, wait).await;
            }
        }

        if !store.claim_send(send_id).await? {
            return Ok(SendOutcome::Skipped);
        }

        // a stop may have landed while we were rate limiting
        let campaign = store.campaign(&send.campaign_id).await?;
        if !campaign.accepts_send(send_id) {
            store.release_send(send_id).await?;
            return Ok(SendOutcome::Skipped);
        }

        let recipient = Recipient {
            subscriber_id: send.subscriber_id,
            email: send.recipient_email.clone(),
            name: send.recipient_name.clone(),
        };

        let body = match runtime.renderer.render(&campaign, &recipient) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(
                    campaign_id = %campaign.id,
                    %send_id,
                    error_class = "render_error",
                    error = %e,
                    "Could not render message, pausing campaign"
                );
                store
                    .mark_failed(send_id, None, true, self.retry.max_retries)
                    .await?;
                self.pause(&campaign.id, PauseReason::ConfigurationError)
                    .await?;
                return Ok(SendOutcome::CampaignPaused);
            }
        };

        let message = OutboundMessage {
            campaign_id: campaign.id,
            send_id: *send_id,
            from: mailbox(Some(&campaign.from_name), &campaign.from_email),
            to: mailbox(recipient.name.as_deref(), &recipient.email),
            reply_to: campaign.reply_to.clone(),
            subject: campaign.subject.clone(),
            html: body.html,
            text: body.text,
        };

        let error = match runtime.transport.send(&message).await {
            Ok(message_id) => {
                let at = runtime.clock.now();
                store.mark_sent(send_id, message_id, at).await?;
                store.increment_account_sent(&account.id, 1).await?;
                return Ok(SendOutcome::Sent);
            }
            Err(e) => e,
        };

        tracing::warn!(
            campaign_id = %campaign.id,
            %send_id,
            error_class = error.class(),
            retry_count = send.retry_count,
            error = %error,
            "Send failed"
        );

        let max_retries = self.retry.max_retries;
        match self.retry.action_for(&error, send.retry_count) {
            FailureAction::Fail => {
                store.mark_failed(send_id, None, false, max_retries).await?;
                Ok(SendOutcome::Failed)
            }
            FailureAction::PauseCampaign(reason) => {
                store.mark_failed(send_id, None, true, max_retries).await?;
                self.pause(&campaign.id, reason).await?;
                Ok(SendOutcome::CampaignPaused)
            }
            FailureAction::Retry { delay } => {
                let at = deadline(runtime.clock.now(), delay);
                let failed = store
                    .mark_failed(send_id, Some(at), true, max_retries)
                    .await?;

                if self.retry.should_retry(failed.retry_count) {
                    runtime.scheduler.schedule_at(Job::Retry(*send_id), at);
                    Ok(SendOutcome::RetryScheduled)
                } else {
                    tracing::warn!(
                        campaign_id = %campaign.id,
                        %send_id,
                        retry_count = failed.retry_count,
                        "Retries exhausted"
                    );
                    Ok(SendOutcome::Failed)
                }
            }
        }
    }

    /// Park a send held back by the daily quota.
    ///
    /// A long wait pauses a sending campaign. If the campaign stopped
    /// accepting the send in the meantime the send is dropped rather than
    /// parked, so a later resume can dispatch it straight away.
    pub(crate) async fn hold_for_quota(
        &self,
        runtime: &Runtime,
        campaign: &Campaign,
        send_id: SendId,
        wait: Duration,
    ) -> Result<SendOutcome> {
        if runtime.rate_limiter.is_long_wait(wait) {
            tracing::warn!(
                campaign_id = %campaign.id,
                %send_id,
                error_class = "quota_exceeded",
                ?wait,
                "Daily quota exhausted, pausing campaign"
            );
            if self.pause(&campaign.id, PauseReason::QuotaExceeded).await? {
                return Ok(SendOutcome::CampaignPaused);
            }

            let current = runtime.store.campaign(&campaign.id).await?;
            if !current.accepts_send(&send_id) {
                tracing::debug!(
                    campaign_id = %campaign.id,
                    %send_id,
                    status = %current.status,
                    "Campaign stopped while waiting on quota, leaving send pending"
                );
                return Ok(SendOutcome::Skipped);
            }
        }

        self.defer(runtime, campaign, send_id, wait.max(MIN_QUOTA_WAIT));
        Ok(SendOutcome::Deferred)
    }

    fn defer(
        &self,
        runtime: &Runtime,
        campaign: &Campaign,
        send_id: SendId,
        wait: Duration,
    ) {
        tracing::trace!(campaign_id = %campaign.id, %send_id, ?wait, "Deferring send");
        self.enqueue_send(
            runtime,
            campaign,
            send_id,
            deadline(runtime.clock.now(), wait),
        );
    }

    /// Return a failed send to the queue if it is due for another attempt.
    ///
    /// Re-arms itself when woken before `next_retry_at`; does nothing when
    /// retries are exhausted or the campaign no longer accepts the send.
    ///
    /// # Errors
    ///
    /// If the store cannot be read or written
    pub async fn retry_send(&self, send_id: &SendId) -> Result<bool> {
        let runtime = self.runtime()?;
        let store = &runtime.store;
        let now = runtime.clock.now();

        let send = store.send(send_id).await?;
        if !send.ready_for_retry(now, self.retry.max_retries) {
            let early = send.status == SendStatus::Failed
                && self.retry.should_retry(send.retry_count);
            if let Some(at) = send.next_retry_at.filter(|at| early && *at > now) {
                runtime.scheduler.schedule_at(Job::Retry(*send_id), at);
            }
            return Ok(false);
        }

        let campaign = store.campaign(&send.campaign_id).await?;
        if !campaign.accepts_send(send_id) {
            tracing::debug!(
                campaign_id = %campaign.id,
                %send_id,
                status = %campaign.status,
                "Campaign no longer sending, abandoning retry"
            );
            return Ok(false);
        }

        if !store.reset_for_retry(send_id).await? {
            return Ok(false);
        }

        self.enqueue_send(runtime, &campaign, *send_id, now);
        Ok(true)
    }
}
