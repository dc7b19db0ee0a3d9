use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    model::{
        Account, Campaign, CampaignCounter, CampaignPatch, CampaignSend, CampaignStatus,
        SendEvent, SendStats,
    },
    types::{AccountId, CampaignId, SendId},
};

/// Storage for campaigns, their sends and the owning accounts.
///
/// Every operation that changes more than one field (a status change with its
/// timestamps, a send outcome with its campaign counter) is atomic with
/// respect to every other call on the same store. Counters only move through
/// increments performed inside the store, never read-modify-write by callers.
#[async_trait]
pub trait CampaignStore: Send + Sync + std::fmt::Debug {
    /// Store a new campaign. Only drafts can be inserted.
    ///
    /// # Errors
    /// Fails if the id is taken or the campaign is not a draft.
    async fn insert_campaign(&self, campaign: Campaign) -> crate::Result<()>;

    /// # Errors
    /// [`StoreError::CampaignNotFound`](crate::StoreError::CampaignNotFound) if unknown
    async fn campaign(&self, id: &CampaignId) -> crate::Result<Campaign>;

    /// All campaigns, optionally filtered by status, ordered by id
    async fn campaigns(&self, status: Option<CampaignStatus>) -> crate::Result<Vec<Campaign>>;

    /// Remove a campaign together with all of its sends
    async fn delete_campaign(&self, id: &CampaignId) -> crate::Result<()>;

    /// Compare-and-set the campaign status.
    ///
    /// Returns `Ok(None)` and leaves the campaign untouched when its current
    /// status is not one of `expected`. Otherwise moves to `to`, applies
    /// `patch` and returns the updated campaign.
    ///
    /// # Errors
    /// Fails if `to` is not an edge from the current status, or the patch
    /// tries to overwrite a recorded canary sample.
    async fn transition(
        &self,
        id: &CampaignId,
        expected: &[CampaignStatus],
        to: CampaignStatus,
        patch: CampaignPatch,
    ) -> crate::Result<Option<Campaign>>;

    async fn increment_counter(
        &self,
        id: &CampaignId,
        counter: CampaignCounter,
        by: u64,
    ) -> crate::Result<()>;

    async fn set_total_recipients(&self, id: &CampaignId, total: u64) -> crate::Result<()>;

    /// Record materialization progress
    async fn set_preparation(
        &self,
        id: &CampaignId,
        sends_created: u64,
        progress: u8,
    ) -> crate::Result<()>;

    /// Insert a send, or return the existing one for the same
    /// (campaign, subscriber) pair. The flag is `true` when a row was created.
    async fn insert_send(&self, send: CampaignSend) -> crate::Result<(SendId, bool)>;

    async fn send(&self, id: &SendId) -> crate::Result<CampaignSend>;

    /// Up to `limit` pending sends of a campaign in id order, skipping `exclude`
    async fn pending_sends(
        &self,
        campaign: &CampaignId,
        limit: usize,
        exclude: &HashSet<SendId>,
    ) -> crate::Result<Vec<SendId>>;

    /// Every pending send of a campaign
    async fn pending_send_ids(&self, campaign: &CampaignId) -> crate::Result<Vec<SendId>>;

    /// Outcome tallies for a campaign, or for the given subset of its sends
    async fn send_stats(
        &self,
        campaign: &CampaignId,
        only: Option<&BTreeSet<SendId>>,
    ) -> crate::Result<SendStats>;

    /// Sends of a campaign with `sent_at >= since`
    async fn count_sent_since(
        &self,
        campaign: &CampaignId,
        since: DateTime<Utc>,
    ) -> crate::Result<u64>;

    /// Move a send from `pending` to `sending`. `false` if it was not pending.
    async fn claim_send(&self, id: &SendId) -> crate::Result<bool>;

    /// Return a claimed send to `pending` without counting an attempt
    async fn release_send(&self, id: &SendId) -> crate::Result<()>;

    /// Mark a send `sent` and bump the campaign's `sent_count` in one step
    async fn mark_sent(
        &self,
        id: &SendId,
        provider_message_id: String,
        at: DateTime<Utc>,
    ) -> crate::Result<()>;

    /// Mark a send `failed`.
    ///
    /// When `count_attempt` is set the retry count is incremented, saturating
    /// at `max_retries`. `next_retry_at` is replaced with the given value.
    async fn mark_failed(
        &self,
        id: &SendId,
        next_retry_at: Option<DateTime<Utc>>,
        count_attempt: bool,
        max_retries: u8,
    ) -> crate::Result<CampaignSend>;

    /// Move a send from `failed` back to `pending`. `false` if it was not failed.
    async fn reset_for_retry(&self, id: &SendId) -> crate::Result<bool>;

    /// Apply a telemetry event and bump the matching campaign counter.
    ///
    /// Returns `false` when the event had already been recorded.
    async fn record_event(
        &self,
        id: &SendId,
        event: SendEvent,
        at: DateTime<Utc>,
    ) -> crate::Result<bool>;

    async fn find_send_by_message_id(&self, message_id: &str) -> crate::Result<Option<SendId>>;

    /// Insert or replace an account
    async fn put_account(&self, account: Account) -> crate::Result<()>;

    async fn account(&self, id: &AccountId) -> crate::Result<Account>;

    /// Bump the account's rolling daily counter after a provider success
    async fn increment_account_sent(&self, id: &AccountId, by: u64) -> crate::Result<Account>;
}
