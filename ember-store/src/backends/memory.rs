use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    StoreError,
    model::{
        Account, Campaign, CampaignCounter, CampaignPatch, CampaignSend, CampaignStatus,
        SendEvent, SendStats, SendStatus,
    },
    r#trait::CampaignStore,
    types::{AccountId, CampaignId, SendId, SubscriberId},
};

#[derive(Debug, Default)]
struct Tables {
    campaigns: BTreeMap<CampaignId, Campaign>,
    sends: HashMap<SendId, CampaignSend>,
    /// Sends of each campaign, in id (creation) order
    by_campaign: HashMap<CampaignId, BTreeSet<SendId>>,
    by_recipient: HashMap<(CampaignId, SubscriberId), SendId>,
    by_message_id: HashMap<String, SendId>,
    accounts: HashMap<AccountId, Account>,
}

impl Tables {
    fn campaign_mut(&mut self, id: &CampaignId) -> crate::Result<&mut Campaign> {
        self.campaigns
            .get_mut(id)
            .ok_or(StoreError::CampaignNotFound(*id))
    }

    fn send_mut(&mut self, id: &SendId) -> crate::Result<&mut CampaignSend> {
        self.sends.get_mut(id).ok_or(StoreError::SendNotFound(*id))
    }

    fn sends_of<'a>(&'a self, campaign: &CampaignId) -> impl Iterator<Item = &'a CampaignSend> {
        self.by_campaign
            .get(campaign)
            .into_iter()
            .flatten()
            .filter_map(|id| self.sends.get(id))
    }
}

/// In-memory campaign store.
///
/// All tables sit behind a single `RwLock`, so every trait operation is
/// atomic with respect to every other one. Intended for development, tests
/// and single-node deployments that can afford to lose state on restart.
///
/// # Capacity Management
/// The store can be given a maximum number of sends. Once reached, inserting
/// a new send fails with [`StoreError::CapacityExceeded`]; re-inserting an
/// existing (campaign, subscriber) pair still succeeds.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    /// Maximum number of sends to store (None = unlimited)
    capacity: Option<usize>,
}

impl MemoryStore {
    /// Create a new empty store with unlimited capacity
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new store that holds at most `capacity` sends
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tables: Arc::default(),
            capacity: Some(capacity),
        }
    }

    /// Number of sends held
    ///
    /// Recovers gracefully if the lock is poisoned by accessing the underlying data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .sends
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the configured capacity (None = unlimited)
    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn insert_campaign(&self, campaign: Campaign) -> crate::Result<()> {
        if campaign.status != CampaignStatus::Draft {
            return Err(StoreError::NotDraft {
                id: campaign.id,
                status: campaign.status,
            });
        }

        let mut tables = self.tables.write()?;
        if tables.campaigns.contains_key(&campaign.id) {
            return Err(StoreError::CampaignExists(campaign.id));
        }

        tables.by_campaign.entry(campaign.id).or_default();
        tables.campaigns.insert(campaign.id, campaign);
        Ok(())
    }

    async fn campaign(&self, id: &CampaignId) -> crate::Result<Campaign> {
        self.tables
            .read()?
            .campaigns
            .get(id)
            .cloned()
            .ok_or(StoreError::CampaignNotFound(*id))
    }

    async fn campaigns(&self, status: Option<CampaignStatus>) -> crate::Result<Vec<Campaign>> {
        Ok(self
            .tables
            .read()?
            .campaigns
            .values()
            .filter(|campaign| status.is_none_or(|status| campaign.status == status))
            .cloned()
            .collect())
    }

    async fn delete_campaign(&self, id: &CampaignId) -> crate::Result<()> {
        let mut tables = self.tables.write()?;
        tables
            .campaigns
            .remove(id)
            .ok_or(StoreError::CampaignNotFound(*id))?;

        for send_id in tables.by_campaign.remove(id).unwrap_or_default() {
            if let Some(send) = tables.sends.remove(&send_id) {
                tables.by_recipient.remove(&(*id, send.subscriber_id));
                if let Some(message_id) = send.provider_message_id {
                    tables.by_message_id.remove(&message_id);
                }
            }
        }

        Ok(())
    }

    async fn transition(
        &self,
        id: &CampaignId,
        expected: &[CampaignStatus],
        to: CampaignStatus,
        patch: CampaignPatch,
    ) -> crate::Result<Option<Campaign>> {
        let mut tables = self.tables.write()?;

        if let Some(ids) = &patch.canary_send_ids {
            let owned = tables.by_campaign.get(id);
            if let Some(foreign) = ids
                .iter()
                .find(|send| !owned.is_some_and(|owned| owned.contains(send)))
            {
                return Err(StoreError::ForeignSend {
                    campaign: *id,
                    send: *foreign,
                });
            }
        }

        let campaign = tables.campaign_mut(id)?;
        if !expected.contains(&campaign.status) {
            tracing::trace!(
                campaign = %id,
                from = %campaign.status,
                %to,
                "Transition guard refused"
            );
            return Ok(None);
        }

        let from = campaign.status;
        campaign.apply_transition(to, patch)?;
        tracing::debug!(campaign = %id, %from, %to, "Campaign transitioned");
        Ok(Some(campaign.clone()))
    }

    async fn increment_counter(
        &self,
        id: &CampaignId,
        counter: CampaignCounter,
        by: u64,
    ) -> crate::Result<()> {
        self.tables.write()?.campaign_mut(id)?.increment(counter, by);
        Ok(())
    }

    async fn set_total_recipients(&self, id: &CampaignId, total: u64) -> crate::Result<()> {
        self.tables.write()?.campaign_mut(id)?.total_recipients = total;
        Ok(())
    }

    async fn set_preparation(
        &self,
        id: &CampaignId,
        sends_created: u64,
        progress: u8,
    ) -> crate::Result<()> {
        let mut tables = self.tables.write()?;
        let campaign = tables.campaign_mut(id)?;
        campaign.sends_created_count = sends_created;
        campaign.preparation_progress = progress.min(100);
        Ok(())
    }

    async fn insert_send(&self, send: CampaignSend) -> crate::Result<(SendId, bool)> {
        let mut tables = self.tables.write()?;

        if !tables.campaigns.contains_key(&send.campaign_id) {
            return Err(StoreError::CampaignNotFound(send.campaign_id));
        }

        let key = (send.campaign_id, send.subscriber_id);
        if let Some(existing) = tables.by_recipient.get(&key) {
            return Ok((*existing, false));
        }

        if let Some(capacity) = self.capacity
            && tables.sends.len() >= capacity
        {
            return Err(StoreError::CapacityExceeded {
                current: tables.sends.len(),
                capacity,
            });
        }

        let id = send.id;
        tables.by_recipient.insert(key, id);
        tables
            .by_campaign
            .entry(send.campaign_id)
            .or_default()
            .insert(id);
        tables.sends.insert(id, send);

        Ok((id, true))
    }

    async fn send(&self, id: &SendId) -> crate::Result<CampaignSend> {
        self.tables
            .read()?
            .sends
            .get(id)
            .cloned()
            .ok_or(StoreError::SendNotFound(*id))
    }

    async fn pending_sends(
        &self,
        campaign: &CampaignId,
        limit: usize,
        exclude: &HashSet<SendId>,
    ) -> crate::Result<Vec<SendId>> {
        let tables = self.tables.read()?;
        Ok(tables
            .sends_of(campaign)
            .filter(|send| send.status == SendStatus::Pending && !exclude.contains(&send.id))
            .map(|send| send.id)
            .take(limit)
            .collect())
    }

    async fn pending_send_ids(&self, campaign: &CampaignId) -> crate::Result<Vec<SendId>> {
        let tables = self.tables.read()?;
        Ok(tables
            .sends_of(campaign)
            .filter(|send| send.status == SendStatus::Pending)
            .map(|send| send.id)
            .collect())
    }

    async fn send_stats(
        &self,
        campaign: &CampaignId,
        only: Option<&BTreeSet<SendId>>,
    ) -> crate::Result<SendStats> {
        let tables = self.tables.read()?;
        Ok(match only {
            Some(ids) => ids
                .iter()
                .filter_map(|id| tables.sends.get(id))
                .filter(|send| send.campaign_id == *campaign)
                .collect(),
            None => tables.sends_of(campaign).collect(),
        })
    }

    async fn count_sent_since(
        &self,
        campaign: &CampaignId,
        since: DateTime<Utc>,
    ) -> crate::Result<u64> {
        let tables = self.tables.read()?;
        Ok(tables
            .sends_of(campaign)
            .filter(|send| send.sent_at.is_some_and(|at| at >= since))
            .count() as u64)
    }

    async fn claim_send(&self, id: &SendId) -> crate::Result<bool> {
        let mut tables = self.tables.write()?;
        let send = tables.send_mut(id)?;
        if send.status != SendStatus::Pending {
            return Ok(false);
        }
        send.status = SendStatus::Sending;
        Ok(true)
    }

    async fn release_send(&self, id: &SendId) -> crate::Result<()> {
        let mut tables = self.tables.write()?;
        let send = tables.send_mut(id)?;
        if send.status == SendStatus::Sending {
            send.status = SendStatus::Pending;
        }
        Ok(())
    }

    async fn mark_sent(
        &self,
        id: &SendId,
        provider_message_id: String,
        at: DateTime<Utc>,
    ) -> crate::Result<()> {
        let mut tables = self.tables.write()?;
        let send = tables.send_mut(id)?;
        let campaign_id = send.campaign_id;

        send.status = SendStatus::Sent;
        send.sent_at = Some(at);
        send.next_retry_at = None;
        send.provider_message_id = Some(provider_message_id.clone());

        tables.by_message_id.insert(provider_message_id, *id);
        tables
            .campaign_mut(&campaign_id)?
            .increment(CampaignCounter::Sent, 1);

        Ok(())
    }

    async fn mark_failed(
        &self,
        id: &SendId,
        next_retry_at: Option<DateTime<Utc>>,
        count_attempt: bool,
        max_retries: u8,
    ) -> crate::Result<CampaignSend> {
        let mut tables = self.tables.write()?;
        let send = tables.send_mut(id)?;

        send.status = SendStatus::Failed;
        if count_attempt {
            send.retry_count = send.retry_count.saturating_add(1).min(max_retries);
        }
        send.next_retry_at = next_retry_at;

        Ok(send.clone())
    }

    async fn reset_for_retry(&self, id: &SendId) -> crate::Result<bool> {
        let mut tables = self.tables.write()?;
        let send = tables.send_mut(id)?;
        if send.status != SendStatus::Failed {
            return Ok(false);
        }
        send.status = SendStatus::Pending;
        Ok(true)
    }

    async fn record_event(
        &self,
        id: &SendId,
        event: SendEvent,
        at: DateTime<Utc>,
    ) -> crate::Result<bool> {
        let mut tables = self.tables.write()?;
        let send = tables.send_mut(id)?;
        let campaign_id = send.campaign_id;

        let Some(counter) = send.record(event, at) else {
            return Ok(false);
        };

        tables.campaign_mut(&campaign_id)?.increment(counter, 1);
        Ok(true)
    }

    async fn find_send_by_message_id(&self, message_id: &str) -> crate::Result<Option<SendId>> {
        Ok(self.tables.read()?.by_message_id.get(message_id).copied())
    }

    async fn put_account(&self, account: Account) -> crate::Result<()> {
        self.tables.write()?.accounts.insert(account.id, account);
        Ok(())
    }

    async fn account(&self, id: &AccountId) -> crate::Result<Account> {
        self.tables
            .read()?
            .accounts
            .get(id)
            .cloned()
            .ok_or(StoreError::AccountNotFound(*id))
    }

    async fn increment_account_sent(&self, id: &AccountId, by: u64) -> crate::Result<Account> {
        let mut tables = self.tables.write()?;
        let account = tables
            .accounts
            .get_mut(id)
            .ok_or(StoreError::AccountNotFound(*id))?;
        account.sent_last_24_hours = account.sent_last_24_hours.saturating_add(by);
        Ok(account.clone())
    }
}
