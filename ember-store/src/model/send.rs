use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CampaignCounter;
use crate::types::{CampaignId, SendId, SubscriberId};

/// Dispatch status of a send.
///
/// `pending -> sending -> {sent | failed}`, with `failed -> pending` when a
/// retry is picked up. Provider telemetry (delivered, bounced, complained) is
/// tracked as separate markers on [`CampaignSend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    #[default]
    Pending,
    Sending,
    Sent,
    Failed,
}

impl SendStatus {
    /// Still owed work by the dispatcher
    #[must_use]
    pub const fn is_outstanding(self) -> bool {
        matches!(self, Self::Pending | Self::Sending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BounceType {
    Permanent,
    Transient,
}

/// A provider telemetry or engagement event for one send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendEvent {
    Delivered,
    Bounced {
        bounce_type: BounceType,
        reason: Option<String>,
    },
    Complained,
    Opened,
    Clicked,
    Unsubscribed,
}

/// One campaign x recipient delivery record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignSend {
    pub id: SendId,
    pub campaign_id: CampaignId,
    pub subscriber_id: SubscriberId,
    pub recipient_email: String,
    pub recipient_name: Option<String>,
    pub status: SendStatus,

    pub provider_message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,

    pub delivered_at: Option<DateTime<Utc>>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub bounce_type: Option<BounceType>,
    pub bounce_reason: Option<String>,
    pub complained_at: Option<DateTime<Utc>>,

    pub opened_at: Option<DateTime<Utc>>,
    pub open_count: u32,
    pub first_clicked_at: Option<DateTime<Utc>>,
    pub click_count: u32,
    pub unsubscribed_at: Option<DateTime<Utc>>,

    pub retry_count: u8,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl CampaignSend {
    #[must_use]
    pub fn new(
        campaign_id: CampaignId,
        subscriber_id: SubscriberId,
        recipient_email: impl Into<String>,
    ) -> Self {
        Self {
            id: SendId::generate(),
            campaign_id,
            subscriber_id,
            recipient_email: recipient_email.into(),
            recipient_name: None,
            status: SendStatus::Pending,
            provider_message_id: None,
            sent_at: None,
            delivered_at: None,
            bounced_at: None,
            bounce_type: None,
            bounce_reason: None,
            complained_at: None,
            opened_at: None,
            open_count: 0,
            first_clicked_at: None,
            click_count: 0,
            unsubscribed_at: None,
            retry_count: 0,
            next_retry_at: None,
        }
    }

    /// Eligible to be reset to `pending` by the retry job
    #[must_use]
    pub fn ready_for_retry(&self, now: DateTime<Utc>, max_retries: u8) -> bool {
        self.status == SendStatus::Failed
            && self.retry_count < max_retries
            && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Whether the provider has reported a final outcome for this send
    #[must_use]
    pub const fn is_observed(&self) -> bool {
        self.delivered_at.is_some() || self.bounced_at.is_some() || self.complained_at.is_some()
    }

    #[must_use]
    pub fn is_permanent_bounce(&self) -> bool {
        self.bounced_at.is_some() && self.bounce_type == Some(BounceType::Permanent)
    }

    /// Apply a telemetry event and report the campaign counter it bumps.
    ///
    /// Returns `None` when the event was already recorded, so replaying the
    /// same callback never counts twice. Opens and clicks still bump the
    /// per-send totals on every call, and a permanent bounce still upgrades
    /// an earlier transient one.
    pub fn record(&mut self, event: SendEvent, now: DateTime<Utc>) -> Option<CampaignCounter> {
        match event {
            SendEvent::Delivered => {
                if self.delivered_at.is_some() {
                    return None;
                }
                self.delivered_at = Some(now);
                Some(CampaignCounter::Delivered)
            }
            SendEvent::Bounced {
                bounce_type,
                reason,
            } => {
                if self.bounced_at.is_some() {
                    // a hard bounce replaces a soft one without counting twice
                    if bounce_type == BounceType::Permanent
                        && self.bounce_type != Some(BounceType::Permanent)
                    {
                        self.bounce_type = Some(bounce_type);
                        if reason.is_some() {
                            self.bounce_reason = reason;
                        }
                    }
                    return None;
                }
                self.bounced_at = Some(now);
                self.bounce_type = Some(bounce_type);
                self.bounce_reason = reason;
                Some(CampaignCounter::Bounced)
            }
            SendEvent::Complained => {
                if self.complained_at.is_some() {
                    return None;
                }
                self.complained_at = Some(now);
                Some(CampaignCounter::Complained)
            }
            SendEvent::Opened => {
                self.open_count = self.open_count.saturating_add(1);
                if self.opened_at.is_some() {
                    return None;
                }
                self.opened_at = Some(now);
                Some(CampaignCounter::Opened)
            }
            SendEvent::Clicked => {
                self.click_count = self.click_count.saturating_add(1);
                if self.first_clicked_at.is_some() {
                    return None;
                }
                self.first_clicked_at = Some(now);
                Some(CampaignCounter::Clicked)
            }
            SendEvent::Unsubscribed => {
                if self.unsubscribed_at.is_some() {
                    return None;
                }
                self.unsubscribed_at = Some(now);
                Some(CampaignCounter::Unsubscribed)
            }
        }
    }
}

/// Outcome tallies over a set of sends, used by canary analysis and the
/// kill-switch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendStats {
    pub total: u64,
    pub pending: u64,
    pub sending: u64,
    pub sent: u64,
    pub failed: u64,
    pub delivered: u64,
    pub permanent_bounces: u64,
    pub transient_bounces: u64,
    pub complaints: u64,
    /// Sends with a delivered, bounced or complained marker
    pub observed: u64,
}

impl SendStats {
    pub fn add(&mut self, send: &CampaignSend) {
        self.total += 1;
        match send.status {
            SendStatus::Pending => self.pending += 1,
            SendStatus::Sending => self.sending += 1,
            SendStatus::Sent => self.sent += 1,
            SendStatus::Failed => self.failed += 1,
        }
        if send.delivered_at.is_some() {
            self.delivered += 1;
        }
        if send.bounced_at.is_some() {
            match send.bounce_type {
                Some(BounceType::Permanent) => self.permanent_bounces += 1,
                _ => self.transient_bounces += 1,
            }
        }
        if send.complained_at.is_some() {
            self.complaints += 1;
        }
        if send.is_observed() {
            self.observed += 1;
        }
    }

    #[must_use]
    pub const fn outstanding(&self) -> u64 {
        self.pending + self.sending
    }
}

impl<'a> FromIterator<&'a CampaignSend> for SendStats {
    fn from_iter<I: IntoIterator<Item = &'a CampaignSend>>(iter: I) -> Self {
        let mut stats = Self::default();
        for send in iter {
            stats.add(send);
        }
        stats
    }
}
