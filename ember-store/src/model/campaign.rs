use std::{collections::BTreeSet, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Audience, percentage};
use crate::{
    StoreError,
    types::{AccountId, CampaignId, ListId, SegmentId, SendId, TemplateId},
};

/// Lifecycle status of a campaign.
///
/// The only way to change a stored campaign's status is
/// [`CampaignStore::transition`](crate::CampaignStore::transition), which
/// refuses anything that is not an edge in [`Self::can_transition_to`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    #[default]
    Draft,
    Scheduled,
    QueuedForReview,
    CanaryProcessing,
    /// Canary analysis passed; held only until the full send starts.
    Approved,
    Sending,
    Paused,
    Suspended,
    Sent,
    Cancelled,
}

impl CampaignStatus {
    pub const ALL: [Self; 10] = [
        Self::Draft,
        Self::Scheduled,
        Self::QueuedForReview,
        Self::CanaryProcessing,
        Self::Approved,
        Self::Sending,
        Self::Paused,
        Self::Suspended,
        Self::Sent,
        Self::Cancelled,
    ];

    /// Whether `self -> next` is an edge of the campaign state machine
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (
                Self::Draft,
                Self::Scheduled | Self::QueuedForReview | Self::Sending | Self::Cancelled
            ) | (
                Self::Scheduled,
                Self::QueuedForReview | Self::Sending | Self::Cancelled
            ) | (Self::QueuedForReview, Self::CanaryProcessing | Self::Sending)
                | (Self::CanaryProcessing, Self::Approved | Self::Suspended)
                | (Self::Approved | Self::Paused, Self::Sending)
                | (Self::Sending, Self::Paused | Self::Sent | Self::Suspended)
        )
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Cancelled | Self::Suspended)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::QueuedForReview => "queued_for_review",
            Self::CanaryProcessing => "canary_processing",
            Self::Approved => "approved",
            Self::Sending => "sending",
            Self::Paused => "paused",
            Self::Suspended => "suspended",
            Self::Sent => "sent",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown campaign status: {s}"))
    }
}

/// Why a campaign left `sending` for `paused`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Manual,
    QuotaExceeded,
    TooManyFailures,
    ConfigurationError,
    AccountPaused,
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Manual => "manual",
            Self::QuotaExceeded => "quota exceeded",
            Self::TooManyFailures => "too many failures",
            Self::ConfigurationError => "configuration error",
            Self::AccountPaused => "account sending paused",
        })
    }
}

/// Monotonic campaign counters that are bumped by atomic increments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CampaignCounter {
    Sent,
    Delivered,
    Bounced,
    Complained,
    Opened,
    Clicked,
    Unsubscribed,
}

/// Timestamp and reason fields written together with a status change.
///
/// Fields left as `None` are untouched. `started_sending_at` only records the
/// first start, so a resume keeps the original timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CampaignPatch {
    pub scheduled_at: Option<DateTime<Utc>>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_sending_at: Option<DateTime<Utc>>,
    pub finished_sending_at: Option<DateTime<Utc>>,
    pub canary_started_at: Option<DateTime<Utc>>,
    pub canary_send_ids: Option<BTreeSet<SendId>>,
    pub suspension_reason: Option<String>,
    pub pause_reason: Option<PauseReason>,
}

impl CampaignPatch {
    #[must_use]
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    #[must_use]
    pub fn queued_at(mut self, at: DateTime<Utc>) -> Self {
        self.queued_at = Some(at);
        self
    }

    #[must_use]
    pub fn started_sending_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_sending_at = Some(at);
        self
    }

    #[must_use]
    pub fn finished_sending_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_sending_at = Some(at);
        self
    }

    #[must_use]
    pub fn canary(mut self, ids: BTreeSet<SendId>, started_at: DateTime<Utc>) -> Self {
        self.canary_send_ids = Some(ids);
        self.canary_started_at = Some(started_at);
        self
    }

    #[must_use]
    pub fn suspension_reason(mut self, reason: impl Into<String>) -> Self {
        self.suspension_reason = Some(reason.into());
        self
    }

    #[must_use]
    pub const fn pause_reason(mut self, reason: PauseReason) -> Self {
        self.pause_reason = Some(reason);
        self
    }
}

/// A bulk-mail campaign owned by one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    #[serde(default = "CampaignId::generate")]
    pub id: CampaignId,
    pub account_id: AccountId,
    pub name: String,
    pub subject: String,
    pub from_name: String,
    pub from_email: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    pub list_id: ListId,
    #[serde(default)]
    pub segment_id: Option<SegmentId>,
    #[serde(default)]
    pub template_id: Option<TemplateId>,

    #[serde(default)]
    pub status: CampaignStatus,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_sending_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_sending_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub canary_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub canary_send_ids: Option<BTreeSet<SendId>>,
    #[serde(default)]
    pub suspension_reason: Option<String>,
    #[serde(default)]
    pub pause_reason: Option<PauseReason>,

    #[serde(default)]
    pub total_recipients: u64,
    #[serde(default)]
    pub sent_count: u64,
    #[serde(default)]
    pub delivered_count: u64,
    #[serde(default)]
    pub bounced_count: u64,
    #[serde(default)]
    pub complained_count: u64,
    #[serde(default)]
    pub opened_count: u64,
    #[serde(default)]
    pub clicked_count: u64,
    #[serde(default)]
    pub unsubscribed_count: u64,

    /// Materialization progress, 0 to 100
    #[serde(default)]
    pub preparation_progress: u8,
    #[serde(default)]
    pub sends_created_count: u64,
}

impl Campaign {
    /// A new draft campaign targeting every active subscriber of `list_id`
    #[must_use]
    pub fn new(
        account_id: AccountId,
        list_id: ListId,
        name: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            id: CampaignId::generate(),
            account_id,
            name: name.into(),
            subject: subject.into(),
            from_name: String::new(),
            from_email: String::new(),
            reply_to: None,
            list_id,
            segment_id: None,
            template_id: None,
            status: CampaignStatus::Draft,
            scheduled_at: None,
            queued_at: None,
            started_sending_at: None,
            finished_sending_at: None,
            canary_started_at: None,
            canary_send_ids: None,
            suspension_reason: None,
            pause_reason: None,
            total_recipients: 0,
            sent_count: 0,
            delivered_count: 0,
            bounced_count: 0,
            complained_count: 0,
            opened_count: 0,
            clicked_count: 0,
            unsubscribed_count: 0,
            preparation_progress: 0,
            sends_created_count: 0,
        }
    }

    #[must_use]
    pub fn with_sender(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.from_name = name.into();
        self.from_email = email.into();
        self
    }

    #[must_use]
    pub const fn with_segment(mut self, segment_id: SegmentId) -> Self {
        self.segment_id = Some(segment_id);
        self
    }

    #[must_use]
    pub const fn audience(&self) -> Audience {
        Audience {
            list_id: self.list_id,
            segment_id: self.segment_id,
        }
    }

    /// Whether the campaign is still in a state from which it can be started
    #[must_use]
    pub const fn is_startable(&self) -> bool {
        matches!(
            self.status,
            CampaignStatus::Draft | CampaignStatus::Scheduled
        )
    }

    #[must_use]
    pub fn is_canary(&self, send_id: &SendId) -> bool {
        self.canary_send_ids
            .as_ref()
            .is_some_and(|ids| ids.contains(send_id))
    }

    /// Whether a per-send worker may deliver `send_id` right now.
    ///
    /// A `sending` campaign accepts every send; a `canary_processing` campaign
    /// accepts only its canary sample.
    #[must_use]
    pub fn accepts_send(&self, send_id: &SendId) -> bool {
        match self.status {
            CampaignStatus::Sending => true,
            CampaignStatus::CanaryProcessing => self.is_canary(send_id),
            _ => false,
        }
    }

    #[must_use]
    pub const fn counter(&self, counter: CampaignCounter) -> u64 {
        match counter {
            CampaignCounter::Sent => self.sent_count,
            CampaignCounter::Delivered => self.delivered_count,
            CampaignCounter::Bounced => self.bounced_count,
            CampaignCounter::Complained => self.complained_count,
            CampaignCounter::Opened => self.opened_count,
            CampaignCounter::Clicked => self.clicked_count,
            CampaignCounter::Unsubscribed => self.unsubscribed_count,
        }
    }

    /// Atomically (under the backend's lock) bump one counter
    pub const fn increment(&mut self, counter: CampaignCounter, by: u64) {
        let slot = match counter {
            CampaignCounter::Sent => &mut self.sent_count,
            CampaignCounter::Delivered => &mut self.delivered_count,
            CampaignCounter::Bounced => &mut self.bounced_count,
            CampaignCounter::Complained => &mut self.complained_count,
            CampaignCounter::Opened => &mut self.opened_count,
            CampaignCounter::Clicked => &mut self.clicked_count,
            CampaignCounter::Unsubscribed => &mut self.unsubscribed_count,
        };
        *slot = slot.saturating_add(by);
    }

    /// Move to `next`, applying `patch` in the same step.
    ///
    /// Backends call this while holding the campaign's write lock, which is
    /// what makes a transition atomic with respect to concurrent workers.
    ///
    /// # Errors
    ///
    /// Fails if `next` is not an edge from the current status, or if the
    /// patch tries to replace an already recorded canary sample.
    pub fn apply_transition(
        &mut self,
        next: CampaignStatus,
        patch: CampaignPatch,
    ) -> crate::Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        if patch.canary_send_ids.is_some() && self.canary_send_ids.is_some() {
            return Err(StoreError::CanaryAlreadySet(self.id));
        }

        self.status = next;

        if let Some(at) = patch.scheduled_at {
            self.scheduled_at = Some(at);
        }
        if let Some(at) = patch.queued_at {
            self.queued_at = Some(at);
        }
        if let Some(at) = patch.started_sending_at {
            self.started_sending_at.get_or_insert(at);
        }
        if let Some(at) = patch.finished_sending_at {
            self.finished_sending_at = Some(at);
        }
        if let Some(at) = patch.canary_started_at {
            self.canary_started_at = Some(at);
        }
        if let Some(ids) = patch.canary_send_ids {
            self.canary_send_ids = Some(ids);
        }
        if let Some(reason) = patch.suspension_reason {
            self.suspension_reason = Some(reason);
        }

        self.pause_reason = if next == CampaignStatus::Paused {
            patch.pause_reason.or(Some(PauseReason::Manual))
        } else {
            None
        };

        Ok(())
    }

    /// Sent over total recipients, one decimal
    #[must_use]
    pub fn percent_complete(&self) -> f64 {
        percentage(self.sent_count, self.total_recipients, 1)
    }

    #[must_use]
    pub fn open_rate(&self) -> f64 {
        percentage(self.opened_count, self.delivered_count, 2)
    }

    #[must_use]
    pub fn click_rate(&self) -> f64 {
        percentage(self.clicked_count, self.delivered_count, 2)
    }

    #[must_use]
    pub fn bounce_rate(&self) -> f64 {
        percentage(self.bounced_count, self.sent_count, 2)
    }

    #[must_use]
    pub const fn preparing_sends(&self) -> bool {
        self.preparation_progress < 100 && self.sends_created_count < self.total_recipients
    }

    #[must_use]
    pub const fn preparation_complete(&self) -> bool {
        self.preparation_progress == 100 && self.sends_created_count == self.total_recipients
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn campaign() -> Campaign {
        Campaign::new(AccountId::generate(), ListId::generate(), "News", "Hello")
    }

    #[test]
    fn only_listed_edges_are_allowed() {
        use CampaignStatus::{
            Approved, CanaryProcessing, Cancelled, Draft, Paused, QueuedForReview, Scheduled, Sending,
            Sent, Suspended,
        };

        let allowed = [
            (Draft, Scheduled),
            (Draft, QueuedForReview),
            (Draft, Sending),
            (Draft, Cancelled),
            (Scheduled, QueuedForReview),
            (Scheduled, Sending),
            (Scheduled, Cancelled),
            (QueuedForReview, CanaryProcessing),
            (QueuedForReview, Sending),
            (CanaryProcessing, Approved),
            (CanaryProcessing, Suspended),
            (Approved, Sending),
            (Sending, Paused),
            (Sending, Sent),
            (Sending, Suspended),
            (Paused, Sending),
        ];

        for from in CampaignStatus::ALL {
            for to in CampaignStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for status in CampaignStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(
                CampaignStatus::ALL
                    .into_iter()
                    .all(|next| !status.can_transition_to(next))
            );
        }
    }

    #[test]
    fn invalid_transition_leaves_campaign_untouched() {
        let mut campaign = campaign();
        let before = campaign.clone();

        let result = campaign.apply_transition(
            CampaignStatus::Sent,
            CampaignPatch::default().finished_sending_at(Utc::now()),
        );

        assert!(matches!(
            result,
            Err(StoreError::InvalidTransition {
                from: CampaignStatus::Draft,
                to: CampaignStatus::Sent
            })
        ));
        assert_eq!(campaign, before);
    }

    #[test]
    fn canary_sample_is_immutable() {
        let mut campaign = campaign();
        campaign.status = CampaignStatus::QueuedForReview;
        let ids: BTreeSet<_> = (0..3).map(|_| SendId::generate()).collect();

        campaign
            .apply_transition(
                CampaignStatus::CanaryProcessing,
                CampaignPatch::default().canary(ids.clone(), Utc::now()),
            )
            .unwrap();
        assert_eq!(campaign.canary_send_ids.as_ref(), Some(&ids));

        campaign.status = CampaignStatus::QueuedForReview;
        let again = campaign.apply_transition(
            CampaignStatus::CanaryProcessing,
            CampaignPatch::default().canary(BTreeSet::new(), Utc::now()),
        );
        assert!(matches!(again, Err(StoreError::CanaryAlreadySet(_))));
    }

    #[test]
    fn pause_reason_is_cleared_on_resume() {
        let mut campaign = campaign();
        campaign.status = CampaignStatus::Sending;

        campaign
            .apply_transition(
                CampaignStatus::Paused,
                CampaignPatch::default().pause_reason(PauseReason::QuotaExceeded),
            )
            .unwrap();
        assert_eq!(campaign.pause_reason, Some(PauseReason::QuotaExceeded));

        campaign
            .apply_transition(CampaignStatus::Sending, CampaignPatch::default())
            .unwrap();
        assert_eq!(campaign.pause_reason, None);
    }

    #[test]
    fn canary_processing_only_accepts_canary_sends() {
        let mut campaign = campaign();
        let canary = SendId::generate();
        let other = SendId::generate();
        campaign.status = CampaignStatus::CanaryProcessing;
        campaign.canary_send_ids = Some(BTreeSet::from([canary]));

        assert!(campaign.accepts_send(&canary));
        assert!(!campaign.accepts_send(&other));

        campaign.status = CampaignStatus::Sending;
        assert!(campaign.accepts_send(&other));

        campaign.status = CampaignStatus::Paused;
        assert!(!campaign.accepts_send(&canary));
    }

    #[test]
    fn derived_rates() {
        let mut campaign = campaign();
        campaign.total_recipients = 300;
        campaign.sent_count = 200;
        campaign.delivered_count = 150;
        campaign.opened_count = 50;
        campaign.clicked_count = 10;
        campaign.bounced_count = 3;

        assert!((campaign.percent_complete() - 66.7).abs() < f64::EPSILON);
        assert!((campaign.open_rate() - 33.33).abs() < f64::EPSILON);
        assert!((campaign.click_rate() - 6.67).abs() < f64::EPSILON);
        assert!((campaign.bounce_rate() - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn preparation_flags() {
        let mut campaign = campaign();
        campaign.total_recipients = 2_000;
        campaign.sends_created_count = 1_000;
        campaign.preparation_progress = 50;
        assert!(campaign.preparing_sends());
        assert!(!campaign.preparation_complete());

        campaign.sends_created_count = 2_000;
        campaign.preparation_progress = 100;
        assert!(!campaign.preparing_sends());
        assert!(campaign.preparation_complete());
    }

    #[test]
    fn status_parses_from_display() {
        for status in CampaignStatus::ALL {
            assert_eq!(status.to_string().parse::<CampaignStatus>(), Ok(status));
        }
        assert!("unknown".parse::<CampaignStatus>().is_err());
    }
}
