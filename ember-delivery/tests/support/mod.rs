//! Shared fixtures for the campaign engine integration tests
#![allow(dead_code, clippy::unwrap_used)] // Test utility module - not all helpers used in every test

pub mod mock_transport;

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use ember_common::{Clock, ManualClock};
use ember_delivery::{
    CampaignProcessor, Collaborators, Notifier, PlainRenderer, RecipientSource, Renderer,
    StaticRecipientSource,
};
use ember_store::{
    Account, Audience, Campaign, CampaignId, CampaignStore, ListId, MemoryStore, Plan, Recipient,
    SendId,
};
use parking_lot::Mutex;

pub use self::mock_transport::MockTransport;

/// Upper bound on scheduler steps in [`Harness::drain`]
const MAX_STEPS: usize = 10_000;

#[must_use]
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

/// Notification calls in the order they were made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Started(CampaignId),
    Completed(CampaignId),
    Failed(CampaignId, String),
    QuotaExceeded(CampaignId),
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn sending_started(&self, campaign: &Campaign) {
        self.notices.lock().push(Notice::Started(campaign.id));
    }

    fn sending_completed(&self, campaign: &Campaign) {
        self.notices.lock().push(Notice::Completed(campaign.id));
    }

    fn sending_failed(&self, campaign: &Campaign, reason: &str) {
        self.notices
            .lock()
            .push(Notice::Failed(campaign.id, reason.to_string()));
    }

    fn quota_exceeded(&self, campaign: &Campaign) {
        self.notices.lock().push(Notice::QuotaExceeded(campaign.id));
    }
}

/// A processor wired to in-memory collaborators and a manual clock
pub struct Harness {
    pub processor: Arc<CampaignProcessor>,
    pub store: Arc<MemoryStore>,
    pub clock: ManualClock,
    pub transport: Arc<MockTransport>,
    pub notifier: Arc<RecordingNotifier>,
    pub recipients: Arc<StaticRecipientSource>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_processor(CampaignProcessor::default())
    }

    pub fn with_processor(processor: CampaignProcessor) -> Self {
        Self::build(processor, Arc::new(PlainRenderer))
    }

    pub fn with_renderer(renderer: Arc<dyn Renderer>) -> Self {
        Self::build(CampaignProcessor::default(), renderer)
    }

    fn build(mut processor: CampaignProcessor, renderer: Arc<dyn Renderer>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(epoch());
        let transport = Arc::new(MockTransport::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let recipients = Arc::new(StaticRecipientSource::new());

        let collaborators = Collaborators::new(
            store.clone(),
            transport.clone(),
            recipients.clone() as Arc<dyn RecipientSource>,
        )
        .with_clock(Arc::new(clock.clone()))
        .with_renderer(renderer)
        .with_notifier(notifier.clone());

        processor.init(collaborators).unwrap();

        Self {
            processor: Arc::new(processor),
            store,
            clock,
            transport,
            notifier,
            recipients,
        }
    }

    /// Store an account with a per-second rate and daily quota
    pub async fn account(&self, plan: Plan, max_24_hour_send: u64, rate: u32) -> Account {
        let account = Account::new("acme", plan, max_24_hour_send).with_send_rate(rate);
        self.store.put_account(account.clone()).await.unwrap();
        account
    }

    /// Store a draft campaign for `account` whose list has `recipients`
    /// subscribers
    pub async fn campaign(&self, account: &Account, recipients: usize) -> Campaign {
        let list_id = ListId::generate();
        let audience = Audience {
            list_id,
            segment_id: None,
        };
        self.recipients.insert(
            audience,
            (0..recipients)
                .map(|i| Recipient::new(format!("subscriber{i}@example.test")))
                .collect(),
        );

        let campaign = Campaign::new(account.id, list_id, "Spring launch", "Our spring range")
            .with_sender("Acme News", "news@acme.test");
        self.store.insert_campaign(campaign.clone()).await.unwrap();
        campaign
    }

    pub async fn reload(&self, id: &CampaignId) -> Campaign {
        self.store.campaign(id).await.unwrap()
    }

    /// Run everything due now
    pub async fn run(&self) -> usize {
        self.processor.run_pending().await.unwrap()
    }

    /// Move the clock and run everything that became due
    pub async fn advance(&self, by: chrono::Duration) -> usize {
        self.clock.advance(by);
        self.run().await
    }

    /// Jump the clock from one due job to the next, running each, until
    /// nothing is queued at or before `limit`
    pub async fn drain_until(&self, limit: DateTime<Utc>) {
        for _ in 0..MAX_STEPS {
            self.run().await;

            match self.processor.scheduler().unwrap().next_due() {
                Some(next) if next <= limit => {
                    if next > self.clock.now() {
                        self.clock.set(next);
                    }
                }
                _ => return,
            }
        }

        panic!("scheduler did not settle within {MAX_STEPS} steps");
    }

    /// Run the scheduler until it is empty
    pub async fn drain(&self) {
        self.drain_until(DateTime::<Utc>::MAX_UTC).await;
    }

    /// Sends of a campaign that are still pending
    pub async fn pending(&self, id: &CampaignId) -> Vec<SendId> {
        self.store.pending_send_ids(id).await.unwrap()
    }
}
