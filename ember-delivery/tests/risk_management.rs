//! Review, canary and kill-switch behaviour

#![allow(clippy::unwrap_used)]

mod support;

use std::collections::BTreeSet;

use chrono::Duration as Span;
use ember_common::Clock;
use ember_delivery::SendOutcome;
use ember_store::{BounceType, CampaignId, CampaignStatus, CampaignStore, Plan, SendId};
use pretty_assertions::assert_eq;
use support::{Harness, Notice};

/// Start a free-plan campaign and move it past the review cooldown
async fn reviewed(h: &Harness, recipients: usize) -> CampaignId {
    let account = h.account(Plan::Free, 100_000, 1_000).await;
    let campaign = h.campaign(&account, recipients).await;

    assert!(h.processor.start(&campaign.id).await.unwrap());
    h.clock.advance(Span::minutes(30));
    assert_eq!(h.processor.process_review_queue().await.unwrap(), 1);
    h.run().await;

    campaign.id
}

async fn canary_ids(h: &Harness, id: &CampaignId) -> Vec<SendId> {
    h.reload(id)
        .await
        .canary_send_ids
        .unwrap()
        .into_iter()
        .collect()
}

async fn bounce(h: &Harness, sends: &[SendId]) {
    for send in sends {
        h.processor
            .bounced(send, BounceType::Permanent, Some("mailbox unknown".to_string()))
            .await
            .unwrap();
    }
}

async fn deliver(h: &Harness, sends: &[SendId]) {
    for send in sends {
        h.processor.delivered(send).await.unwrap();
    }
}

#[tokio::test]
async fn test_review_cooldown_holds_campaign() {
    let h = Harness::new();
    let account = h.account(Plan::Free, 10_000, 100).await;
    let campaign = h.campaign(&account, 50).await;

    assert!(h.processor.start(&campaign.id).await.unwrap());

    let queued = h.reload(&campaign.id).await;
    assert_eq!(queued.status, CampaignStatus::QueuedForReview);
    assert_eq!(queued.queued_at, Some(h.clock.now()));
    assert_eq!(queued.total_recipients, 0);

    h.clock.advance(Span::minutes(29));
    assert_eq!(h.processor.process_review_queue().await.unwrap(), 0);
    assert!(h.pending(&campaign.id).await.is_empty());

    h.clock.advance(Span::minutes(1));
    assert_eq!(h.processor.process_review_queue().await.unwrap(), 1);
    h.drain().await;

    // at or under the canary threshold the whole list goes out directly
    let sent = h.reload(&campaign.id).await;
    assert_eq!(sent.status, CampaignStatus::Sent);
    assert_eq!(sent.sent_count, 50);
    assert_eq!(sent.canary_send_ids, None);
    assert_eq!(
        h.notifier.notices(),
        vec![Notice::Started(campaign.id), Notice::Completed(campaign.id)]
    );
}

#[tokio::test]
async fn test_large_free_campaign_passes_canary() {
    let h = Harness::new();
    let id = reviewed(&h, 10_000).await;

    let canary = h.reload(&id).await;
    assert_eq!(canary.status, CampaignStatus::CanaryProcessing);
    assert_eq!(canary.total_recipients, 10_000);
    assert_eq!(canary.sends_created_count, 10_000);
    assert!(canary.preparation_complete());
    assert_eq!(canary.canary_started_at, Some(h.clock.now()));

    let sample = canary_ids(&h, &id).await;
    assert_eq!(sample.len(), 100);
    assert_eq!(canary.sent_count, 100);

    let sent: BTreeSet<_> = h.transport.accepted_ids().into_iter().collect();
    assert_eq!(sent, sample.iter().copied().collect());

    // exactly at the bounce threshold is still a pass
    bounce(&h, &sample[..5]).await;
    deliver(&h, &sample[5..]).await;

    h.clock.advance(Span::minutes(29));
    assert_eq!(h.processor.process_canaries().await.unwrap(), 0);

    h.clock.advance(Span::minutes(1));
    assert_eq!(h.processor.process_canaries().await.unwrap(), 1);
    h.run().await;

    let sending = h.reload(&id).await;
    assert_eq!(sending.status, CampaignStatus::Sending);
    assert_eq!(sending.sent_count, 200);
    assert_eq!(h.transport.attempts(), 200);
    assert_eq!(h.notifier.notices(), vec![Notice::Started(id)]);

    // the sample is never delivered twice
    let accepted = h.transport.accepted_ids();
    let unique: BTreeSet<_> = accepted.iter().collect();
    assert_eq!(unique.len(), accepted.len());
}

#[tokio::test]
async fn test_canary_bounces_suspend_campaign() {
    let h = Harness::new();
    let id = reviewed(&h, 600).await;

    let sample = canary_ids(&h, &id).await;
    assert_eq!(sample.len(), 100);
    bounce(&h, &sample[..6]).await;

    h.clock.advance(Span::minutes(30));
    h.processor.process_canaries().await.unwrap();

    let reason = "High bounce rate in canary batch: 6% (threshold: 5%)";
    let suspended = h.reload(&id).await;
    assert_eq!(suspended.status, CampaignStatus::Suspended);
    assert_eq!(suspended.suspension_reason.as_deref(), Some(reason));
    assert_eq!(
        h.notifier.notices().last(),
        Some(&Notice::Failed(id, reason.to_string()))
    );

    // the rest of the list never leaves
    h.drain().await;
    assert_eq!(h.transport.attempts(), 100);
    assert_eq!(h.pending(&id).await.len(), 500);
    assert!(!h.processor.resume(&id).await.unwrap());
}

#[tokio::test]
async fn test_canary_complaints_suspend_campaign() {
    let h = Harness::new();
    let id = reviewed(&h, 750).await;

    let sample = canary_ids(&h, &id).await;
    for send in &sample[..2] {
        h.processor.complained(send).await.unwrap();
    }

    h.clock.advance(Span::minutes(30));
    h.processor.process_canaries().await.unwrap();

    let suspended = h.reload(&id).await;
    assert_eq!(suspended.status, CampaignStatus::Suspended);
    assert_eq!(
        suspended.suspension_reason.as_deref(),
        Some("High complaint rate in canary batch: 2% (threshold: 1%)")
    );
}

#[tokio::test]
async fn test_canary_excluded_from_full_send() {
    let h = Harness::new();
    let id = reviewed(&h, 501).await;

    let sample: BTreeSet<_> = canary_ids(&h, &id).await.into_iter().collect();
    h.clock.advance(Span::minutes(30));
    h.processor.process_canaries().await.unwrap();
    h.drain().await;

    let done = h.reload(&id).await;
    assert_eq!(done.status, CampaignStatus::Sent);
    assert_eq!(done.sent_count, 501);
    assert_eq!(h.transport.attempts(), 501);

    let stats = h
        .store
        .send_stats(&id, Some(&sample))
        .await
        .unwrap();
    assert_eq!(stats.sent, 100);
}

#[tokio::test]
async fn test_canary_held_by_paused_account_is_sent_before_approval() {
    let h = Harness::new();
    let mut account = h.account(Plan::Free, 100_000, 1_000).await;
    let campaign = h.campaign(&account, 600).await;
    let id = campaign.id;

    assert!(h.processor.start(&id).await.unwrap());
    h.clock.advance(Span::minutes(30));

    account.paused_at = Some(h.clock.now());
    h.store.put_account(account.clone()).await.unwrap();
    assert_eq!(h.processor.process_review_queue().await.unwrap(), 1);
    h.run().await;

    let held = h.reload(&id).await;
    assert_eq!(held.status, CampaignStatus::CanaryProcessing);
    assert_eq!(held.sent_count, 0);
    assert_eq!(h.transport.attempts(), 0);

    account.paused_at = None;
    h.store.put_account(account).await.unwrap();

    // nothing went out, so the sample is queued again instead of approved
    h.clock.advance(Span::minutes(30));
    assert_eq!(h.processor.process_canaries().await.unwrap(), 0);
    assert_eq!(h.reload(&id).await.status, CampaignStatus::CanaryProcessing);

    h.run().await;
    assert_eq!(h.reload(&id).await.sent_count, 100);

    assert_eq!(h.processor.process_canaries().await.unwrap(), 1);
    h.drain_until(h.clock.now() + Span::hours(3)).await;

    let done = h.reload(&id).await;
    assert_eq!(done.status, CampaignStatus::Sent);
    assert_eq!(done.sent_count, 600);
    assert!(h.pending(&id).await.is_empty());

    let accepted = h.transport.accepted_ids();
    let unique: BTreeSet<_> = accepted.iter().collect();
    assert_eq!(accepted.len(), 600);
    assert_eq!(unique.len(), 600);
}

#[tokio::test]
async fn test_full_send_picks_up_unsent_canary_sends() {
    let h = Harness::new();
    let mut account = h.account(Plan::Free, 100_000, 1_000).await;
    let campaign = h.campaign(&account, 600).await;
    let id = campaign.id;

    h.processor.start(&id).await.unwrap();
    h.clock.advance(Span::minutes(30));
    account.paused_at = Some(h.clock.now());
    h.store.put_account(account.clone()).await.unwrap();
    h.processor.process_review_queue().await.unwrap();
    h.run().await;

    account.paused_at = None;
    h.store.put_account(account).await.unwrap();

    // one sample send goes out by hand; the other 99 have no job left
    let sample = canary_ids(&h, &id).await;
    assert_eq!(
        h.processor.process_send(&sample[0]).await.unwrap(),
        SendOutcome::Sent
    );

    h.clock.advance(Span::minutes(30));
    assert_eq!(h.processor.process_canaries().await.unwrap(), 1);
    assert_eq!(h.reload(&id).await.status, CampaignStatus::Sending);
    h.drain().await;

    let done = h.reload(&id).await;
    assert_eq!(done.status, CampaignStatus::Sent);
    assert_eq!(done.sent_count, 600);

    let canary: BTreeSet<_> = sample.into_iter().collect();
    let stats = h.store.send_stats(&id, Some(&canary)).await.unwrap();
    assert_eq!(stats.sent, 100);
}

#[tokio::test]
async fn test_kill_switch_stops_bouncing_campaign() {
    let h = Harness::new();
    let account = h.account(Plan::Pro, 10_000, 10).await;
    let campaign = h.campaign(&account, 100).await;

    h.processor.start(&campaign.id).await.unwrap();
    let start = h.clock.now();
    h.drain_until(start + Span::seconds(4)).await;

    let sent = h.transport.accepted_ids();
    assert_eq!(sent.len(), 50);

    bounce(&h, &sent[..8]).await;
    deliver(&h, &sent[8..]).await;

    assert_eq!(h.processor.process_kill_switch().await.unwrap(), 1);

    let reason = "Emergency stop: 16% bounce rate (threshold: 15%)";
    let suspended = h.reload(&campaign.id).await;
    assert_eq!(suspended.status, CampaignStatus::Suspended);
    assert_eq!(suspended.suspension_reason.as_deref(), Some(reason));
    assert_eq!(
        h.notifier.notices().last(),
        Some(&Notice::Failed(campaign.id, reason.to_string()))
    );

    // deferred sends find the campaign stopped
    h.drain().await;
    assert_eq!(h.transport.attempts(), 50);
    assert_eq!(h.pending(&campaign.id).await.len(), 50);
}

#[tokio::test]
async fn test_kill_switch_waits_for_sample() {
    let h = Harness::new();
    let account = h.account(Plan::Pro, 10_000, 10).await;
    let campaign = h.campaign(&account, 100).await;

    h.processor.start(&campaign.id).await.unwrap();
    let start = h.clock.now();
    h.drain_until(start + Span::seconds(4)).await;

    // half the observed sends bounced, but 49 is below the minimum sample
    let sent = h.transport.accepted_ids();
    bounce(&h, &sent[..25]).await;
    deliver(&h, &sent[25..49]).await;

    assert_eq!(h.processor.process_kill_switch().await.unwrap(), 0);
    assert_eq!(h.reload(&campaign.id).await.status, CampaignStatus::Sending);

    deliver(&h, &sent[49..]).await;
    assert_eq!(h.processor.process_kill_switch().await.unwrap(), 1);
}
