//! Provider failures, retries and automatic pauses

#![allow(clippy::unwrap_used)]

mod support;

use std::sync::Arc;

use chrono::Duration as Span;
use ember_common::Clock;
use ember_delivery::{
    CampaignService, Job, RenderError, RenderedBody, Renderer, SendOutcome, TransportError,
};
use ember_store::{
    Campaign, CampaignStatus, CampaignStore, PauseReason, Plan, Recipient, SendStatus,
};
use pretty_assertions::assert_eq;
use support::{Harness, Notice};

fn transient() -> TransportError {
    TransportError::Transient("connection reset".to_string())
}

#[tokio::test]
async fn test_transient_failure_is_retried_on_schedule() {
    let h = Harness::new();
    let account = h.account(Plan::Pro, 1_000, 50).await;
    let campaign = h.campaign(&account, 1).await;
    h.processor.start(&campaign.id).await.unwrap();

    let send_id = h.pending(&campaign.id).await[0];
    let start = h.clock.now();
    h.transport.fail_next("subscriber0@example.test", transient());

    assert_eq!(
        h.processor.process_send(&send_id).await.unwrap(),
        SendOutcome::RetryScheduled
    );

    let failed = h.store.send(&send_id).await.unwrap();
    assert_eq!(failed.status, SendStatus::Failed);
    assert_eq!(failed.retry_count, 1);
    assert_eq!(failed.next_retry_at, Some(start + Span::minutes(5)));
    assert_eq!(
        h.processor
            .scheduler()
            .unwrap()
            .scheduled_at(&Job::Retry(send_id)),
        Some(start + Span::minutes(5))
    );

    // too early: nothing changes
    h.clock.advance(Span::minutes(4));
    assert!(!h.processor.retry_send(&send_id).await.unwrap());
    assert_eq!(h.store.send(&send_id).await.unwrap().status, SendStatus::Failed);

    h.clock.advance(Span::minutes(1));
    assert!(h.processor.retry_send(&send_id).await.unwrap());
    assert_eq!(h.store.send(&send_id).await.unwrap().status, SendStatus::Pending);

    assert_eq!(
        h.processor.process_send(&send_id).await.unwrap(),
        SendOutcome::Sent
    );
    let sent = h.store.send(&send_id).await.unwrap();
    assert_eq!(sent.status, SendStatus::Sent);
    assert_eq!(sent.retry_count, 1);
    assert_eq!(h.reload(&campaign.id).await.sent_count, 1);
}

#[tokio::test]
async fn test_backoff_grows_until_retries_run_out() {
    let h = Harness::new();
    let account = h.account(Plan::Pro, 1_000, 50).await;
    let campaign = h.campaign(&account, 1).await;
    h.processor.start(&campaign.id).await.unwrap();

    let send_id = h.pending(&campaign.id).await[0];
    h.transport.fail_all(transient());

    let mut delays = Vec::new();
    for _ in 0..4 {
        let before = h.clock.now();
        assert_eq!(
            h.processor.process_send(&send_id).await.unwrap(),
            SendOutcome::RetryScheduled
        );

        let at = h.store.send(&send_id).await.unwrap().next_retry_at.unwrap();
        delays.push((at - before).num_minutes());

        h.clock.set(at);
        assert!(h.processor.retry_send(&send_id).await.unwrap());
    }
    assert_eq!(delays, vec![5, 15, 30, 60]);

    assert_eq!(
        h.processor.process_send(&send_id).await.unwrap(),
        SendOutcome::Failed
    );
    let exhausted = h.store.send(&send_id).await.unwrap();
    assert_eq!(exhausted.retry_count, 5);

    h.clock.advance(Span::hours(3));
    assert!(!h.processor.retry_send(&send_id).await.unwrap());
    assert_eq!(h.transport.attempts(), 5);
}

#[tokio::test]
async fn test_throttled_send_waits_fixed_delay() {
    let h = Harness::new();
    let account = h.account(Plan::Pro, 1_000, 50).await;
    let campaign = h.campaign(&account, 1).await;
    h.processor.start(&campaign.id).await.unwrap();

    let send_id = h.pending(&campaign.id).await[0];
    let start = h.clock.now();
    h.transport.fail_next(
        "subscriber0@example.test",
        TransportError::Throttled("maximum sending rate exceeded".to_string()),
    );

    assert_eq!(
        h.processor.process_send(&send_id).await.unwrap(),
        SendOutcome::RetryScheduled
    );
    assert_eq!(
        h.store.send(&send_id).await.unwrap().next_retry_at,
        Some(start + Span::minutes(5))
    );
}

#[tokio::test]
async fn test_retry_abandoned_once_campaign_completes() {
    let h = Harness::new();
    let account = h.account(Plan::Pro, 1_000, 50).await;
    let campaign = h.campaign(&account, 3).await;
    h.transport.fail_next("subscriber1@example.test", transient());

    h.processor.start(&campaign.id).await.unwrap();
    h.drain().await;

    // a failed send is not outstanding, so the campaign finished without it
    let done = h.reload(&campaign.id).await;
    assert_eq!(done.status, CampaignStatus::Sent);
    assert_eq!(done.sent_count, 2);
    assert_eq!(h.transport.attempts(), 3);

    let stats = h.store.send_stats(&campaign.id, None).await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.outstanding(), 0);
}

#[tokio::test]
async fn test_rejected_message_fails_without_retry() {
    let h = Harness::new();
    let account = h.account(Plan::Pro, 1_000, 50).await;
    let campaign = h.campaign(&account, 4).await;
    h.transport.fail_next(
        "subscriber2@example.test",
        TransportError::MessageRejected("email address is not verified".to_string()),
    );

    h.processor.start(&campaign.id).await.unwrap();
    h.drain().await;

    let done = h.reload(&campaign.id).await;
    assert_eq!(done.status, CampaignStatus::Sent);
    assert_eq!(done.sent_count, 3);

    let report = h.processor.report(&campaign.id).await.unwrap();
    assert!(report.has_failures());
    assert_eq!(report.failed_count, 1);
    assert!((report.failure_rate - 25.0).abs() < f64::EPSILON);

    // rejected sends are never picked up again
    assert!(h.pending(&campaign.id).await.is_empty());
}

#[tokio::test]
async fn test_exhausted_quota_pauses_and_keeps_sends() {
    let h = Harness::new();
    let account = h.account(Plan::Pro, 1, 50).await;
    let campaign = h.campaign(&account, 3).await;

    h.processor.start(&campaign.id).await.unwrap();
    h.run().await;

    let paused = h.reload(&campaign.id).await;
    assert_eq!(paused.status, CampaignStatus::Paused);
    assert_eq!(paused.pause_reason, Some(PauseReason::QuotaExceeded));
    assert_eq!(paused.sent_count, 1);
    assert_eq!(
        h.notifier.notices(),
        vec![
            Notice::Started(campaign.id),
            Notice::QuotaExceeded(campaign.id)
        ]
    );

    let stats = h.store.send_stats(&campaign.id, None).await.unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.failed, 0);
    assert_eq!(h.store.account(&account.id).await.unwrap().sent_last_24_hours, 1);
}

#[tokio::test]
async fn test_short_quota_wait_defers_send() {
    let h = Harness::new();
    let mut account = h.account(Plan::Pro, 1, 50).await;
    account.quota_reset_at = Some(h.clock.now() + Span::minutes(10));
    h.store.put_account(account.clone()).await.unwrap();
    let campaign = h.campaign(&account, 2).await;

    h.processor.start(&campaign.id).await.unwrap();
    h.run().await;

    assert_eq!(h.reload(&campaign.id).await.status, CampaignStatus::Sending);
    assert_eq!(h.transport.attempts(), 1);

    let waiting = h.pending(&campaign.id).await;
    assert_eq!(waiting.len(), 1);
    assert_eq!(
        h.processor
            .scheduler()
            .unwrap()
            .scheduled_at(&Job::SendEmail {
                send_id: waiting[0],
                campaign_id: campaign.id,
                account_id: account.id,
            }),
        Some(h.clock.now() + Span::minutes(10))
    );

    // the provider's rolling window frees up the quota
    let mut account = h.store.account(&account.id).await.unwrap();
    account.sent_last_24_hours = 0;
    account.quota_reset_at = None;
    h.store.put_account(account).await.unwrap();

    h.drain().await;
    let done = h.reload(&campaign.id).await;
    assert_eq!(done.status, CampaignStatus::Sent);
    assert_eq!(done.sent_count, 2);
}

#[tokio::test]
async fn test_high_failure_rate_pauses_campaign() {
    let h = Harness::new();
    let account = h.account(Plan::Pro, 10_000, 1_000).await;
    let campaign = h.campaign(&account, 150).await;
    h.transport
        .fail_all(TransportError::MessageRejected("blocked".to_string()));

    h.processor.start(&campaign.id).await.unwrap();
    h.drain().await;

    let paused = h.reload(&campaign.id).await;
    assert_eq!(paused.status, CampaignStatus::Paused);
    assert_eq!(paused.pause_reason, Some(PauseReason::TooManyFailures));
    assert_eq!(h.transport.attempts(), 100);
    assert_eq!(h.pending(&campaign.id).await.len(), 50);
    assert_eq!(
        h.notifier.notices().last(),
        Some(&Notice::Failed(
            campaign.id,
            "Too many send failures".to_string()
        ))
    );
}

#[tokio::test]
async fn test_failure_rate_ignored_for_small_lists() {
    let h = Harness::new();
    let account = h.account(Plan::Pro, 10_000, 1_000).await;
    let campaign = h.campaign(&account, 100).await;
    h.transport
        .fail_all(TransportError::MessageRejected("blocked".to_string()));

    h.processor.start(&campaign.id).await.unwrap();
    h.drain().await;

    let done = h.reload(&campaign.id).await;
    assert_eq!(done.status, CampaignStatus::Sent);
    assert_eq!(done.sent_count, 0);

    let report = h.processor.report(&campaign.id).await.unwrap();
    assert!((report.failure_rate - 100.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_configuration_error_pauses_until_resumed() {
    let h = Harness::new();
    let account = h.account(Plan::Pro, 1_000, 50).await;
    let campaign = h.campaign(&account, 3).await;
    h.transport.fail_next(
        "subscriber0@example.test",
        TransportError::Configuration("sender domain not verified".to_string()),
    );

    h.processor.start(&campaign.id).await.unwrap();
    h.run().await;

    let paused = h.reload(&campaign.id).await;
    assert_eq!(paused.status, CampaignStatus::Paused);
    assert_eq!(paused.pause_reason, Some(PauseReason::ConfigurationError));

    let stats = h.store.send_stats(&campaign.id, None).await.unwrap();
    assert_eq!(stats.failed, 1);

    assert!(h.processor.resume_campaign(&campaign.id).await.unwrap());
    h.drain().await;

    let done = h.reload(&campaign.id).await;
    assert_eq!(done.status, CampaignStatus::Sent);
    assert_eq!(done.sent_count, 2);
    assert!(
        !h.notifier
            .notices()
            .iter()
            .any(|notice| matches!(notice, Notice::Failed(..)))
    );
}

#[tokio::test]
async fn test_provider_account_pause_pauses_campaign() {
    let h = Harness::new();
    let account = h.account(Plan::Pro, 1_000, 50).await;
    let campaign = h.campaign(&account, 2).await;
    h.transport.fail_all(TransportError::AccountSendingPaused(
        "sending paused for this account".to_string(),
    ));

    h.processor.start(&campaign.id).await.unwrap();
    h.run().await;

    let paused = h.reload(&campaign.id).await;
    assert_eq!(paused.status, CampaignStatus::Paused);
    assert_eq!(paused.pause_reason, Some(PauseReason::AccountPaused));
    assert_eq!(h.transport.attempts(), 1);
}

#[tokio::test]
async fn test_locally_paused_account_pauses_campaign() {
    let h = Harness::new();
    let mut account = h.account(Plan::Pro, 1_000, 50).await;
    let campaign = h.campaign(&account, 2).await;
    h.processor.start(&campaign.id).await.unwrap();

    account.paused_at = Some(h.clock.now());
    h.store.put_account(account).await.unwrap();
    h.run().await;

    let paused = h.reload(&campaign.id).await;
    assert_eq!(paused.status, CampaignStatus::Paused);
    assert_eq!(paused.pause_reason, Some(PauseReason::AccountPaused));
    assert_eq!(h.transport.attempts(), 0);
    assert_eq!(h.pending(&campaign.id).await.len(), 2);
}

#[derive(Debug)]
struct BrokenTemplate;

impl Renderer for BrokenTemplate {
    fn render(&self, _: &Campaign, _: &Recipient) -> Result<RenderedBody, RenderError> {
        Err(RenderError("template has no body".to_string()))
    }
}

#[tokio::test]
async fn test_render_failure_pauses_campaign() {
    let h = Harness::with_renderer(Arc::new(BrokenTemplate));
    let account = h.account(Plan::Pro, 1_000, 50).await;
    let campaign = h.campaign(&account, 3).await;

    h.processor.start(&campaign.id).await.unwrap();
    h.run().await;

    let paused = h.reload(&campaign.id).await;
    assert_eq!(paused.status, CampaignStatus::Paused);
    assert_eq!(paused.pause_reason, Some(PauseReason::ConfigurationError));
    assert_eq!(h.transport.attempts(), 0);

    let stats = h.store.send_stats(&campaign.id, None).await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 2);
}
