//! Campaign lifecycle notifications

use ember_common::tracing;
use ember_store::Campaign;

/// Hooks fired on the transitions account owners care about
pub trait Notifier: Send + Sync + std::fmt::Debug {
    fn sending_started(&self, campaign: &Campaign);

    fn sending_completed(&self, campaign: &Campaign);

    /// Suspensions and automatic pauses other than quota exhaustion
    fn sending_failed(&self, campaign: &Campaign, reason: &str);

    fn quota_exceeded(&self, campaign: &Campaign);
}

/// Writes notifications to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn sending_started(&self, campaign: &Campaign) {
        tracing::info!(
            campaign_id = %campaign.id,
            account_id = %campaign.account_id,
            total_recipients = campaign.total_recipients,
            "Campaign started sending"
        );
    }

    fn sending_completed(&self, campaign: &Campaign) {
        tracing::info!(
            campaign_id = %campaign.id,
            account_id = %campaign.account_id,
            sent = campaign.sent_count,
            "Campaign finished sending"
        );
    }

    fn sending_failed(&self, campaign: &Campaign, reason: &str) {
        tracing::warn!(
            campaign_id = %campaign.id,
            account_id = %campaign.account_id,
            status = %campaign.status,
            reason,
            "Campaign stopped sending"
        );
    }

    fn quota_exceeded(&self, campaign: &Campaign) {
        tracing::warn!(
            campaign_id = %campaign.id,
            account_id = %campaign.account_id,
            "Daily sending quota exceeded, campaign paused"
        );
    }
}
