//! Provider telemetry and engagement callbacks
//!
//! Each callback is idempotent: replaying the same event for a send never
//! moves a campaign counter twice. Opens and clicks still bump the send's
//! own totals on every call.

use ember_common::tracing;
use ember_store::{BounceType, SendEvent, SendId};

use super::CampaignProcessor;
use crate::error::Result;

impl CampaignProcessor {
    async fn record_event(&self, send_id: &SendId, event: SendEvent) -> Result<bool> {
        let runtime = self.runtime()?;
        let kind = event_kind(&event);
        let counted = runtime
            .store
            .record_event(send_id, event, runtime.clock.now())
            .await?;

        tracing::debug!(%send_id, event = kind, counted, "Recorded send event");
        Ok(counted)
    }

    /// # Errors
    ///
    /// If the send is unknown or the store fails
    pub async fn delivered(&self, send_id: &SendId) -> Result<bool> {
        self.record_event(send_id, SendEvent::Delivered).await
    }

    /// # Errors
    ///
    /// If the send is unknown or the store fails
    pub async fn bounced(
        &self,
        send_id: &SendId,
        bounce_type: BounceType,
        reason: Option<String>,
    ) -> Result<bool> {
        self.record_event(
            send_id,
            SendEvent::Bounced {
                bounce_type,
                reason,
            },
        )
        .await
    }

    /// # Errors
    ///
    /// If the send is unknown or the store fails
    pub async fn complained(&self, send_id: &SendId) -> Result<bool> {
        self.record_event(send_id, SendEvent::Complained).await
    }

    /// # Errors
    ///
    /// If the send is unknown or the store fails
    pub async fn opened(&self, send_id: &SendId) -> Result<bool> {
        self.record_event(send_id, SendEvent::Opened).await
    }

    /// # Errors
    ///
    /// If the send is unknown or the store fails
    pub async fn clicked(&self, send_id: &SendId) -> Result<bool> {
        self.record_event(send_id, SendEvent::Clicked).await
    }

    /// # Errors
    ///
    /// If the send is unknown or the store fails
    pub async fn unsubscribed(&self, send_id: &SendId) -> Result<bool> {
        self.record_event(send_id, SendEvent::Unsubscribed).await
    }

    /// Look a send up by the id the provider gave its message
    ///
    /// # Errors
    ///
    /// If the store fails
    pub async fn send_for_message(&self, message_id: &str) -> Result<Option<SendId>> {
        Ok(self
            .runtime()?
            .store
            .find_send_by_message_id(message_id)
            .await?)
    }
}

const fn event_kind(event: &SendEvent) -> &'static str {
    match event {
        SendEvent::Delivered => "delivered",
        SendEvent::Bounced { .. } => "bounced",
        SendEvent::Complained => "complained",
        SendEvent::Opened => "opened",
        SendEvent::Clicked => "clicked",
        SendEvent::Unsubscribed => "unsubscribed",
    }
}
