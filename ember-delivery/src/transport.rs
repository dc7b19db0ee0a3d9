//! Outbound provider interface

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use ember_common::tracing;
use ember_store::{CampaignId, SendId};

use crate::error::TransportError;

/// A fully built message ready for the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub campaign_id: CampaignId,
    pub send_id: SendId,
    /// `"Name <address>"`
    pub from: String,
    pub to: String,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Format a display name and address as a mailbox.
///
/// An empty name yields the bare address.
#[must_use]
pub fn mailbox(name: Option<&str>, address: &str) -> String {
    match name.map(str::trim) {
        Some(name) if !name.is_empty() => format!("{name} <{address}>"),
        _ => address.to_string(),
    }
}

/// The provider that actually sends mail
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Submit one message, returning the provider's message id
    ///
    /// # Errors
    ///
    /// A classified [`TransportError`] when the provider did not accept it.
    async fn send(&self, message: &OutboundMessage) -> Result<String, TransportError>;
}

/// Transport that accepts everything and only logs it
#[derive(Debug, Default)]
pub struct LoggingTransport {
    sent: AtomicU64,
}

impl LoggingTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages accepted so far
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for LoggingTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<String, TransportError> {
        let sequence = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        let message_id = format!("{}.{sequence}@ember.local", message.send_id);

        tracing::info!(
            campaign_id = %message.campaign_id,
            send_id = %message.send_id,
            to = %message.to,
            %message_id,
            "Accepted message"
        );

        Ok(message_id)
    }
}
