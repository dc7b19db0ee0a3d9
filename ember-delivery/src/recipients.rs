//! Recipient sources for the materializer
//!
//! Recipients are paged by subscriber id (keyset pagination) so a source can
//! be walked without holding the whole audience in memory.

use std::collections::HashMap;

use async_trait::async_trait;
use ember_store::{Audience, Recipient, SubscriberId};
use parking_lot::RwLock;

use crate::error::Result;

#[async_trait]
pub trait RecipientSource: Send + Sync + std::fmt::Debug {
    /// Number of active recipients in the audience
    ///
    /// # Errors
    ///
    /// When the source cannot be read.
    async fn count(&self, audience: &Audience) -> Result<u64>;

    /// Up to `limit` recipients with a subscriber id greater than `after`, in
    /// subscriber id order
    ///
    /// # Errors
    ///
    /// When the source cannot be read.
    async fn page(
        &self,
        audience: &Audience,
        after: Option<SubscriberId>,
        limit: usize,
    ) -> Result<Vec<Recipient>>;
}

/// In-memory audiences
#[derive(Debug, Default)]
pub struct StaticRecipientSource {
    audiences: RwLock<HashMap<Audience, Vec<Recipient>>>,
}

impl StaticRecipientSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace an audience's recipients. Duplicate subscribers are dropped.
    pub fn insert(&self, audience: Audience, mut recipients: Vec<Recipient>) {
        recipients.sort_by_key(|recipient| recipient.subscriber_id);
        recipients.dedup_by_key(|recipient| recipient.subscriber_id);
        self.audiences.write().insert(audience, recipients);
    }

    #[must_use]
    pub fn with_audience(self, audience: Audience, recipients: Vec<Recipient>) -> Self {
        self.insert(audience, recipients);
        self
    }
}

#[async_trait]
impl RecipientSource for StaticRecipientSource {
    async fn count(&self, audience: &Audience) -> Result<u64> {
        Ok(self
            .audiences
            .read()
            .get(audience)
            .map_or(0, |recipients| recipients.len() as u64))
    }

    async fn page(
        &self,
        audience: &Audience,
        after: Option<SubscriberId>,
        limit: usize,
    ) -> Result<Vec<Recipient>> {
        let audiences = self.audiences.read();
        let Some(recipients) = audiences.get(audience) else {
            return Ok(Vec::new());
        };

        let start = after.map_or(0, |after| {
            recipients.partition_point(|recipient| recipient.subscriber_id <= after)
        });

        Ok(recipients.iter().skip(start).take(limit).cloned().collect())
    }
}
