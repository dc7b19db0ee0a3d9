//! Error types for the ember-store crate.

use thiserror::Error;

use crate::{
    model::CampaignStatus,
    types::{AccountId, CampaignId, SendId},
};

/// Top-level store error type.
///
/// Guard rejections (a transition that is not allowed from the current
/// status) are not errors: they are reported through `Option`/`bool` returns
/// on the [`CampaignStore`](crate::CampaignStore) operations. These variants
/// cover lookups that fail, data integrity violations and backend faults.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Campaign not found in the store.
    #[error("Campaign not found: {0}")]
    CampaignNotFound(CampaignId),

    /// Send not found in the store.
    #[error("Send not found: {0}")]
    SendNotFound(SendId),

    /// Account not found in the store.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Campaign already exists.
    #[error("Campaign already exists: {0}")]
    CampaignExists(CampaignId),

    /// Only drafts can be inserted; every later status is reached by transitions.
    #[error("Campaign {id} must be inserted as a draft, not {status}")]
    NotDraft { id: CampaignId, status: CampaignStatus },

    /// A transition that is not an edge of the campaign state machine.
    #[error("Invalid campaign transition: {from} -> {to}")]
    InvalidTransition {
        from: CampaignStatus,
        to: CampaignStatus,
    },

    /// The canary sample was already recorded for this campaign.
    #[error("Canary sample already recorded for campaign {0}")]
    CanaryAlreadySet(CampaignId),

    /// A canary id that is not a send of the campaign.
    #[error("Send {send} does not belong to campaign {campaign}")]
    ForeignSend { campaign: CampaignId, send: SendId },

    /// The backend is full.
    #[error("Store capacity exceeded: {current}/{capacity} sends")]
    CapacityExceeded { current: usize, capacity: usize },

    /// Internal error (lock poisoning, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {e}"))
    }
}
