//! Typed error handling for campaign delivery.
//!
//! [`TransportError`] classifies what the provider said about one message and
//! drives the per-send failure policy. [`DeliveryError`] is what engine
//! operations return when something other than a guard rejection goes wrong.

use ember_store::StoreError;
use thiserror::Error;

/// Top-level delivery error type.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The provider refused or failed a send.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The campaign store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Body rendering failed.
    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    /// System-level error (not initialised, bad configuration, etc.).
    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// A classified provider failure for a single message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The provider rejected the message outright. Never retried.
    #[error("Message rejected: {0}")]
    MessageRejected(String),

    /// Sender identity or domain is not verified, or similar account-level
    /// misconfiguration.
    #[error("Sender configuration error: {0}")]
    Configuration(String),

    /// The provider has suspended sending for the whole account.
    #[error("Account sending paused: {0}")]
    AccountSendingPaused(String),

    /// The provider throttled the request.
    #[error("Throttled: {0}")]
    Throttled(String),

    /// Anything else; treated as transient.
    #[error("Transient error: {0}")]
    Transient(String),
}

impl TransportError {
    /// Short, stable name of the error class for structured logs
    #[must_use]
    pub const fn class(&self) -> &'static str {
        match self {
            Self::MessageRejected(_) => "message_rejected",
            Self::Configuration(_) => "configuration_error",
            Self::AccountSendingPaused(_) => "account_sending_paused",
            Self::Throttled(_) => "throttled",
            Self::Transient(_) => "transient",
        }
    }

    /// Returns `true` if retrying this send can never succeed.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::MessageRejected(_))
    }
}

/// The templating collaborator could not build a body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct RenderError(pub String);

/// System-level errors that indicate internal problems.
#[derive(Debug, Error)]
pub enum SystemError {
    /// Processor used before `init()`.
    #[error("Campaign processor not initialized: {0}")]
    NotInitialized(String),

    /// The recipient source failed.
    #[error("Recipient source error: {0}")]
    RecipientSource(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Other internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Specialized `Result` type for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            TransportError::MessageRejected(String::new()).class(),
            "message_rejected"
        );
        assert_eq!(TransportError::Throttled(String::new()).class(), "throttled");
        assert!(TransportError::MessageRejected(String::new()).is_permanent());
        assert!(!TransportError::Transient(String::new()).is_permanent());
    }

    #[test]
    fn test_store_error_conversion() {
        let err: DeliveryError = StoreError::Internal("boom".to_string()).into();
        assert!(matches!(err, DeliveryError::Store(_)));
        assert!(err.to_string().contains("boom"));
    }
}
