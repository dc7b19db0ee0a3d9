//! Scriptable provider for tests
//!
//! Every message is accepted unless a failure has been queued for its
//! recipient address; queued failures are used up one per attempt.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use ember_delivery::{OutboundMessage, Transport, TransportError};
use ember_store::SendId;
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct MockTransport {
    failures: Mutex<HashMap<String, VecDeque<TransportError>>>,
    reject_all: Mutex<Option<TransportError>>,
    accepted: Mutex<Vec<OutboundMessage>>,
    attempts: Mutex<usize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next attempt for `address` with `error`
    pub fn fail_next(&self, address: &str, error: TransportError) {
        self.failures
            .lock()
            .entry(address.to_string())
            .or_default()
            .push_back(error);
    }

    /// Fail every attempt with `error`
    pub fn fail_all(&self, error: TransportError) {
        *self.reject_all.lock() = Some(error);
    }

    /// Forget all scripted failures
    pub fn clear(&self) {
        self.failures.lock().clear();
        *self.reject_all.lock() = None;
    }

    pub fn accepted(&self) -> Vec<OutboundMessage> {
        self.accepted.lock().clone()
    }

    pub fn accepted_ids(&self) -> Vec<SendId> {
        self.accepted.lock().iter().map(|m| m.send_id).collect()
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

/// The bare address of a `"Name <address>"` mailbox
fn address(mailbox: &str) -> &str {
    mailbox
        .rsplit_once('<')
        .and_then(|(_, rest)| rest.strip_suffix('>'))
        .unwrap_or(mailbox)
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<String, TransportError> {
        *self.attempts.lock() += 1;

        if let Some(error) = self.reject_all.lock().clone() {
            return Err(error);
        }

        let scripted = self
            .failures
            .lock()
            .get_mut(address(&message.to))
            .and_then(VecDeque::pop_front);
        if let Some(error) = scripted {
            return Err(error);
        }

        self.accepted.lock().push(message.clone());
        Ok(format!("provider-{}", message.send_id))
    }
}
