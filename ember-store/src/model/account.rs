use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::percentage;
use crate::types::AccountId;

/// Billing tier of an account.
///
/// The tier decides whether the sandbox (review + canary) workflow is
/// mandatory and which kill-switch thresholds apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    #[default]
    Free,
    Starter,
    Pro,
    Agency,
}

impl Plan {
    #[must_use]
    pub const fn requires_sandbox_workflow(self) -> bool {
        matches!(self, Self::Free)
    }
}

/// The quota view of a tenant account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    #[serde(default = "AccountId::generate")]
    pub id: AccountId,
    pub name: String,
    #[serde(default)]
    pub plan: Plan,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub paused_at: Option<DateTime<Utc>>,
    /// Provider per-second send rate; unset means the provider default
    #[serde(default)]
    pub max_send_rate: Option<u32>,
    pub max_24_hour_send: u64,
    #[serde(default)]
    pub sent_last_24_hours: u64,
    #[serde(default)]
    pub quota_reset_at: Option<DateTime<Utc>>,
}

const fn default_active() -> bool {
    true
}

impl Account {
    #[must_use]
    pub fn new(name: impl Into<String>, plan: Plan, max_24_hour_send: u64) -> Self {
        Self {
            id: AccountId::generate(),
            name: name.into(),
            plan,
            active: true,
            paused_at: None,
            max_send_rate: None,
            max_24_hour_send,
            sent_last_24_hours: 0,
            quota_reset_at: None,
        }
    }

    #[must_use]
    pub const fn with_send_rate(mut self, rate: u32) -> Self {
        self.max_send_rate = Some(rate);
        self
    }

    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    #[must_use]
    pub const fn requires_sandbox_workflow(&self) -> bool {
        self.plan.requires_sandbox_workflow()
    }

    #[must_use]
    pub const fn quota_exceeded(&self) -> bool {
        self.sent_last_24_hours >= self.max_24_hour_send
    }

    #[must_use]
    pub const fn can_send_email(&self) -> bool {
        self.active && !self.is_paused() && !self.quota_exceeded()
    }

    /// Daily quota used, one decimal
    #[must_use]
    pub fn quota_percent_used(&self) -> f64 {
        percentage(self.sent_last_24_hours, self.max_24_hour_send, 1)
    }

    #[must_use]
    pub const fn remaining_sends(&self) -> u64 {
        self.max_24_hour_send.saturating_sub(self.sent_last_24_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_helpers() {
        let mut account = Account::new("acme", Plan::Pro, 200);
        assert!(account.can_send_email());
        assert_eq!(account.remaining_sends(), 200);

        account.sent_last_24_hours = 170;
        assert!((account.quota_percent_used() - 85.0).abs() < f64::EPSILON);
        assert!(account.can_send_email());

        account.sent_last_24_hours = 200;
        assert!(account.quota_exceeded());
        assert!(!account.can_send_email());
        assert_eq!(account.remaining_sends(), 0);
    }

    #[test]
    fn paused_or_inactive_accounts_cannot_send() {
        let mut account = Account::new("acme", Plan::Starter, 1_000);
        account.paused_at = Some(Utc::now());
        assert!(!account.can_send_email());

        account.paused_at = None;
        account.active = false;
        assert!(!account.can_send_email());
    }

    #[test]
    fn only_free_plan_uses_sandbox() {
        assert!(Plan::Free.requires_sandbox_workflow());
        assert!(!Plan::Starter.requires_sandbox_workflow());
        assert!(!Plan::Pro.requires_sandbox_workflow());
        assert!(!Plan::Agency.requires_sandbox_workflow());
    }
}
