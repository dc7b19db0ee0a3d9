//! Per-account two-tier send gate
//!
//! Every account is limited by the provider in two ways:
//!
//! - a per-second send rate (`max_send_rate`), tracked here as a counter keyed
//!   by (account, current second) that expires when the second rolls over
//! - a rolling 24-hour quota (`sent_last_24_hours` vs `max_24_hour_send`),
//!   tracked on the account record and only bumped after a provider success
//!
//! The per-second counters are the only mutable state shared between
//! campaigns, so checking and bumping them happens under one lock per account.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ember_common::tracing;
use ember_store::{Account, AccountId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Configuration for rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Per-second rate used when an account has none configured
    ///
    /// Default: 14 (the provider's entry-level limit)
    #[serde(default = "default_send_rate")]
    pub default_send_rate: u32,

    /// Fraction of the per-second rate used as the per-account concurrency
    /// limit for in-flight sends
    ///
    /// Default: 0.7
    #[serde(default = "default_concurrency_headroom")]
    pub concurrency_headroom: f64,

    /// Waits longer than this mean the daily quota is exhausted and the
    /// campaign is paused instead of retried
    ///
    /// Default: 3600 seconds (1 hour)
    #[serde(default = "default_long_wait_secs")]
    pub long_wait_threshold_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_send_rate: default_send_rate(),
            concurrency_headroom: default_concurrency_headroom(),
            long_wait_threshold_secs: default_long_wait_secs(),
        }
    }
}

const fn default_send_rate() -> u32 {
    14
}

const fn default_concurrency_headroom() -> f64 {
    0.7
}

const fn default_long_wait_secs() -> u64 {
    3600
}

impl RateLimitConfig {
    #[must_use]
    pub const fn long_wait_threshold(&self) -> Duration {
        Duration::from_secs(self.long_wait_threshold_secs)
    }
}

/// Result of asking for a send slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// A slot was taken; the per-second counter has been bumped
    Allowed,
    /// The current second is full
    RateLimited { wait: Duration },
    /// The daily quota is used up
    QuotaExhausted { wait: Duration },
}

/// Counter for one account within one wall-clock second
#[derive(Debug, Default)]
struct SecondWindow {
    second: i64,
    count: u32,
}

impl SecondWindow {
    /// Count for `second`, discarding a stale window
    const fn current(&mut self, second: i64) -> u32 {
        if self.second != second {
            self.second = second;
            self.count = 0;
        }
        self.count
    }
}

/// Per-account rate limiter
#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<AccountId, Arc<Mutex<SecondWindow>>>,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn window(&self, account: &AccountId) -> Arc<Mutex<SecondWindow>> {
        self.windows.entry(*account).or_default().clone()
    }

    /// The account's per-second rate, or the configured default
    #[must_use]
    pub fn max_send_rate(&self, account: &Account) -> u32 {
        account
            .max_send_rate
            .unwrap_or(self.config.default_send_rate)
    }

    /// Sends counted against the account in the current second
    #[must_use]
    pub fn current_rate(&self, account: &AccountId, now: DateTime<Utc>) -> u32 {
        self.window(account).lock().current(now.timestamp())
    }

    #[must_use]
    pub fn within_per_second_limit(&self, account: &Account, now: DateTime<Utc>) -> bool {
        self.current_rate(&account.id, now) < self.max_send_rate(account)
    }

    #[must_use]
    pub const fn within_daily_limit(account: &Account) -> bool {
        account.sent_last_24_hours < account.max_24_hour_send
    }

    /// Both tiers have room
    #[must_use]
    pub fn can_send(&self, account: &Account, now: DateTime<Utc>) -> bool {
        self.within_per_second_limit(account, now) && Self::within_daily_limit(account)
    }

    /// Bump the per-second counter
    pub fn increment(&self, account: &AccountId, now: DateTime<Utc>) {
        let window = self.window(account);
        let mut window = window.lock();
        let second = now.timestamp();
        window.count = window.current(second) + 1;
    }

    /// How long until the account may send again
    ///
    /// Zero when sendable now; the time to the next second boundary when only
    /// the per-second tier is full; the time until the quota resets when the
    /// daily tier is exhausted (24 hours if no reset time is known).
    #[must_use]
    pub fn wait_time(&self, account: &Account, now: DateTime<Utc>) -> Duration {
        if !Self::within_daily_limit(account) {
            return time_until_quota_reset(account, now);
        }

        if !self.within_per_second_limit(account, now) {
            return time_until_next_second(now);
        }

        Duration::ZERO
    }

    /// Check both tiers and take a per-second slot in one step
    pub fn try_acquire(&self, account: &Account, now: DateTime<Utc>) -> RateDecision {
        if !Self::within_daily_limit(account) {
            return RateDecision::QuotaExhausted {
                wait: time_until_quota_reset(account, now),
            };
        }

        let max = self.max_send_rate(account);
        let window = self.window(&account.id);
        let mut window = window.lock();
        let current = window.current(now.timestamp());

        if current >= max {
            drop(window);
            let wait = time_until_next_second(now);
            tracing::debug!(
                account_id = %account.id,
                current,
                max,
                ?wait,
                "Per-second send rate reached, must wait"
            );
            return RateDecision::RateLimited { wait };
        }

        window.count = current + 1;
        RateDecision::Allowed
    }

    /// Whether a wait is long enough that the campaign should be paused
    #[must_use]
    pub fn is_long_wait(&self, wait: Duration) -> bool {
        wait > self.config.long_wait_threshold()
    }

    /// Per-account limit on concurrent in-flight sends: the configured
    /// headroom of the per-second rate, at least one
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "rates are small positive integers"
    )]
    pub fn concurrency_limit(&self, account: &Account) -> usize {
        let limit = f64::from(self.max_send_rate(account)) * self.config.concurrency_headroom;
        (limit as usize).max(1)
    }

    /// Daily quota used, one decimal
    #[must_use]
    pub fn quota_usage_percent(account: &Account) -> f64 {
        account.quota_percent_used()
    }

    /// At least 80 % of the daily quota is used
    #[must_use]
    pub fn quota_nearly_exceeded(account: &Account) -> bool {
        Self::quota_usage_percent(account) >= 80.0
    }

    #[must_use]
    pub const fn remaining_sends(account: &Account) -> u64 {
        account.remaining_sends()
    }

    /// Slots left in the current second
    #[must_use]
    pub fn remaining_capacity(&self, account: &Account, now: DateTime<Utc>) -> u32 {
        self.max_send_rate(account)
            .saturating_sub(self.current_rate(&account.id, now))
    }

    /// Forget the per-second counter for an account
    pub fn reset_per_second(&self, account: &AccountId) {
        self.windows.remove(account);
    }
}

fn time_until_next_second(now: DateTime<Utc>) -> Duration {
    let elapsed = Duration::from_nanos(u64::from(now.timestamp_subsec_nanos()));
    Duration::from_secs(1).saturating_sub(elapsed)
}

fn time_until_quota_reset(account: &Account, now: DateTime<Utc>) -> Duration {
    account.quota_reset_at.map_or(Duration::from_secs(24 * 60 * 60), |reset| {
        (reset - now).to_std().unwrap_or(Duration::ZERO)
    })
}
