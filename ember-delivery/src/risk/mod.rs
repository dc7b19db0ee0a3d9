//! Sender-reputation safeguards
//!
//! Two checks protect an account's reputation with the provider:
//!
//! - the canary phase sends a small random sample first and only releases the
//!   rest of the list if that sample's bounce and complaint rates are healthy
//! - the kill-switch keeps watching cumulative rates during the full send and
//!   suspends the campaign once plan-specific limits are crossed
//!
//! Both are pure functions over [`SendStats`](ember_store::SendStats); the
//! processor owns when they run and what happens to the campaign.

pub mod canary;
pub mod kill_switch;

use std::time::Duration;

use ember_store::Plan;
use serde::{Deserialize, Serialize};

pub use canary::{CanaryVerdict, analyze_canary, select_canary};
pub use kill_switch::evaluate_kill_switch;

/// Bounce and complaint limits, in percent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub bounce_rate: f64,
    pub complaint_rate: f64,
}

/// Configuration for canary testing and the kill-switch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Campaigns with more recipients than this go through a canary phase
    ///
    /// Default: 500
    #[serde(default = "defaults::canary_threshold")]
    pub canary_threshold: u64,

    /// Number of sends in the canary sample
    ///
    /// Default: 100
    #[serde(default = "defaults::canary_size")]
    pub canary_size: usize,

    /// Time (in seconds) between sending the canary and analysing it
    ///
    /// Default: 1800 seconds (30 minutes)
    #[serde(default = "defaults::cooldown_secs")]
    pub canary_window_secs: u64,

    /// Time (in seconds) a campaign sits in review before preparation starts
    ///
    /// Default: 1800 seconds (30 minutes)
    #[serde(default = "defaults::cooldown_secs")]
    pub review_cooldown_secs: u64,

    /// Canary limits; a rate strictly above a limit fails the canary
    ///
    /// Default: 5 % bounces, 1 % complaints
    #[serde(default = "defaults::canary")]
    pub canary: Thresholds,

    /// Minimum observed sends before the kill-switch evaluates
    ///
    /// Default: 50
    #[serde(default = "defaults::kill_switch_min_sample")]
    pub kill_switch_min_sample: u64,

    /// Kill-switch limits for plans that use the sandbox workflow
    ///
    /// Default: 8 % bounces, 0.5 % complaints
    #[serde(default = "defaults::restrictive")]
    pub restrictive: Thresholds,

    /// Kill-switch limits for every other plan
    ///
    /// Default: 15 % bounces, 1 % complaints
    #[serde(default = "defaults::standard")]
    pub standard: Thresholds,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            canary_threshold: defaults::canary_threshold(),
            canary_size: defaults::canary_size(),
            canary_window_secs: defaults::cooldown_secs(),
            review_cooldown_secs: defaults::cooldown_secs(),
            canary: defaults::canary(),
            kill_switch_min_sample: defaults::kill_switch_min_sample(),
            restrictive: defaults::restrictive(),
            standard: defaults::standard(),
        }
    }
}

impl RiskConfig {
    #[must_use]
    pub const fn canary_window(&self) -> Duration {
        Duration::from_secs(self.canary_window_secs)
    }

    #[must_use]
    pub const fn review_cooldown(&self) -> Duration {
        Duration::from_secs(self.review_cooldown_secs)
    }

    /// Kill-switch limits for a plan
    #[must_use]
    pub const fn kill_switch_thresholds(&self, plan: Plan) -> Thresholds {
        if plan.requires_sandbox_workflow() {
            self.restrictive
        } else {
            self.standard
        }
    }

    /// Whether a campaign of this size needs a canary phase
    #[must_use]
    pub const fn needs_canary(&self, total_recipients: u64) -> bool {
        total_recipients > self.canary_threshold
    }
}

mod defaults {
    use super::Thresholds;

    pub const fn canary_threshold() -> u64 {
        500
    }

    pub const fn canary_size() -> usize {
        100
    }

    pub const fn cooldown_secs() -> u64 {
        30 * 60
    }

    pub const fn kill_switch_min_sample() -> u64 {
        50
    }

    pub const fn canary() -> Thresholds {
        Thresholds {
            bounce_rate: 5.0,
            complaint_rate: 1.0,
        }
    }

    pub const fn restrictive() -> Thresholds {
        Thresholds {
            bounce_rate: 8.0,
            complaint_rate: 0.5,
        }
    }

    pub const fn standard() -> Thresholds {
        Thresholds {
            bounce_rate: 15.0,
            complaint_rate: 1.0,
        }
    }
}
