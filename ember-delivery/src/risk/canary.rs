//! Canary sampling and analysis

use std::collections::BTreeSet;

use ember_store::{SendId, SendStats, model::percentage};
use rand::{Rng, seq::SliceRandom};

use super::Thresholds;

/// Outcome of analysing a canary sample
#[derive(Debug, Clone, PartialEq)]
pub enum CanaryVerdict {
    /// Rates are within limits; release the rest of the list
    Approve,
    /// A limit was crossed; the campaign must be suspended
    Suspend { reason: String },
    /// Nothing to analyse
    Empty,
    /// Sample sends are still waiting to go out; look again later
    NotReady,
}

/// Pick `size` sends uniformly at random (all of them if there are fewer)
pub fn select_canary<R: Rng + ?Sized>(
    mut pending: Vec<SendId>,
    size: usize,
    rng: &mut R,
) -> BTreeSet<SendId> {
    pending.shuffle(rng);
    pending.truncate(size);
    pending.into_iter().collect()
}

/// Judge a canary sample against the limits.
///
/// Rates are permanent bounces and complaints over the sample size, rounded
/// to two decimals. Bounces are checked first and a rate equal to a limit
/// passes. A sample the provider accepted none of is never approved.
#[must_use]
pub fn analyze_canary(stats: &SendStats, limits: Thresholds) -> CanaryVerdict {
    if stats.total == 0 {
        return CanaryVerdict::Empty;
    }

    if stats.sent == 0 {
        if stats.outstanding() > 0 {
            return CanaryVerdict::NotReady;
        }
        return CanaryVerdict::Suspend {
            reason: "No canary sends were accepted by the provider".to_string(),
        };
    }

    let bounce_rate = percentage(stats.permanent_bounces, stats.total, 2);
    let complaint_rate = percentage(stats.complaints, stats.total, 2);

    if bounce_rate > limits.bounce_rate {
        CanaryVerdict::Suspend {
            reason: format!(
                "High bounce rate in canary batch: {bounce_rate}% (threshold: {}%)",
                limits.bounce_rate
            ),
        }
    } else if complaint_rate > limits.complaint_rate {
        CanaryVerdict::Suspend {
            reason: format!(
                "High complaint rate in canary batch: {complaint_rate}% (threshold: {}%)",
                limits.complaint_rate
            ),
        }
    } else {
        CanaryVerdict::Approve
    }
}
