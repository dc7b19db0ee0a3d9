//! Emergency stop for campaigns that are already sending

use ember_store::{SendStats, model::percentage};

use super::Thresholds;

/// Returns a suspension reason when cumulative rates cross `limits`.
///
/// Only sends with an observed outcome (delivered, bounced or complained)
/// count, and nothing is decided below `min_sample` of them.
#[must_use]
pub fn evaluate_kill_switch(
    stats: &SendStats,
    limits: Thresholds,
    min_sample: u64,
) -> Option<String> {
    if stats.observed < min_sample || stats.observed == 0 {
        return None;
    }

    let bounce_rate = percentage(stats.permanent_bounces, stats.observed, 2);
    let complaint_rate = percentage(stats.complaints, stats.observed, 2);

    if bounce_rate > limits.bounce_rate {
        Some(format!(
            "Emergency stop: {bounce_rate}% bounce rate (threshold: {}%)",
            limits.bounce_rate
        ))
    } else if complaint_rate > limits.complaint_rate {
        Some(format!(
            "Emergency stop: {complaint_rate}% complaint rate (threshold: {}%)",
            limits.complaint_rate
        ))
    } else {
        None
    }
}
