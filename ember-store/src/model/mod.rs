//! Stored entities: campaigns, their per-recipient sends and the owning
//! account's quota view.

mod account;
mod campaign;
mod recipient;
mod send;

pub use account::{Account, Plan};
pub use campaign::{Campaign, CampaignCounter, CampaignPatch, CampaignStatus, PauseReason};
pub use recipient::{Audience, Recipient};
pub use send::{BounceType, CampaignSend, SendEvent, SendStats, SendStatus};

/// `part / whole` as a percentage rounded to `decimals` places, `0.0` when
/// `whole` is zero.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn percentage(part: u64, whole: u64, decimals: i32) -> f64 {
    if whole == 0 {
        return 0.0;
    }

    let scale = 10_f64.powi(decimals);
    ((part as f64 / whole as f64) * 100.0 * scale).round() / scale
}
