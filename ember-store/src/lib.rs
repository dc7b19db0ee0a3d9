pub mod backends;
pub mod config;
pub mod error;
pub mod model;
pub mod r#trait;
pub mod types;

pub use backends::MemoryStore;
pub use config::{MemoryConfig, StoreConfig};
pub use error::{Result, StoreError};
pub use model::{
    Account, Audience, BounceType, Campaign, CampaignCounter, CampaignPatch, CampaignSend,
    CampaignStatus, PauseReason, Plan, Recipient, SendEvent, SendStats, SendStatus,
};
pub use r#trait::CampaignStore;
pub use types::{AccountId, CampaignId, ListId, SegmentId, SendId, SubscriberId, TemplateId};
