//! Backend implementations of [`CampaignStore`](crate::CampaignStore)
//!
//! - `memory`: a single-lock in-memory store for development and tests

pub mod memory;

pub use memory::MemoryStore;
