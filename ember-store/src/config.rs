use std::sync::Arc;

use serde::Deserialize;

use crate::{backends::MemoryStore, r#trait::CampaignStore};

/// Configuration for the campaign store
///
/// This enum allows runtime selection of the store implementation through
/// configuration files.
///
/// # Examples
///
/// Memory-backed store (unlimited capacity):
/// ```ron
/// Ember (
///     store: (type: "Memory"),
/// )
/// ```
///
/// Memory-backed store with a cap on the number of sends:
/// ```ron
/// Ember (
///     store: (
///         type: "Memory",
///         capacity: 1000000,
///     ),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StoreConfig {
    /// Memory-based store
    ///
    /// Can optionally specify a capacity limit to prevent unbounded memory growth
    Memory(MemoryConfig),
}

/// Configuration for the memory-backed store
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemoryConfig {
    /// Maximum number of sends to store (omit for unlimited)
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory(MemoryConfig::default())
    }
}

impl StoreConfig {
    /// Convert the configuration into a concrete store
    ///
    /// This consumes the config and returns an Arc'd trait object that can
    /// be shared by the delivery engine and the control handler.
    #[must_use]
    pub fn into_store(self) -> Arc<dyn CampaignStore> {
        match self {
            Self::Memory(config) => config.capacity.map_or_else(
                || Arc::new(MemoryStore::new()) as Arc<dyn CampaignStore>,
                |capacity| Arc::new(MemoryStore::with_capacity(capacity)),
            ),
        }
    }
}
