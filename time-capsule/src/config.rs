//! Configuration for the capsule engine.

use serde::{Deserialize, Serialize};

use crate::types::SkuId;

/// Configuration for a capsule engine instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Delivery scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Invite code configuration
    #[serde(default)]
    pub invites: InviteConfig,
    /// Delivery outbox configuration
    #[serde(default)]
    pub outbox: OutboxConfig,
    /// Gift catalogue and prices
    #[serde(default)]
    pub gifts: GiftCatalogConfig,
}

impl EngineConfig {
    /// Load config from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

/// Delivery scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between background ticks
    pub interval_secs: u64,
    /// Maximum capsules evaluated concurrently in one tick
    pub max_concurrent: usize,
    /// Evaluate a capsule right after each letter submission
    pub eager_on_submit: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_concurrent: 8,
            eager_on_submit: true,
        }
    }
}

/// Invite code configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InviteConfig {
    /// Characters per generated code
    pub code_length: usize,
    /// Expiry applied when the caller gives none (hours)
    pub default_expiry_hours: Option<u64>,
    /// Attempts before giving up on a collision-free code
    pub max_generation_attempts: usize,
}

impl Default for InviteConfig {
    fn default() -> Self {
        Self {
            code_length: 8,
            default_expiry_hours: None,
            max_generation_attempts: 5,
        }
    }
}

/// Delivery outbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// How long a claimed entry is reserved before another replayer may take it
    pub lease_secs: u64,
    /// Entries replayed per tick
    pub batch_size: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            lease_secs: 30,
            batch_size: 100,
        }
    }
}

/// A purchasable gift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GiftSku {
    pub id: SkuId,
    pub name: String,
    /// Unit price in minor currency units
    pub unit_price_cents: u64,
}

impl GiftSku {
    pub fn new(id: impl Into<SkuId>, name: impl Into<String>, unit_price_cents: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            unit_price_cents,
        }
    }
}

/// Gift catalogue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GiftCatalogConfig {
    /// ISO currency code for all prices
    pub currency: String,
    /// Available gifts
    pub skus: Vec<GiftSku>,
}

impl Default for GiftCatalogConfig {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            skus: vec![
                GiftSku::new("photo-print", "Photo print (4x6)", 99),
                GiftSku::new("greeting-card", "Greeting card", 349),
                GiftSku::new("stamp-book", "Book of stamps", 1460),
                GiftSku::new("paperback", "Paperback book", 1299),
            ],
        }
    }
}
