//! Gift aggregator - accumulates gift selections and prices them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{GiftCatalogConfig, GiftSku};
use crate::locks::CapsuleLocks;
use crate::store::{require_collecting, CapsuleStore};
use crate::types::{CapsuleId, GiftSelection, SkuId};
use crate::{CapsuleError, Result};

/// Static lookup table of gift prices.
#[derive(Debug, Clone)]
pub struct PriceList {
    currency: String,
    skus: HashMap<SkuId, GiftSku>,
}

impl PriceList {
    pub fn new(currency: impl Into<String>, skus: impl IntoIterator<Item = GiftSku>) -> Self {
        Self {
            currency: currency.into(),
            skus: skus.into_iter().map(|sku| (sku.id.clone(), sku)).collect(),
        }
    }

    pub fn from_config(config: &GiftCatalogConfig) -> Self {
        Self::new(config.currency.clone(), config.skus.iter().cloned())
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn get(&self, sku_id: &SkuId) -> Option<&GiftSku> {
        self.skus.get(sku_id)
    }

    pub fn contains(&self, sku_id: &SkuId) -> bool {
        self.skus.contains_key(sku_id)
    }

    /// Join selections against the price list.
    ///
    /// Zero-quantity selections are omitted. Selections whose SKU has since
    /// been removed from the list are skipped.
    pub fn price(&self, selections: &[GiftSelection]) -> GiftTotal {
        let mut line_items: Vec<GiftLine> = selections
            .iter()
            .filter(|s| s.quantity > 0)
            .filter_map(|s| match self.skus.get(&s.sku_id) {
                Some(sku) => Some(GiftLine {
                    sku_id: sku.id.clone(),
                    name: sku.name.clone(),
                    quantity: s.quantity,
                    unit_price_cents: sku.unit_price_cents,
                    line_total_cents: sku.unit_price_cents * s.quantity as u64,
                }),
                None => {
                    warn!(sku_id = %s.sku_id, capsule_id = %s.capsule_id, "Selected gift missing from price list");
                    None
                }
            })
            .collect();
        line_items.sort_by(|a, b| a.sku_id.cmp(&b.sku_id));

        let total_price_cents = line_items.iter().map(|l| l.line_total_cents).sum();
        GiftTotal {
            currency: self.currency.clone(),
            line_items,
            total_price_cents,
        }
    }
}

/// One priced line of a gift bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GiftLine {
    pub sku_id: SkuId,
    pub name: String,
    pub quantity: u32,
    pub unit_price_cents: u64,
    pub line_total_cents: u64,
}

/// Priced gift bundle of a capsule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GiftTotal {
    pub currency: String,
    pub line_items: Vec<GiftLine>,
    pub total_price_cents: u64,
}

/// Result of a quantity adjustment at the store.
#[derive(Debug, Clone)]
pub struct GiftAdjustment {
    pub selection: GiftSelection,
    /// Quantity before the adjustment
    pub previous: u32,
    /// A removal asked for more than was present and was clamped to zero
    pub clamped: bool,
}

/// Accumulates gift selections per capsule.
pub struct GiftAggregator {
    store: Arc<dyn CapsuleStore>,
    locks: Arc<CapsuleLocks>,
    prices: Arc<PriceList>,
}

impl GiftAggregator {
    pub fn new(store: Arc<dyn CapsuleStore>, locks: Arc<CapsuleLocks>, prices: Arc<PriceList>) -> Self {
        Self { store, locks, prices }
    }

    /// Add `quantity` of a gift.
    pub async fn add_gift(&self, capsule_id: &CapsuleId, sku_id: &SkuId, quantity: u32) -> Result<GiftSelection> {
        require_collecting(self.store.as_ref(), capsule_id).await?;
        if quantity == 0 {
            return Err(CapsuleError::InvalidQuantity(
                "gift quantity must be greater than zero".to_string(),
            ));
        }
        if !self.prices.contains(sku_id) {
            return Err(CapsuleError::UnknownSku(sku_id.clone()));
        }

        let _guard = self.locks.lock(capsule_id).await;
        let adjustment = self
            .store
            .adjust_gift(capsule_id, sku_id, i64::from(quantity))
            .await?;

        debug!(
            capsule_id = %capsule_id,
            sku_id = %sku_id,
            added = quantity,
            quantity = adjustment.selection.quantity,
            "Gift added"
        );
        Ok(adjustment.selection)
    }

    /// Remove `quantity` of a gift.
    ///
    /// Removing more than is present sets the quantity to zero and then
    /// reports [`CapsuleError::InvalidQuantity`].
    pub async fn remove_gift(&self, capsule_id: &CapsuleId, sku_id: &SkuId, quantity: u32) -> Result<GiftSelection> {
        require_collecting(self.store.as_ref(), capsule_id).await?;
        if quantity == 0 {
            return Err(CapsuleError::InvalidQuantity(
                "removal quantity must be greater than zero".to_string(),
            ));
        }

        let _guard = self.locks.lock(capsule_id).await;
        let adjustment = self
            .store
            .adjust_gift(capsule_id, sku_id, -i64::from(quantity))
            .await?;

        if adjustment.clamped {
            info!(
                capsule_id = %capsule_id,
                sku_id = %sku_id,
                requested = quantity,
                present = adjustment.previous,
                "Gift removal clamped to zero"
            );
            return Err(CapsuleError::InvalidQuantity(format!(
                "asked to remove {} of {} but only {} selected; quantity is now 0",
                quantity, sku_id, adjustment.previous
            )));
        }

        debug!(capsule_id = %capsule_id, sku_id = %sku_id, removed = quantity, "Gift removed");
        Ok(adjustment.selection)
    }

    /// Current selections of a capsule.
    pub async fn selections(&self, capsule_id: &CapsuleId) -> Result<Vec<GiftSelection>> {
        self.store
            .capsule(capsule_id)
            .await?
            .ok_or_else(|| CapsuleError::CapsuleNotFound(capsule_id.clone()))?;
        self.store.gifts(capsule_id).await
    }

    /// Priced total of a capsule's gifts.
    pub async fn total(&self, capsule_id: &CapsuleId) -> Result<GiftTotal> {
        let selections = self.selections(capsule_id).await?;
        Ok(self.prices.price(&selections))
    }

    pub fn prices(&self) -> &PriceList {
        &self.prices
    }
}
