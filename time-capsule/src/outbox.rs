//! Delivery outbox.
//!
//! The snapshot of a delivered capsule is written in the same atomic step as
//! the `COLLECTING -> DELIVERED` transition. Emission to the notifier happens
//! afterwards and is replayed from here until it succeeds; the delivery guard
//! is never re-evaluated for an entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::OutboxConfig;
use crate::events::{CapsuleEvent, DeliveredCapsule, EventSink};
use crate::gifts::GiftTotal;
use crate::store::CapsuleStore;
use crate::types::{CapsuleId, GiftSelection, Letter, Recipient};
use crate::Result;

/// Frozen contents of a capsule at the moment it was delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverySnapshot {
    pub capsule_id: CapsuleId,
    pub title: String,
    pub recipients: Vec<Recipient>,
    pub letters: Vec<Letter>,
    pub gifts: Vec<GiftSelection>,
    /// Priced at the transition; replays never consult the current price list
    pub gift_total: GiftTotal,
    pub delivered_at: DateTime<Utc>,
}

/// Dispatch state of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OutboxState {
    /// Waiting for a replayer
    Pending,
    /// Reserved by a dispatcher until the lease runs out
    Claimed { lease_until: DateTime<Utc> },
    /// Accepted by the notifier
    Dispatched { at: DateTime<Utc> },
}

/// A recorded delivery awaiting emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: String,
    pub snapshot: DeliverySnapshot,
    pub created_at: DateTime<Utc>,
    /// Emission attempts that failed
    pub attempts: u32,
    pub state: OutboxState,
    pub last_error: Option<String>,
}

impl OutboxEntry {
    /// New entry, already claimed by the writer that committed the delivery.
    pub fn claimed(snapshot: DeliverySnapshot, now: DateTime<Utc>, lease: chrono::Duration) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            snapshot,
            created_at: now,
            attempts: 0,
            state: OutboxState::Claimed {
                lease_until: now + lease,
            },
            last_error: None,
        }
    }

    /// Whether a replayer may take this entry at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            OutboxState::Pending => true,
            OutboxState::Claimed { lease_until } => now >= lease_until,
            OutboxState::Dispatched { .. } => false,
        }
    }

    pub fn is_dispatched(&self) -> bool {
        matches!(self.state, OutboxState::Dispatched { .. })
    }
}

/// Counts from one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub dispatched: usize,
    pub failed: usize,
}

/// Moves outbox entries to the notifier.
pub struct OutboxRelay {
    config: OutboxConfig,
    store: Arc<dyn CapsuleStore>,
    sink: Arc<dyn EventSink>,
}

impl OutboxRelay {
    pub fn new(
        config: OutboxConfig,
        store: Arc<dyn CapsuleStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self { config, store, sink }
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.lease_secs as i64)
    }

    /// Build the delivery event from a frozen snapshot.
    pub fn event_for(snapshot: &DeliverySnapshot) -> CapsuleEvent {
        CapsuleEvent::CapsuleDelivered(DeliveredCapsule {
            capsule_id: snapshot.capsule_id.clone(),
            title: snapshot.title.clone(),
            recipients: snapshot.recipients.clone(),
            letters: snapshot.letters.clone(),
            gift_total: snapshot.gift_total.clone(),
            delivered_at: snapshot.delivered_at,
        })
    }

    /// Emit a claimed entry. Returns whether the notifier accepted it.
    ///
    /// A notifier failure releases the entry for a later replay and is not
    /// an error of this call; storage failures are.
    pub async fn dispatch(&self, entry: &OutboxEntry, now: DateTime<Utc>) -> Result<bool> {
        let event = Self::event_for(&entry.snapshot);

        match self.sink.publish(&event).await {
            Ok(()) => {
                self.store.complete_outbox(&entry.id, now).await?;
                info!(
                    entry_id = %entry.id,
                    capsule_id = %entry.snapshot.capsule_id,
                    sink = self.sink.name(),
                    "Delivery event dispatched"
                );
                Ok(true)
            }
            Err(e) => {
                warn!(
                    entry_id = %entry.id,
                    capsule_id = %entry.snapshot.capsule_id,
                    attempts = entry.attempts + 1,
                    error = %e,
                    "Delivery event emission failed; left in outbox"
                );
                self.store.release_outbox(&entry.id, &e.to_string()).await?;
                Ok(false)
            }
        }
    }

    /// Claim and emit every claimable entry.
    pub async fn replay(&self, now: DateTime<Utc>) -> Result<ReplayReport> {
        let claimed = self
            .store
            .claim_outbox(now, now + self.lease(), self.config.batch_size)
            .await?;

        let mut report = ReplayReport::default();
        if claimed.is_empty() {
            return Ok(report);
        }
        debug!(count = claimed.len(), "Replaying outbox entries");

        for entry in &claimed {
            if self.dispatch(entry, now).await? {
                report.dispatched += 1;
            } else {
                report.failed += 1;
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> DeliverySnapshot {
        DeliverySnapshot {
            capsule_id: CapsuleId::new("c1"),
            title: "Homecoming".to_string(),
            recipients: vec![Recipient::new("Sam", "FCI Dublin")],
            letters: vec![],
            gifts: vec![],
            gift_total: GiftTotal {
                currency: "USD".to_string(),
                line_items: vec![],
                total_price_cents: 0,
            },
            delivered_at: Utc::now(),
        }
    }

    #[test]
    fn test_claimed_entry_lease() {
        let now = Utc::now();
        let entry = OutboxEntry::claimed(snapshot(), now, chrono::Duration::seconds(30));
        assert!(!entry.is_claimable(now));
        assert!(entry.is_claimable(now + chrono::Duration::seconds(30)));
        assert!(!entry.is_dispatched());
    }

    #[test]
    fn test_dispatched_never_claimable() {
        let now = Utc::now();
        let mut entry = OutboxEntry::claimed(snapshot(), now, chrono::Duration::seconds(1));
        entry.state = OutboxState::Dispatched { at: now };
        assert!(!entry.is_claimable(now + chrono::Duration::days(1)));
    }
}
