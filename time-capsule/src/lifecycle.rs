//! Capsule lifecycle state machine.
//!
//! ```text
//! COLLECTING ──(guard holds, scheduler)──▶ DELIVERED
//!      │
//!      └──────────(cancel)───────────────▶ CANCELLED
//! ```
//!
//! The delivery guard is evaluated here; the transition itself is an atomic
//! compare-and-set in the store, performed by the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::clock::Clock;
use crate::locks::CapsuleLocks;
use crate::store::{require_collecting, CapsuleStore};
use crate::types::{Capsule, CapsuleId, CapsuleStatus, NewCapsule, Progress};
use crate::{CapsuleError, Result};

/// Why a capsule became deliverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryTrigger {
    /// The target date arrived
    TargetDate,
    /// Enough letters were collected and early delivery is on
    GoalReached,
}

/// Result of evaluating the delivery guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryDecision {
    Hold,
    Ready(DeliveryTrigger),
}

impl DeliveryDecision {
    pub fn is_ready(&self) -> bool {
        matches!(self, DeliveryDecision::Ready(_))
    }
}

/// Evaluate the delivery guard for a capsule.
///
/// Closed capsules always hold. The target date is compared as a UTC
/// calendar date.
pub fn evaluate(capsule: &Capsule, progress: Progress, now: DateTime<Utc>) -> DeliveryDecision {
    if !capsule.status.is_open() {
        return DeliveryDecision::Hold;
    }
    if now.date_naive() >= capsule.target_date {
        return DeliveryDecision::Ready(DeliveryTrigger::TargetDate);
    }
    if capsule.deliver_on_goal_reached && progress.is_goal_reached() {
        return DeliveryDecision::Ready(DeliveryTrigger::GoalReached);
    }
    DeliveryDecision::Hold
}

/// Creates, reads and cancels capsules.
pub struct CapsuleLifecycle {
    store: Arc<dyn CapsuleStore>,
    locks: Arc<CapsuleLocks>,
    clock: Arc<dyn Clock>,
}

impl CapsuleLifecycle {
    pub fn new(store: Arc<dyn CapsuleStore>, locks: Arc<CapsuleLocks>, clock: Arc<dyn Clock>) -> Self {
        Self { store, locks, clock }
    }

    /// Create a capsule in `COLLECTING`.
    pub async fn create_capsule(&self, request: NewCapsule) -> Result<Capsule> {
        if request.recipients.is_empty() {
            return Err(CapsuleError::InvalidCapsule(
                "a capsule needs at least one recipient".to_string(),
            ));
        }
        if request.target_letter_count == 0 {
            return Err(CapsuleError::InvalidCapsule(
                "target letter count must be at least 1".to_string(),
            ));
        }
        if let Some(r) = request
            .recipients
            .iter()
            .find(|r| r.name.trim().is_empty() || r.facility.trim().is_empty())
        {
            return Err(CapsuleError::InvalidCapsule(format!(
                "recipient {:?} needs both a name and a facility",
                r.name
            )));
        }

        let capsule = Capsule {
            id: CapsuleId::generate(),
            title: request.title,
            status: CapsuleStatus::Collecting,
            recipients: request.recipients,
            target_letter_count: request.target_letter_count,
            target_date: request.target_date,
            deliver_on_goal_reached: request.deliver_on_goal_reached,
            created_by: request.created_by,
            created_at: self.clock.now(),
            version: 0,
            closed_at: None,
        };
        self.store.insert_capsule(&capsule).await?;

        info!(
            capsule_id = %capsule.id,
            recipients = capsule.recipients.len(),
            target_letters = capsule.target_letter_count,
            target_date = %capsule.target_date,
            early = capsule.deliver_on_goal_reached,
            "Capsule created"
        );
        Ok(capsule)
    }

    pub async fn capsule(&self, capsule_id: &CapsuleId) -> Result<Capsule> {
        self.store
            .capsule(capsule_id)
            .await?
            .ok_or_else(|| CapsuleError::CapsuleNotFound(capsule_id.clone()))
    }

    /// Cancel a collecting capsule.
    ///
    /// Racing a delivery, exactly one wins; the loser sees
    /// [`CapsuleError::CapsuleClosed`].
    pub async fn cancel(&self, capsule_id: &CapsuleId) -> Result<Capsule> {
        require_collecting(self.store.as_ref(), capsule_id).await?;

        let cancelled = {
            let _guard = self.locks.lock(capsule_id).await;
            let current = require_collecting(self.store.as_ref(), capsule_id).await?;

            match self
                .store
                .cancel(capsule_id, current.version, self.clock.now())
                .await
            {
                Ok(capsule) => capsule,
                // Another process moved it first; report what it became.
                Err(CapsuleError::ConcurrentModification(_)) => {
                    let latest = self.capsule(capsule_id).await?;
                    return Err(CapsuleError::closed(capsule_id, latest.status));
                }
                Err(e) => return Err(e),
            }
        };

        info!(capsule_id = %capsule_id, "Capsule cancelled");
        Ok(cancelled)
    }
}
