//! Storage layer.
//!
//! Every backend makes the "capsule is still collecting" check and the
//! write that depends on it a single atomic unit, enforces uniqueness of
//! (`capsule_id`, `admission_key`) and (`capsule_id`, `contributor_id`)
//! itself, and implements status changes as compare-and-set on the capsule
//! `version`.
//!
//! - [`MemoryStore`]: concurrent maps, for tests and embedding
//! - [`SqliteStore`]: durable, safe to share between processes

mod memory;
mod schema;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use crate::gifts::{GiftAdjustment, PriceList};
use crate::outbox::OutboxEntry;
use crate::types::{
    Admission, Admitted, Capsule, CapsuleId, CapsuleStatus, Contributor, ContributorId,
    GiftSelection, InviteCode, Letter, SkuId,
};
use crate::{CapsuleError, Result};

/// Storage backend for capsules and everything collected into them.
#[async_trait::async_trait]
pub trait CapsuleStore: Send + Sync {
    /// Name of the backend.
    fn name(&self) -> &str;

    /// Insert a new capsule.
    async fn insert_capsule(&self, capsule: &Capsule) -> Result<()>;

    /// Fetch a capsule.
    async fn capsule(&self, id: &CapsuleId) -> Result<Option<Capsule>>;

    /// All capsules currently in `status`, oldest first.
    async fn capsules_with_status(&self, status: CapsuleStatus) -> Result<Vec<Capsule>>;

    /// Compare-and-set `COLLECTING -> CANCELLED`.
    async fn cancel(&self, id: &CapsuleId, expected_version: u64, at: DateTime<Utc>) -> Result<Capsule>;

    /// Compare-and-set `COLLECTING -> DELIVERED`, freezing the capsule
    /// contents and their priced gift total into an outbox entry in the
    /// same atomic write. The entry is
    /// returned claimed by the caller for `lease`.
    async fn commit_delivery(
        &self,
        id: &CapsuleId,
        expected_version: u64,
        at: DateTime<Utc>,
        lease: chrono::Duration,
        prices: &PriceList,
    ) -> Result<OutboxEntry>;

    /// Insert an invite. Returns false if the code is already taken.
    async fn insert_invite(&self, invite: &InviteCode) -> Result<bool>;

    /// Fetch an invite.
    async fn invite(&self, code: &str) -> Result<Option<InviteCode>>;

    /// Admit an identity through an invite code, idempotently per
    /// (`capsule_id`, `admission_key`).
    async fn redeem(&self, code: &str, admission: &Admission, now: DateTime<Utc>) -> Result<Admitted>;

    /// Mark a contributor inactive.
    async fn deactivate_contributor(&self, capsule_id: &CapsuleId, contributor_id: &ContributorId) -> Result<Contributor>;

    /// Fetch a contributor of a capsule.
    async fn contributor(&self, capsule_id: &CapsuleId, contributor_id: &ContributorId) -> Result<Option<Contributor>>;

    /// All contributors of a capsule, in joining order.
    async fn contributors(&self, capsule_id: &CapsuleId) -> Result<Vec<Contributor>>;

    /// Insert or replace the letter of a contributor.
    async fn upsert_letter(
        &self,
        capsule_id: &CapsuleId,
        contributor_id: &ContributorId,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<Letter>;

    /// Current letters of a capsule, in order of first submission.
    async fn letters(&self, capsule_id: &CapsuleId) -> Result<Vec<Letter>>;

    /// Number of distinct contributors with a non-empty current letter.
    async fn count_letters(&self, capsule_id: &CapsuleId) -> Result<u32>;

    /// Apply an additive quantity delta to a gift, clamping at zero.
    async fn adjust_gift(&self, capsule_id: &CapsuleId, sku_id: &SkuId, delta: i64) -> Result<GiftAdjustment>;

    /// Current gift selections of a capsule, ordered by SKU.
    async fn gifts(&self, capsule_id: &CapsuleId) -> Result<Vec<GiftSelection>>;

    /// Claim up to `limit` pending or lease-expired outbox entries.
    async fn claim_outbox(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>>;

    /// Mark an outbox entry dispatched.
    async fn complete_outbox(&self, entry_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Return a claimed entry to pending after a failed emission.
    async fn release_outbox(&self, entry_id: &str, error: &str) -> Result<()>;

    /// Outbox entry of a capsule, if it was delivered.
    async fn outbox_for(&self, capsule_id: &CapsuleId) -> Result<Option<OutboxEntry>>;

    /// Entries not yet dispatched, oldest first.
    async fn pending_outbox(&self) -> Result<Vec<OutboxEntry>>;
}

/// Check a compare-and-set precondition on a capsule.
pub(crate) fn check_transition(capsule: &Capsule, expected_version: u64) -> Result<()> {
    if !capsule.status.is_open() {
        return Err(CapsuleError::closed(&capsule.id, capsule.status));
    }
    if capsule.version != expected_version {
        return Err(CapsuleError::ConcurrentModification(capsule.id.clone()));
    }
    Ok(())
}

/// Load a capsule that must still be collecting.
///
/// Services call this before validating input or taking the capsule lock,
/// so a closed capsule reports `CapsuleClosed` whatever else is wrong with
/// the request. The store repeats the check atomically with the write.
pub(crate) async fn require_collecting(store: &dyn CapsuleStore, id: &CapsuleId) -> Result<Capsule> {
    let capsule = store
        .capsule(id)
        .await?
        .ok_or_else(|| CapsuleError::CapsuleNotFound(id.clone()))?;
    if !capsule.status.is_open() {
        return Err(CapsuleError::closed(id, capsule.status));
    }
    Ok(capsule)
}

/// New quantity after applying `delta`, and whether it had to be clamped.
///
/// A quantity that would not fit in `u32` is rejected, never saturated.
pub(crate) fn apply_gift_delta(previous: u32, delta: i64) -> Result<(u32, bool)> {
    let next = i64::from(previous) + delta;
    if next < 0 {
        return Ok((0, true));
    }
    let next = u32::try_from(next).map_err(|_| {
        CapsuleError::InvalidQuantity(format!(
            "gift quantity would exceed {} (currently {})",
            u32::MAX,
            previous
        ))
    })?;
    Ok((next, false))
}
