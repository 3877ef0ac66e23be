//! In-memory store on concurrent maps.
//!
//! Writes that depend on a capsule being open hold a read guard on the
//! capsule entry for their whole duration; status changes take a write guard
//! on the same entry, so they cannot interleave. Maps are always locked in
//! the order capsules, invites, admissions, contributors, letters, gifts,
//! outbox.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::Ref;
use dashmap::DashMap;
use tracing::debug;

use super::{apply_gift_delta, check_transition, CapsuleStore};
use crate::error::StorageError;
use crate::gifts::{GiftAdjustment, PriceList};
use crate::outbox::{DeliverySnapshot, OutboxEntry, OutboxState};
use crate::types::{
    Admission, Admitted, Capsule, CapsuleId, CapsuleStatus, Contributor, ContributorId,
    GiftSelection, InviteCode, Letter, LetterId, SkuId,
};
use crate::{CapsuleError, Result};

/// Concurrent in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    capsules: DashMap<CapsuleId, Capsule>,
    invites: DashMap<String, InviteCode>,
    /// Uniqueness index: (capsule, admission key) -> contributor
    admissions: DashMap<(CapsuleId, String), ContributorId>,
    contributors: DashMap<ContributorId, Contributor>,
    letters: DashMap<(CapsuleId, ContributorId), Letter>,
    gifts: DashMap<(CapsuleId, SkuId), u32>,
    outbox: DashMap<String, OutboxEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read guard on a capsule that is still collecting.
    fn open_capsule(&self, id: &CapsuleId) -> Result<Ref<'_, CapsuleId, Capsule>> {
        let capsule = self
            .capsules
            .get(id)
            .ok_or_else(|| CapsuleError::CapsuleNotFound(id.clone()))?;
        if !capsule.status.is_open() {
            return Err(CapsuleError::closed(id, capsule.status));
        }
        Ok(capsule)
    }

    fn collect_letters(&self, capsule_id: &CapsuleId) -> Vec<Letter> {
        let mut letters: Vec<Letter> = self
            .letters
            .iter()
            .filter(|e| &e.key().0 == capsule_id)
            .map(|e| e.value().clone())
            .collect();
        letters.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        letters
    }

    fn collect_gifts(&self, capsule_id: &CapsuleId) -> Vec<GiftSelection> {
        let mut gifts: Vec<GiftSelection> = self
            .gifts
            .iter()
            .filter(|e| &e.key().0 == capsule_id)
            .map(|e| GiftSelection {
                capsule_id: capsule_id.clone(),
                sku_id: e.key().1.clone(),
                quantity: *e.value(),
            })
            .collect();
        gifts.sort_by(|a, b| a.sku_id.cmp(&b.sku_id));
        gifts
    }

    fn outbox_missing(entry_id: &str) -> CapsuleError {
        StorageError::Corrupt(format!("outbox entry {} not found", entry_id)).into()
    }
}

#[async_trait::async_trait]
impl CapsuleStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert_capsule(&self, capsule: &Capsule) -> Result<()> {
        match self.capsules.entry(capsule.id.clone()) {
            Entry::Occupied(_) => Err(StorageError::Duplicate(format!("capsule {}", capsule.id)).into()),
            Entry::Vacant(e) => {
                e.insert(capsule.clone());
                Ok(())
            }
        }
    }

    async fn capsule(&self, id: &CapsuleId) -> Result<Option<Capsule>> {
        Ok(self.capsules.get(id).map(|c| c.clone()))
    }

    async fn capsules_with_status(&self, status: CapsuleStatus) -> Result<Vec<Capsule>> {
        let mut capsules: Vec<Capsule> = self
            .capsules
            .iter()
            .filter(|c| c.status == status)
            .map(|c| c.value().clone())
            .collect();
        capsules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(capsules)
    }

    async fn cancel(&self, id: &CapsuleId, expected_version: u64, at: DateTime<Utc>) -> Result<Capsule> {
        let mut capsule = self
            .capsules
            .get_mut(id)
            .ok_or_else(|| CapsuleError::CapsuleNotFound(id.clone()))?;
        check_transition(&capsule, expected_version)?;

        capsule.status = CapsuleStatus::Cancelled;
        capsule.version += 1;
        capsule.closed_at = Some(at);
        Ok(capsule.clone())
    }

    async fn commit_delivery(
        &self,
        id: &CapsuleId,
        expected_version: u64,
        at: DateTime<Utc>,
        lease: chrono::Duration,
        prices: &PriceList,
    ) -> Result<OutboxEntry> {
        // The write guard excludes every in-flight letter and gift write.
        let mut capsule = self
            .capsules
            .get_mut(id)
            .ok_or_else(|| CapsuleError::CapsuleNotFound(id.clone()))?;
        check_transition(&capsule, expected_version)?;

        capsule.status = CapsuleStatus::Delivered;
        capsule.version += 1;
        capsule.closed_at = Some(at);

        let gifts = self.collect_gifts(id);
        let snapshot = DeliverySnapshot {
            capsule_id: id.clone(),
            title: capsule.title.clone(),
            recipients: capsule.recipients.clone(),
            letters: self.collect_letters(id),
            gift_total: prices.price(&gifts),
            gifts,
            delivered_at: at,
        };
        let entry = OutboxEntry::claimed(snapshot, at, lease);
        self.outbox.insert(entry.id.clone(), entry.clone());

        debug!(capsule_id = %id, entry_id = %entry.id, "Delivery committed");
        Ok(entry)
    }

    async fn insert_invite(&self, invite: &InviteCode) -> Result<bool> {
        let capsule = self
            .capsules
            .get(&invite.capsule_id)
            .ok_or_else(|| CapsuleError::CapsuleNotFound(invite.capsule_id.clone()))?;
        if !capsule.status.is_open() {
            return Err(CapsuleError::CapsuleNotOpen {
                id: capsule.id.clone(),
                status: capsule.status,
            });
        }

        match self.invites.entry(invite.code.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(e) => {
                e.insert(invite.clone());
                Ok(true)
            }
        }
    }

    async fn invite(&self, code: &str) -> Result<Option<InviteCode>> {
        Ok(self.invites.get(code).map(|i| i.clone()))
    }

    async fn redeem(&self, code: &str, admission: &Admission, now: DateTime<Utc>) -> Result<Admitted> {
        // Resolve the capsule first so the capsule guard is taken before the invite's.
        let capsule_id = self
            .invites
            .get(code)
            .map(|i| i.capsule_id.clone())
            .ok_or(CapsuleError::InviteUnknown)?;
        let _capsule = self.open_capsule(&capsule_id)?;
        let mut invite = self.invites.get_mut(code).ok_or(CapsuleError::InviteUnknown)?;

        match self
            .admissions
            .entry((capsule_id.clone(), admission.admission_key.clone()))
        {
            Entry::Occupied(e) => {
                let mut contributor = self.contributors.get_mut(e.get()).ok_or_else(|| {
                    StorageError::Corrupt(format!("admission index points at missing contributor {}", e.get()))
                })?;
                contributor.active = true;
                Ok(Admitted {
                    contributor: contributor.clone(),
                    newly_admitted: false,
                })
            }
            Entry::Vacant(e) => {
                if invite.is_expired(now) {
                    return Err(CapsuleError::InviteExpired);
                }
                if invite.is_exhausted() {
                    return Err(CapsuleError::InviteExhausted);
                }

                let contributor = Contributor {
                    id: ContributorId::generate(),
                    capsule_id: capsule_id.clone(),
                    display_name: admission.display_name.clone(),
                    relation_label: admission.relation_label.clone(),
                    admission_key: admission.admission_key.clone(),
                    joined_at: now,
                    active: true,
                };
                self.contributors.insert(contributor.id.clone(), contributor.clone());
                e.insert(contributor.id.clone());
                invite.uses += 1;

                Ok(Admitted {
                    contributor,
                    newly_admitted: true,
                })
            }
        }
    }

    async fn deactivate_contributor(&self, capsule_id: &CapsuleId, contributor_id: &ContributorId) -> Result<Contributor> {
        let _capsule = self.open_capsule(capsule_id)?;
        let mut contributor = self
            .contributors
            .get_mut(contributor_id)
            .filter(|c| &c.capsule_id == capsule_id)
            .ok_or_else(|| CapsuleError::ContributorNotFound(contributor_id.clone()))?;
        contributor.active = false;
        Ok(contributor.clone())
    }

    async fn contributor(&self, capsule_id: &CapsuleId, contributor_id: &ContributorId) -> Result<Option<Contributor>> {
        Ok(self
            .contributors
            .get(contributor_id)
            .filter(|c| &c.capsule_id == capsule_id)
            .map(|c| c.clone()))
    }

    async fn contributors(&self, capsule_id: &CapsuleId) -> Result<Vec<Contributor>> {
        let mut contributors: Vec<Contributor> = self
            .contributors
            .iter()
            .filter(|c| &c.capsule_id == capsule_id)
            .map(|c| c.value().clone())
            .collect();
        contributors.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        Ok(contributors)
    }

    async fn upsert_letter(
        &self,
        capsule_id: &CapsuleId,
        contributor_id: &ContributorId,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<Letter> {
        let _capsule = self.open_capsule(capsule_id)?;
        {
            let contributor = self
                .contributors
                .get(contributor_id)
                .filter(|c| &c.capsule_id == capsule_id)
                .ok_or_else(|| CapsuleError::ContributorNotFound(contributor_id.clone()))?;
            if !contributor.active {
                return Err(CapsuleError::ContributorInactive(contributor_id.clone()));
            }
        }

        let letter = match self.letters.entry((capsule_id.clone(), contributor_id.clone())) {
            Entry::Occupied(mut e) => {
                let letter = e.get_mut();
                letter.body = body.to_string();
                letter.submitted_at = now;
                letter.revision += 1;
                letter.clone()
            }
            Entry::Vacant(e) => {
                let letter = Letter {
                    id: LetterId::generate(),
                    capsule_id: capsule_id.clone(),
                    contributor_id: contributor_id.clone(),
                    body: body.to_string(),
                    created_at: now,
                    submitted_at: now,
                    revision: 1,
                };
                e.insert(letter.clone());
                letter
            }
        };
        Ok(letter)
    }

    async fn letters(&self, capsule_id: &CapsuleId) -> Result<Vec<Letter>> {
        Ok(self.collect_letters(capsule_id))
    }

    async fn count_letters(&self, capsule_id: &CapsuleId) -> Result<u32> {
        let count = self
            .letters
            .iter()
            .filter(|e| &e.key().0 == capsule_id && !e.value().body.trim().is_empty())
            .count();
        Ok(count as u32)
    }

    async fn adjust_gift(&self, capsule_id: &CapsuleId, sku_id: &SkuId, delta: i64) -> Result<GiftAdjustment> {
        let _capsule = self.open_capsule(capsule_id)?;
        let mut quantity = self
            .gifts
            .entry((capsule_id.clone(), sku_id.clone()))
            .or_insert(0);

        let previous = *quantity;
        let (next, clamped) = apply_gift_delta(previous, delta)?;
        *quantity = next;

        Ok(GiftAdjustment {
            selection: GiftSelection {
                capsule_id: capsule_id.clone(),
                sku_id: sku_id.clone(),
                quantity: next,
            },
            previous,
            clamped,
        })
    }

    async fn gifts(&self, capsule_id: &CapsuleId) -> Result<Vec<GiftSelection>> {
        Ok(self.collect_gifts(capsule_id))
    }

    async fn claim_outbox(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>> {
        let mut candidates: Vec<(DateTime<Utc>, String)> = self
            .outbox
            .iter()
            .filter(|e| e.is_claimable(now))
            .map(|e| (e.created_at, e.id.clone()))
            .collect();
        candidates.sort();

        let mut claimed = Vec::new();
        for (_, id) in candidates {
            if claimed.len() >= limit {
                break;
            }
            // Re-check under the entry's write guard; another replayer may have won.
            if let Some(mut entry) = self.outbox.get_mut(&id) {
                if entry.is_claimable(now) {
                    entry.state = OutboxState::Claimed { lease_until };
                    claimed.push(entry.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn complete_outbox(&self, entry_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut entry = self
            .outbox
            .get_mut(entry_id)
            .ok_or_else(|| Self::outbox_missing(entry_id))?;
        entry.state = OutboxState::Dispatched { at };
        entry.last_error = None;
        Ok(())
    }

    async fn release_outbox(&self, entry_id: &str, error: &str) -> Result<()> {
        let mut entry = self
            .outbox
            .get_mut(entry_id)
            .ok_or_else(|| Self::outbox_missing(entry_id))?;
        if !entry.is_dispatched() {
            entry.state = OutboxState::Pending;
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn outbox_for(&self, capsule_id: &CapsuleId) -> Result<Option<OutboxEntry>> {
        Ok(self
            .outbox
            .iter()
            .find(|e| &e.snapshot.capsule_id == capsule_id)
            .map(|e| e.value().clone()))
    }

    async fn pending_outbox(&self) -> Result<Vec<OutboxEntry>> {
        let mut pending: Vec<OutboxEntry> = self
            .outbox
            .iter()
            .filter(|e| !e.is_dispatched())
            .map(|e| e.value().clone())
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }
}
