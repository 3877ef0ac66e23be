//! Contribution ledger - one current letter per contributor per capsule.
//!
//! Progress is never cached; it is recounted from stored letters on every
//! read so it cannot drift from what will actually be delivered.

use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::locks::CapsuleLocks;
use crate::store::{require_collecting, CapsuleStore};
use crate::types::{CapsuleId, ContributorId, Letter, Progress};
use crate::{CapsuleError, Result};

/// Records letters and reports progress toward the letter goal.
pub struct ContributionLedger {
    store: Arc<dyn CapsuleStore>,
    locks: Arc<CapsuleLocks>,
    clock: Arc<dyn Clock>,
}

impl ContributionLedger {
    pub fn new(store: Arc<dyn CapsuleStore>, locks: Arc<CapsuleLocks>, clock: Arc<dyn Clock>) -> Self {
        Self { store, locks, clock }
    }

    /// Submit or replace a contributor's letter.
    ///
    /// A closed capsule is reported before anything is said about the body.
    pub async fn submit_letter(
        &self,
        capsule_id: &CapsuleId,
        contributor_id: &ContributorId,
        body: &str,
    ) -> Result<Letter> {
        require_collecting(self.store.as_ref(), capsule_id).await?;
        if body.trim().is_empty() {
            return Err(CapsuleError::EmptyLetter);
        }

        let _guard = self.locks.lock(capsule_id).await;
        let letter = self
            .store
            .upsert_letter(capsule_id, contributor_id, body, self.clock.now())
            .await?;

        if letter.revision == 1 {
            info!(capsule_id = %capsule_id, contributor_id = %contributor_id, "Letter submitted");
        } else {
            debug!(
                capsule_id = %capsule_id,
                contributor_id = %contributor_id,
                revision = letter.revision,
                "Letter replaced"
            );
        }
        Ok(letter)
    }

    /// Letters collected against the capsule's target.
    pub async fn progress(&self, capsule_id: &CapsuleId) -> Result<Progress> {
        let capsule = self
            .store
            .capsule(capsule_id)
            .await?
            .ok_or_else(|| CapsuleError::CapsuleNotFound(capsule_id.clone()))?;
        let letters_collected = self.store.count_letters(capsule_id).await?;

        Ok(Progress {
            letters_collected,
            target_letter_count: capsule.target_letter_count,
        })
    }

    /// Current letters, in order of first submission.
    pub async fn letters(&self, capsule_id: &CapsuleId) -> Result<Vec<Letter>> {
        self.store
            .capsule(capsule_id)
            .await?
            .ok_or_else(|| CapsuleError::CapsuleNotFound(capsule_id.clone()))?;
        self.store.letters(capsule_id).await
    }
}
