//! Invitation service - mints invite codes and admits contributors.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::InviteConfig;
use crate::events::{CapsuleEvent, EventSink};
use crate::locks::CapsuleLocks;
use crate::store::{require_collecting, CapsuleStore};
use crate::types::{Admission, CapsuleId, Contributor, ContributorId, InviteCode};
use crate::{CapsuleError, Result};

/// Uppercase letters and digits without the look-alikes 0/O, 1/I/L.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

fn generate_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Issues invite codes and turns redemptions into contributors.
pub struct InvitationService {
    config: InviteConfig,
    store: Arc<dyn CapsuleStore>,
    locks: Arc<CapsuleLocks>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl InvitationService {
    pub fn new(
        config: InviteConfig,
        store: Arc<dyn CapsuleStore>,
        locks: Arc<CapsuleLocks>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            locks,
            sink,
            clock,
        }
    }

    /// Mint a new invite code for a collecting capsule.
    ///
    /// `max_uses` of `None` means unlimited. Without `expires_at` the
    /// configured default expiry applies, if any.
    pub async fn issue_invite(
        &self,
        capsule_id: &CapsuleId,
        max_uses: Option<u32>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<InviteCode> {
        if max_uses == Some(0) {
            return Err(CapsuleError::InvalidQuantity(
                "an invite must allow at least one use".to_string(),
            ));
        }

        let now = self.clock.now();
        let expires_at = expires_at.or_else(|| {
            self.config
                .default_expiry_hours
                .map(|hours| now + chrono::Duration::hours(hours as i64))
        });

        for attempt in 1..=self.config.max_generation_attempts.max(1) {
            let invite = InviteCode {
                code: generate_code(self.config.code_length),
                capsule_id: capsule_id.clone(),
                issued_at: now,
                expires_at,
                max_uses,
                uses: 0,
            };

            if self.store.insert_invite(&invite).await? {
                info!(
                    capsule_id = %capsule_id,
                    max_uses = ?max_uses,
                    expires_at = ?expires_at,
                    "Invite issued"
                );
                return Ok(invite);
            }
            debug!(capsule_id = %capsule_id, attempt, "Invite code collision, regenerating");
        }

        Err(crate::error::StorageError::Internal(format!(
            "no free invite code after {} attempts",
            self.config.max_generation_attempts
        ))
        .into())
    }

    /// Admit an identity through an invite code.
    ///
    /// Redeeming again with the same admission key returns the existing
    /// contributor instead of creating a second one.
    pub async fn redeem(&self, code: &str, admission: &Admission) -> Result<Contributor> {
        let code = code.trim().to_ascii_uppercase();
        let invite = self
            .store
            .invite(&code)
            .await?
            .ok_or(CapsuleError::InviteUnknown)?;

        let admitted = {
            let _guard = self.locks.lock(&invite.capsule_id).await;
            self.store.redeem(&code, admission, self.clock.now()).await?
        };
        let contributor = admitted.contributor;

        if !admitted.newly_admitted {
            debug!(
                capsule_id = %contributor.capsule_id,
                contributor_id = %contributor.id,
                "Identity already admitted"
            );
            return Ok(contributor);
        }

        info!(
            capsule_id = %contributor.capsule_id,
            contributor_id = %contributor.id,
            relation = %contributor.relation_label,
            "Contributor admitted"
        );

        let event = CapsuleEvent::ContributorJoined {
            capsule_id: contributor.capsule_id.clone(),
            contributor_id: contributor.id.clone(),
            display_name: contributor.display_name.clone(),
            joined_at: contributor.joined_at,
        };
        if let Err(e) = self.sink.publish(&event).await {
            warn!(
                capsule_id = %contributor.capsule_id,
                contributor_id = %contributor.id,
                sink = self.sink.name(),
                error = %e,
                "Failed to publish join event"
            );
        }

        Ok(contributor)
    }

    /// Mark a contributor as having left. Their letter stays counted.
    pub async fn leave(&self, capsule_id: &CapsuleId, contributor_id: &ContributorId) -> Result<Contributor> {
        require_collecting(self.store.as_ref(), capsule_id).await?;
        let _guard = self.locks.lock(capsule_id).await;
        let contributor = self
            .store
            .deactivate_contributor(capsule_id, contributor_id)
            .await?;
        info!(capsule_id = %capsule_id, contributor_id = %contributor_id, "Contributor left");
        Ok(contributor)
    }

    /// Contributors of a capsule, in joining order.
    pub async fn contributors(&self, capsule_id: &CapsuleId) -> Result<Vec<Contributor>> {
        self.store
            .capsule(capsule_id)
            .await?
            .ok_or_else(|| CapsuleError::CapsuleNotFound(capsule_id.clone()))?;
        self.store.contributors(capsule_id).await
    }
}
