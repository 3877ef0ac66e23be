//! Error types for the capsule engine.
//!
//! Every variant except [`CapsuleError::Storage`] is an expected end-state
//! that callers branch on (via [`CapsuleError::kind`]) and show to users.

use serde::{Deserialize, Serialize};

use crate::types::{CapsuleId, CapsuleStatus, ContributorId, SkuId};

/// Errors returned by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum CapsuleError {
    /// No capsule with this ID
    #[error("Capsule {0} does not exist")]
    CapsuleNotFound(CapsuleId),

    /// Invites can only be issued while a capsule is collecting
    #[error("Capsule {id} is {status} and no longer accepts new invites")]
    CapsuleNotOpen { id: CapsuleId, status: CapsuleStatus },

    /// Mutation attempted after the capsule closed
    #[error("Capsule {id} is {status}; letters, gifts and new members are closed")]
    CapsuleClosed { id: CapsuleId, status: CapsuleStatus },

    /// Invite code not recognised
    #[error("Invite code is not valid")]
    InviteUnknown,

    /// Invite code past its expiry
    #[error("Invite code has expired")]
    InviteExpired,

    /// Invite code has been used the maximum number of times
    #[error("Invite code has already been used the maximum number of times")]
    InviteExhausted,

    /// Quantity out of range
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    /// Compare-and-set lost to a concurrent writer
    #[error("Capsule {0} was modified concurrently; re-read and retry")]
    ConcurrentModification(CapsuleId),

    /// Contributor is not a member of the capsule
    #[error("Contributor {0} is not a member of this capsule")]
    ContributorNotFound(ContributorId),

    /// Contributor has left the capsule
    #[error("Contributor {0} has left this capsule")]
    ContributorInactive(ContributorId),

    /// Letter body was blank
    #[error("Letter body is empty")]
    EmptyLetter,

    /// Gift is not in the price list
    #[error("Gift {0} is not available")]
    UnknownSku(SkuId),

    /// Capsule request failed validation
    #[error("Invalid capsule: {0}")]
    InvalidCapsule(String),

    /// Backend failure; the only fatal class
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl CapsuleError {
    /// Discriminant for UI branching.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CapsuleError::CapsuleNotFound(_) => ErrorKind::CapsuleNotFound,
            CapsuleError::CapsuleNotOpen { .. } => ErrorKind::CapsuleNotOpen,
            CapsuleError::CapsuleClosed { .. } => ErrorKind::CapsuleClosed,
            CapsuleError::InviteUnknown => ErrorKind::InviteUnknown,
            CapsuleError::InviteExpired => ErrorKind::InviteExpired,
            CapsuleError::InviteExhausted => ErrorKind::InviteExhausted,
            CapsuleError::InvalidQuantity(_) => ErrorKind::InvalidQuantity,
            CapsuleError::ConcurrentModification(_) => ErrorKind::ConcurrentModification,
            CapsuleError::ContributorNotFound(_) => ErrorKind::ContributorNotFound,
            CapsuleError::ContributorInactive(_) => ErrorKind::ContributorInactive,
            CapsuleError::EmptyLetter => ErrorKind::EmptyLetter,
            CapsuleError::UnknownSku(_) => ErrorKind::UnknownSku,
            CapsuleError::InvalidCapsule(_) => ErrorKind::InvalidCapsule,
            CapsuleError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// False only for storage failures.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CapsuleError::Storage(_))
    }

    pub(crate) fn closed(id: &CapsuleId, status: CapsuleStatus) -> Self {
        CapsuleError::CapsuleClosed {
            id: id.clone(),
            status,
        }
    }
}

impl From<rusqlite::Error> for CapsuleError {
    fn from(e: rusqlite::Error) -> Self {
        CapsuleError::Storage(StorageError::Database(e))
    }
}

impl From<serde_json::Error> for CapsuleError {
    fn from(e: serde_json::Error) -> Self {
        CapsuleError::Storage(StorageError::Serialization(e))
    }
}

/// Closed taxonomy of error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CapsuleNotFound,
    CapsuleNotOpen,
    CapsuleClosed,
    InviteUnknown,
    InviteExpired,
    InviteExhausted,
    InvalidQuantity,
    ConcurrentModification,
    ContributorNotFound,
    ContributorInactive,
    EmptyLetter,
    UnknownSku,
    InvalidCapsule,
    Storage,
}

/// Storage backend failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Duplicate key: {0}")]
    Duplicate(String),

    #[error("Storage internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CapsuleError>;
