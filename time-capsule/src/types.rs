//! Core types for the time capsule engine.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identifier of a capsule.
    CapsuleId
);
string_id!(
    /// Identifier of a contributor seat within one capsule.
    ContributorId
);
string_id!(
    /// Identifier of a letter.
    LetterId
);
string_id!(
    /// Identifier of a gift in the price list.
    SkuId
);

/// Lifecycle status of a capsule.
///
/// Transitions only move forward: `Collecting` may advance to `Ready`,
/// `Delivered` or `Cancelled`; `Ready` may only advance to `Delivered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapsuleStatus {
    /// Accepting joins, letters and gifts
    Collecting,
    /// Delivery condition observed; never persisted by this engine
    Ready,
    /// Terminal: delivered and frozen
    Delivered,
    /// Terminal: aborted by an administrator
    Cancelled,
}

impl CapsuleStatus {
    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CapsuleStatus::Collecting => "COLLECTING",
            CapsuleStatus::Ready => "READY",
            CapsuleStatus::Delivered => "DELIVERED",
            CapsuleStatus::Cancelled => "CANCELLED",
        }
    }

    /// Parse the string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "COLLECTING" => Some(CapsuleStatus::Collecting),
            "READY" => Some(CapsuleStatus::Ready),
            "DELIVERED" => Some(CapsuleStatus::Delivered),
            "CANCELLED" => Some(CapsuleStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, CapsuleStatus::Collecting)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CapsuleStatus::Delivered | CapsuleStatus::Cancelled)
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    pub fn can_transition_to(&self, next: CapsuleStatus) -> bool {
        use CapsuleStatus::*;
        matches!(
            (self, next),
            (Collecting, Ready) | (Collecting, Delivered) | (Collecting, Cancelled) | (Ready, Delivered)
        )
    }
}

impl fmt::Display for CapsuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Someone a capsule is delivered to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Recipient's name as it appears on mail
    pub name: String,
    /// Delivery facility reference
    pub facility: String,
    /// Facility-issued identification number, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inmate_number: Option<String>,
}

impl Recipient {
    pub fn new(name: impl Into<String>, facility: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            facility: facility.into(),
            inmate_number: None,
        }
    }

    pub fn with_inmate_number(mut self, number: impl Into<String>) -> Self {
        self.inmate_number = Some(number.into());
        self
    }
}

/// The unit of collection and delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capsule {
    /// Unique capsule ID
    pub id: CapsuleId,
    /// Display title
    pub title: String,
    /// Current lifecycle status
    pub status: CapsuleStatus,
    /// Recipients, all receiving the same delivery
    pub recipients: Vec<Recipient>,
    /// Letter-count goal
    pub target_letter_count: u32,
    /// Date (UTC) by which delivery happens
    pub target_date: NaiveDate,
    /// Deliver as soon as the letter goal is reached
    pub deliver_on_goal_reached: bool,
    /// Who created the capsule
    pub created_by: String,
    /// When the capsule was created
    pub created_at: DateTime<Utc>,
    /// Bumped on every status change; guards compare-and-set
    pub version: u64,
    /// When the capsule reached a terminal status
    pub closed_at: Option<DateTime<Utc>>,
}

/// Request to create a capsule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCapsule {
    pub title: String,
    pub recipients: Vec<Recipient>,
    pub target_letter_count: u32,
    pub target_date: NaiveDate,
    #[serde(default)]
    pub deliver_on_goal_reached: bool,
    pub created_by: String,
}

impl NewCapsule {
    /// Create a request for a single recipient.
    pub fn new(
        title: impl Into<String>,
        recipient: Recipient,
        target_letter_count: u32,
        target_date: NaiveDate,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            recipients: vec![recipient],
            target_letter_count,
            target_date,
            deliver_on_goal_reached: false,
            created_by: created_by.into(),
        }
    }

    /// Add another recipient.
    pub fn with_recipient(mut self, recipient: Recipient) -> Self {
        self.recipients.push(recipient);
        self
    }

    /// Deliver early once the letter goal is reached.
    pub fn deliver_on_goal(mut self, enabled: bool) -> Self {
        self.deliver_on_goal_reached = enabled;
        self
    }
}

/// A person admitted to a capsule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contributor {
    pub id: ContributorId,
    pub capsule_id: CapsuleId,
    pub display_name: String,
    /// Free-form relationship to the recipient ("sister", "old cellmate")
    pub relation_label: String,
    /// External identity (phone or email) used to deduplicate admission
    pub admission_key: String,
    pub joined_at: DateTime<Utc>,
    /// False once the contributor has left
    pub active: bool,
}

/// Identity presented when redeeming an invite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Admission {
    pub admission_key: String,
    pub display_name: String,
    pub relation_label: String,
}

impl Admission {
    pub fn new(
        admission_key: impl Into<String>,
        display_name: impl Into<String>,
        relation_label: impl Into<String>,
    ) -> Self {
        Self {
            admission_key: admission_key.into(),
            display_name: display_name.into(),
            relation_label: relation_label.into(),
        }
    }
}

/// Outcome of an admission attempt at the store.
#[derive(Debug, Clone)]
pub struct Admitted {
    pub contributor: Contributor,
    /// True only for the first-ever admission of this identity
    pub newly_admitted: bool,
}

/// A contributor's current letter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Letter {
    pub id: LetterId,
    pub capsule_id: CapsuleId,
    pub contributor_id: ContributorId,
    pub body: String,
    /// First submission
    pub created_at: DateTime<Utc>,
    /// Latest submission
    pub submitted_at: DateTime<Utc>,
    /// 1 on first submission, incremented on each rewrite
    pub revision: u32,
}

/// Aggregated quantity of one gift in a capsule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GiftSelection {
    pub capsule_id: CapsuleId,
    pub sku_id: SkuId,
    pub quantity: u32,
}

/// An invite code; redemption is the only way in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteCode {
    pub code: String,
    pub capsule_id: CapsuleId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_uses: Option<u32>,
    /// Admissions produced so far
    pub uses: u32,
}

impl InviteCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| now >= e).unwrap_or(false)
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_uses.map(|max| self.uses >= max).unwrap_or(false)
    }
}

/// Letter progress against the capsule target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Distinct contributors with a current letter
    pub letters_collected: u32,
    pub target_letter_count: u32,
}

impl Progress {
    /// Completion ratio clamped to `[0, 1]`.
    pub fn ratio(&self) -> f64 {
        if self.target_letter_count == 0 {
            return 1.0;
        }
        (self.letters_collected as f64 / self.target_letter_count as f64).clamp(0.0, 1.0)
    }

    pub fn is_goal_reached(&self) -> bool {
        self.letters_collected >= self.target_letter_count
    }
}
