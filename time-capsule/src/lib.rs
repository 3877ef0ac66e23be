//! Time Capsule - collect letters and gifts for someone inside, deliver once
//!
//! Family and friends are invited into a capsule, each write one letter and
//! pick gifts, and the whole bundle is delivered to the recipients when the
//! target date arrives or, optionally, when enough letters are in:
//!
//! - **Invitations**: codes with optional expiry and use limits; admission is
//!   idempotent per identity
//! - **Ledger**: one current letter per contributor, progress recounted on read
//! - **Gifts**: additive quantities priced from a static list
//! - **Delivery**: exactly-once `COLLECTING -> DELIVERED` with an outbox for
//!   the notification
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       CapsuleEngine                          │
//! │                                                              │
//! │  ┌────────────┐ ┌────────┐ ┌───────┐ ┌───────────────────┐   │
//! │  │ Invitation │ │ Ledger │ │ Gifts │ │ DeliveryScheduler │   │
//! │  └─────┬──────┘ └───┬────┘ └───┬───┘ └────┬─────────┬────┘   │
//! │        │   CapsuleLocks (per capsule)     │   OutboxRelay    │
//! │        └────────────┴──────────┴──────────┘         │        │
//! │                       │                        EventSink     │
//! │                ┌──────▼───────┐                              │
//! │                │ CapsuleStore │  Memory | SQLite             │
//! │                └──────────────┘                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod gifts;
pub mod invitation;
pub mod ledger;
pub mod lifecycle;
pub mod locks;
pub mod outbox;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-export main types
pub use config::EngineConfig;
pub use engine::{CapsuleEngine, CapsuleEngineBuilder};
pub use error::{CapsuleError, ErrorKind, Result, StorageError};
pub use events::{CapsuleEvent, EventSink};
pub use store::{CapsuleStore, MemoryStore, SqliteStore};
pub use types::*;
