//! Events emitted to the external notifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::gifts::GiftTotal;
use crate::types::{CapsuleId, ContributorId, Letter, Recipient};

/// Payload of a delivery.
///
/// Every recipient receives an identical copy of all letters and gifts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredCapsule {
    pub capsule_id: CapsuleId,
    pub title: String,
    pub recipients: Vec<Recipient>,
    pub letters: Vec<Letter>,
    pub gift_total: GiftTotal,
    pub delivered_at: DateTime<Utc>,
}

/// Events consumed by notification and fulfilment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CapsuleEvent {
    /// First-ever admission of an identity into a capsule
    ContributorJoined {
        capsule_id: CapsuleId,
        contributor_id: ContributorId,
        display_name: String,
        joined_at: DateTime<Utc>,
    },
    /// A capsule was delivered
    CapsuleDelivered(DeliveredCapsule),
}

impl CapsuleEvent {
    pub fn capsule_id(&self) -> &CapsuleId {
        match self {
            CapsuleEvent::ContributorJoined { capsule_id, .. } => capsule_id,
            CapsuleEvent::CapsuleDelivered(delivered) => &delivered.capsule_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CapsuleEvent::ContributorJoined { .. } => "contributor_joined",
            CapsuleEvent::CapsuleDelivered(_) => "capsule_delivered",
        }
    }
}

/// Notifier failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NotifyError {
    #[error("Notifier unavailable: {0}")]
    Unavailable(String),

    #[error("Notifier rejected event: {0}")]
    Rejected(String),
}

/// Consumer of capsule events.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// Name of the sink.
    fn name(&self) -> &str;

    /// Hand an event to the consumer.
    async fn publish(&self, event: &CapsuleEvent) -> Result<(), NotifyError>;
}

/// Sink that writes events to the log.
pub struct LoggingSink;

#[async_trait::async_trait]
impl EventSink for LoggingSink {
    fn name(&self) -> &str {
        "logging"
    }

    async fn publish(&self, event: &CapsuleEvent) -> Result<(), NotifyError> {
        match event {
            CapsuleEvent::ContributorJoined {
                capsule_id,
                contributor_id,
                display_name,
                ..
            } => {
                info!(
                    capsule_id = %capsule_id,
                    contributor_id = %contributor_id,
                    display_name = %display_name,
                    "Contributor joined"
                );
            }
            CapsuleEvent::CapsuleDelivered(delivered) => {
                info!(
                    capsule_id = %delivered.capsule_id,
                    recipients = delivered.recipients.len(),
                    letters = delivered.letters.len(),
                    gift_total_cents = delivered.gift_total.total_price_cents,
                    "Capsule delivered"
                );
            }
        }
        Ok(())
    }
}

/// Sink that keeps every event in memory.
#[derive(Default)]
pub struct MemorySink {
    events: RwLock<Vec<CapsuleEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<CapsuleEvent> {
        self.events.read().await.clone()
    }

    /// Delivery events for one capsule.
    pub async fn deliveries(&self, capsule_id: &CapsuleId) -> Vec<DeliveredCapsule> {
        self.events
            .read()
            .await
            .iter()
            .filter_map(|e| match e {
                CapsuleEvent::CapsuleDelivered(d) if &d.capsule_id == capsule_id => Some(d.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl EventSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn publish(&self, event: &CapsuleEvent) -> Result<(), NotifyError> {
        self.events.write().await.push(event.clone());
        Ok(())
    }
}
