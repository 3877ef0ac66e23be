//! Capsule engine - the public entry point wiring all components together.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::events::{EventSink, LoggingSink};
use crate::gifts::{GiftAggregator, GiftTotal, PriceList};
use crate::invitation::InvitationService;
use crate::ledger::ContributionLedger;
use crate::lifecycle::CapsuleLifecycle;
use crate::locks::CapsuleLocks;
use crate::outbox::{OutboxEntry, OutboxRelay};
use crate::scheduler::{DeliveryScheduler, EvaluationOutcome, TickReport};
use crate::store::{CapsuleStore, MemoryStore};
use crate::types::{
    Admission, Capsule, CapsuleId, Contributor, ContributorId, GiftSelection, InviteCode, Letter,
    NewCapsule, Progress, SkuId,
};
use crate::Result;

/// Time capsule engine.
///
/// All components share one store, one per-capsule lock registry and one
/// clock.
pub struct CapsuleEngine {
    config: EngineConfig,
    store: Arc<dyn CapsuleStore>,
    clock: Arc<dyn Clock>,
    lifecycle: CapsuleLifecycle,
    invitations: InvitationService,
    ledger: ContributionLedger,
    gifts: GiftAggregator,
    scheduler: Arc<DeliveryScheduler>,
}

impl CapsuleEngine {
    /// Engine over an in-memory store with default configuration.
    pub fn new() -> Self {
        CapsuleEngineBuilder::new().build()
    }

    pub fn builder() -> CapsuleEngineBuilder {
        CapsuleEngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CapsuleStore> {
        &self.store
    }

    /// The scheduler, for running the background loop on its own task.
    pub fn scheduler(&self) -> Arc<DeliveryScheduler> {
        self.scheduler.clone()
    }

    // ---- lifecycle ----

    pub async fn create_capsule(&self, request: NewCapsule) -> Result<Capsule> {
        self.lifecycle.create_capsule(request).await
    }

    pub async fn capsule(&self, capsule_id: &CapsuleId) -> Result<Capsule> {
        self.lifecycle.capsule(capsule_id).await
    }

    pub async fn cancel(&self, capsule_id: &CapsuleId) -> Result<Capsule> {
        self.lifecycle.cancel(capsule_id).await
    }

    // ---- invitations ----

    pub async fn issue_invite(
        &self,
        capsule_id: &CapsuleId,
        max_uses: Option<u32>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<InviteCode> {
        self.invitations.issue_invite(capsule_id, max_uses, expires_at).await
    }

    pub async fn redeem(&self, code: &str, admission: &Admission) -> Result<Contributor> {
        self.invitations.redeem(code, admission).await
    }

    pub async fn leave(&self, capsule_id: &CapsuleId, contributor_id: &ContributorId) -> Result<Contributor> {
        self.invitations.leave(capsule_id, contributor_id).await
    }

    pub async fn contributors(&self, capsule_id: &CapsuleId) -> Result<Vec<Contributor>> {
        self.invitations.contributors(capsule_id).await
    }

    // ---- letters ----

    /// Submit or replace a letter, then evaluate the capsule for delivery
    /// when eager evaluation is on.
    ///
    /// The letter is committed before the evaluation runs; a failing
    /// evaluation is logged and left for the next tick.
    pub async fn submit_letter(
        &self,
        capsule_id: &CapsuleId,
        contributor_id: &ContributorId,
        body: &str,
    ) -> Result<Letter> {
        let letter = self.ledger.submit_letter(capsule_id, contributor_id, body).await?;

        if self.config.scheduler.eager_on_submit {
            match self.scheduler.evaluate_capsule(capsule_id, self.clock.now()).await {
                Ok(EvaluationOutcome::Delivered { trigger, .. }) => {
                    debug!(capsule_id = %capsule_id, trigger = ?trigger, "Delivered on submission");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(capsule_id = %capsule_id, error = %e, "Eager delivery evaluation failed");
                }
            }
        }
        Ok(letter)
    }

    pub async fn letters(&self, capsule_id: &CapsuleId) -> Result<Vec<Letter>> {
        self.ledger.letters(capsule_id).await
    }

    pub async fn progress(&self, capsule_id: &CapsuleId) -> Result<Progress> {
        self.ledger.progress(capsule_id).await
    }

    // ---- gifts ----

    pub async fn add_gift(&self, capsule_id: &CapsuleId, sku_id: &SkuId, quantity: u32) -> Result<GiftSelection> {
        self.gifts.add_gift(capsule_id, sku_id, quantity).await
    }

    pub async fn remove_gift(&self, capsule_id: &CapsuleId, sku_id: &SkuId, quantity: u32) -> Result<GiftSelection> {
        self.gifts.remove_gift(capsule_id, sku_id, quantity).await
    }

    pub async fn gift_selections(&self, capsule_id: &CapsuleId) -> Result<Vec<GiftSelection>> {
        self.gifts.selections(capsule_id).await
    }

    pub async fn total(&self, capsule_id: &CapsuleId) -> Result<GiftTotal> {
        self.gifts.total(capsule_id).await
    }

    // ---- delivery ----

    /// Run one scheduler pass at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        self.scheduler.tick(now).await
    }

    /// Run one scheduler pass at the engine clock's current time.
    pub async fn tick_now(&self) -> Result<TickReport> {
        self.scheduler.tick(self.clock.now()).await
    }

    /// Run the scheduler at the configured interval until `shutdown`.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let interval = Duration::from_secs(self.config.scheduler.interval_secs.max(1));
        self.scheduler.run(interval, shutdown).await
    }

    /// Deliveries whose event has not been accepted yet.
    pub async fn pending_outbox(&self) -> Result<Vec<OutboxEntry>> {
        self.store.pending_outbox().await
    }
}

impl Default for CapsuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`CapsuleEngine`].
pub struct CapsuleEngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn CapsuleStore>>,
    sink: Option<Arc<dyn EventSink>>,
    clock: Option<Arc<dyn Clock>>,
}

impl CapsuleEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            store: None,
            sink: None,
            clock: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the store. Defaults to a fresh [`MemoryStore`].
    pub fn store(mut self, store: Arc<dyn CapsuleStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the event sink. Defaults to [`LoggingSink`].
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Set the clock. Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Enable/disable evaluation right after each letter.
    pub fn eager_on_submit(mut self, enabled: bool) -> Self {
        self.config.scheduler.eager_on_submit = enabled;
        self
    }

    pub fn build(self) -> CapsuleEngine {
        let config = self.config;
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let sink = self.sink.unwrap_or_else(|| Arc::new(LoggingSink));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let locks = Arc::new(CapsuleLocks::new());
        let prices = Arc::new(PriceList::from_config(&config.gifts));

        let relay = Arc::new(OutboxRelay::new(config.outbox.clone(), store.clone(), sink.clone()));

        info!(
            store = store.name(),
            sink = sink.name(),
            skus = config.gifts.skus.len(),
            "Capsule engine initialized"
        );

        CapsuleEngine {
            lifecycle: CapsuleLifecycle::new(store.clone(), locks.clone(), clock.clone()),
            invitations: InvitationService::new(
                config.invites.clone(),
                store.clone(),
                locks.clone(),
                sink,
                clock.clone(),
            ),
            ledger: ContributionLedger::new(store.clone(), locks.clone(), clock.clone()),
            gifts: GiftAggregator::new(store.clone(), locks.clone(), prices.clone()),
            scheduler: Arc::new(DeliveryScheduler::new(
                config.scheduler.clone(),
                store.clone(),
                locks,
                relay,
                prices,
                clock.clone(),
            )),
            config,
            store,
            clock,
        }
    }
}

impl Default for CapsuleEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
