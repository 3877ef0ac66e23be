//! Delivery scheduler.
//!
//! Each tick first replays the outbox, then evaluates every collecting
//! capsule. The winning evaluation commits `COLLECTING -> DELIVERED` and the
//! delivery snapshot in one conditional write, so a capsule is delivered at
//! most once however many ticks, eager evaluations or processes race.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::gifts::PriceList;
use crate::lifecycle::{evaluate, DeliveryDecision, DeliveryTrigger};
use crate::locks::CapsuleLocks;
use crate::outbox::{OutboxRelay, ReplayReport};
use crate::store::CapsuleStore;
use crate::types::{CapsuleId, CapsuleStatus, Progress};
use crate::{CapsuleError, Result};

/// What one evaluation of one capsule did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationOutcome {
    /// Guard not satisfied
    Held,
    /// This evaluation won the transition
    Delivered {
        trigger: DeliveryTrigger,
        /// Whether the notifier accepted the event right away
        dispatched: bool,
    },
    /// The capsule was already terminal
    AlreadyClosed,
    /// Another writer changed the capsule between read and commit
    LostRace,
}

/// Summary of one scheduler tick.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub replay: ReplayReport,
    pub evaluated: usize,
    pub delivered: Vec<CapsuleId>,
    /// Delivered but the notifier refused; left in the outbox
    pub undispatched: Vec<CapsuleId>,
    pub held: usize,
    pub lost_races: usize,
    /// Capsules whose evaluation failed; the tick continued without them
    pub failures: Vec<(CapsuleId, String)>,
}

impl TickReport {
    fn record(&mut self, capsule_id: CapsuleId, outcome: Result<EvaluationOutcome>) {
        self.evaluated += 1;
        match outcome {
            Ok(EvaluationOutcome::Held) => self.held += 1,
            Ok(EvaluationOutcome::Delivered { dispatched, .. }) => {
                if !dispatched {
                    self.undispatched.push(capsule_id.clone());
                }
                self.delivered.push(capsule_id);
            }
            Ok(EvaluationOutcome::AlreadyClosed) | Ok(EvaluationOutcome::LostRace) => self.lost_races += 1,
            Err(e) => self.failures.push((capsule_id, e.to_string())),
        }
    }
}

/// Evaluates capsules and commits deliveries.
pub struct DeliveryScheduler {
    config: SchedulerConfig,
    store: Arc<dyn CapsuleStore>,
    locks: Arc<CapsuleLocks>,
    relay: Arc<OutboxRelay>,
    prices: Arc<PriceList>,
    clock: Arc<dyn Clock>,
}

impl DeliveryScheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn CapsuleStore>,
        locks: Arc<CapsuleLocks>,
        relay: Arc<OutboxRelay>,
        prices: Arc<PriceList>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            locks,
            relay,
            prices,
            clock,
        }
    }

    /// Run one scheduler pass at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport {
            replay: self.relay.replay(now).await?,
            ..Default::default()
        };

        let open = self.store.capsules_with_status(CapsuleStatus::Collecting).await?;
        debug!(open = open.len(), "Evaluating collecting capsules");

        let outcomes: Vec<_> = stream::iter(open.into_iter().map(|capsule| async move {
            let outcome = self.evaluate_capsule(&capsule.id, now).await;
            (capsule.id, outcome)
        }))
        .buffer_unordered(self.config.max_concurrent.max(1))
        .collect()
        .await;

        for (capsule_id, outcome) in outcomes {
            if let Err(e) = &outcome {
                error!(capsule_id = %capsule_id, error = %e, "Capsule evaluation failed");
            }
            report.record(capsule_id, outcome);
        }
        self.locks.prune();

        if !report.delivered.is_empty() || report.replay.dispatched > 0 {
            info!(
                delivered = report.delivered.len(),
                replayed = report.replay.dispatched,
                held = report.held,
                "Scheduler tick complete"
            );
        }
        Ok(report)
    }

    /// Evaluate one capsule and deliver it if its guard holds.
    pub async fn evaluate_capsule(&self, capsule_id: &CapsuleId, now: DateTime<Utc>) -> Result<EvaluationOutcome> {
        let (entry, trigger) = {
            let _guard = self.locks.lock(capsule_id).await;

            let capsule = self
                .store
                .capsule(capsule_id)
                .await?
                .ok_or_else(|| CapsuleError::CapsuleNotFound(capsule_id.clone()))?;
            if !capsule.status.is_open() {
                return Ok(EvaluationOutcome::AlreadyClosed);
            }

            let progress = Progress {
                letters_collected: self.store.count_letters(capsule_id).await?,
                target_letter_count: capsule.target_letter_count,
            };
            let trigger = match evaluate(&capsule, progress, now) {
                DeliveryDecision::Hold => return Ok(EvaluationOutcome::Held),
                DeliveryDecision::Ready(trigger) => trigger,
            };

            match self
                .store
                .commit_delivery(capsule_id, capsule.version, now, self.relay.lease(), &self.prices)
                .await
            {
                Ok(entry) => (entry, trigger),
                Err(CapsuleError::ConcurrentModification(_)) | Err(CapsuleError::CapsuleClosed { .. }) => {
                    debug!(capsule_id = %capsule_id, "Lost delivery race");
                    return Ok(EvaluationOutcome::LostRace);
                }
                Err(e) => return Err(e),
            }
        };

        info!(
            capsule_id = %capsule_id,
            trigger = ?trigger,
            letters = entry.snapshot.letters.len(),
            recipients = entry.snapshot.recipients.len(),
            "Capsule delivered"
        );

        let dispatched = self.relay.dispatch(&entry, now).await?;
        Ok(EvaluationOutcome::Delivered { trigger, dispatched })
    }

    /// Tick every `interval` until `shutdown` resolves.
    pub async fn run<F>(&self, interval: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(interval_secs = interval.as_secs(), "Delivery scheduler started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Delivery scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.tick(self.clock.now()).await {
                        Ok(report) if !report.failures.is_empty() => {
                            warn!(failures = report.failures.len(), "Tick finished with failures");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Scheduler tick failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::OutboxConfig;
    use crate::events::MemorySink;
    use crate::store::MemoryStore;
    use crate::types::{Capsule, Recipient};
    use chrono::NaiveDate;

    fn scheduler(store: Arc<MemoryStore>, sink: Arc<MemorySink>) -> DeliveryScheduler {
        let relay = OutboxRelay::new(OutboxConfig::default(), store.clone(), sink);
        DeliveryScheduler::new(
            SchedulerConfig::default(),
            store,
            Arc::new(CapsuleLocks::new()),
            Arc::new(relay),
            Arc::new(PriceList::from_config(&Default::default())),
            Arc::new(ManualClock::new(Utc::now())),
        )
    }

    fn capsule(target_date: NaiveDate) -> Capsule {
        Capsule {
            id: CapsuleId::generate(),
            title: "Anniversary".to_string(),
            status: CapsuleStatus::Collecting,
            recipients: vec![Recipient::new("Sam", "FCI Dublin")],
            target_letter_count: 5,
            target_date,
            deliver_on_goal_reached: false,
            created_by: "ana".to_string(),
            created_at: Utc::now(),
            version: 0,
            closed_at: None,
        }
    }

    #[tokio::test]
    async fn test_tick_delivers_due_capsule_once() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::new());
        let scheduler = scheduler(store.clone(), sink.clone());

        let today = Utc::now().date_naive();
        let due = capsule(today);
        let later = capsule(today + chrono::Duration::days(30));
        store.insert_capsule(&due).await.unwrap();
        store.insert_capsule(&later).await.unwrap();

        let report = scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(report.delivered, vec![due.id.clone()]);
        assert_eq!(report.held, 1);

        let again = scheduler.tick(Utc::now()).await.unwrap();
        assert!(again.delivered.is_empty());
        assert_eq!(sink.deliveries(&due.id).await.len(), 1);
        assert_eq!(
            store.capsule(&later.id).await.unwrap().unwrap().status,
            CapsuleStatus::Collecting
        );
    }

    #[tokio::test]
    async fn test_evaluate_closed_capsule() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(store.clone(), Arc::new(MemorySink::new()));
        let c = capsule(Utc::now().date_naive());
        store.insert_capsule(&c).await.unwrap();
        store.cancel(&c.id, 0, Utc::now()).await.unwrap();

        let outcome = scheduler.evaluate_capsule(&c.id, Utc::now()).await.unwrap();
        assert_eq!(outcome, EvaluationOutcome::AlreadyClosed);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(store, Arc::new(MemorySink::new()));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let handle = async {
            scheduler
                .run(Duration::from_millis(10), async {
                    let _ = rx.await;
                })
                .await
        };
        let stop = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = tx.send(());
        };

        let finished = tokio::time::timeout(Duration::from_secs(2), async { tokio::join!(handle, stop) }).await;
        assert!(finished.is_ok());
    }
}
