//! Capsule engine integration tests
//!
//! Exercises the engine end to end on the in-memory store:
//! - Idempotent admission and letter submission under concurrency
//! - Exactly-once delivery racing submissions, ticks and cancellation
//! - Gift additivity and closed-capsule rejection
//! - Outbox replay after a notifier outage

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use futures::future::join_all;
use time_capsule::clock::ManualClock;
use time_capsule::config::GiftSku;
use time_capsule::events::{CapsuleEvent, EventSink, MemorySink, NotifyError};
use time_capsule::{
    Admission, Capsule, CapsuleEngine, CapsuleError, CapsuleStatus, Contributor, EngineConfig,
    MemoryStore, NewCapsule, Recipient, SkuId,
};

// =============================================================================
// Helpers
// =============================================================================

fn far_future() -> NaiveDate {
    NaiveDate::from_ymd_opt(2099, 12, 31).unwrap()
}

fn request(target: u32, target_date: NaiveDate, early: bool) -> NewCapsule {
    NewCapsule::new(
        "Welcome home",
        Recipient::new("Sam Rivera", "FCI Dublin").with_inmate_number("12345-678"),
        target,
        target_date,
        "organizer@example.com",
    )
    .deliver_on_goal(early)
}

async fn join(engine: &CapsuleEngine, capsule: &Capsule, n: usize) -> Vec<Contributor> {
    let invite = engine.issue_invite(&capsule.id, None, None).await.unwrap();
    let mut contributors = Vec::with_capacity(n);
    for i in 0..n {
        let admission = Admission::new(format!("person{}@example.com", i), format!("Person {}", i), "friend");
        contributors.push(engine.redeem(&invite.code, &admission).await.unwrap());
    }
    contributors
}

/// Sink that refuses the first `failures` publishes.
struct FlakySink {
    remaining_failures: AtomicUsize,
    inner: MemorySink,
}

impl FlakySink {
    fn new(failures: usize) -> Self {
        Self {
            remaining_failures: AtomicUsize::new(failures),
            inner: MemorySink::new(),
        }
    }
}

#[async_trait::async_trait]
impl EventSink for FlakySink {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn publish(&self, event: &CapsuleEvent) -> Result<(), NotifyError> {
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(NotifyError::Unavailable("mail gateway down".to_string()));
        }
        self.inner.publish(event).await
    }
}

// =============================================================================
// Admission
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_redeem_same_identity() {
    let sink = Arc::new(MemorySink::new());
    let engine = Arc::new(CapsuleEngine::builder().sink(sink.clone()).build());
    let capsule = engine.create_capsule(request(2, far_future(), false)).await.unwrap();
    let invite = engine.issue_invite(&capsule.id, Some(1), None).await.unwrap();

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let engine = engine.clone();
            let code = invite.code.clone();
            tokio::spawn(async move {
                engine
                    .redeem(&code, &Admission::new("+15550100", "Ana", "sister"))
                    .await
            })
        })
        .collect();

    let ids: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|h| h.unwrap().unwrap().id)
        .collect();

    assert!(ids.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(engine.contributors(&capsule.id).await.unwrap().len(), 1);

    let joins = sink
        .events()
        .await
        .into_iter()
        .filter(|e| matches!(e, CapsuleEvent::ContributorJoined { .. }))
        .count();
    assert_eq!(joins, 1);
}

// =============================================================================
// Letters and progress
// =============================================================================

#[tokio::test]
async fn test_resubmission_keeps_progress() {
    let engine = CapsuleEngine::new();
    let capsule = engine.create_capsule(request(3, far_future(), false)).await.unwrap();
    let people = join(&engine, &capsule, 2).await;

    engine.submit_letter(&capsule.id, &people[0].id, "Hi").await.unwrap();
    let before = engine.progress(&capsule.id).await.unwrap();
    engine.submit_letter(&capsule.id, &people[0].id, "Hi, rewritten").await.unwrap();
    let after = engine.progress(&capsule.id).await.unwrap();

    assert_eq!(before, after);
    assert_eq!(after.letters_collected, 1);
    assert_eq!(engine.letters(&capsule.id).await.unwrap()[0].body, "Hi, rewritten");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_progress_monotonic_and_bounded() {
    let engine = Arc::new(CapsuleEngine::new());
    let capsule = engine.create_capsule(request(50, far_future(), false)).await.unwrap();
    let people = join(&engine, &capsule, 8).await;

    let handles: Vec<_> = people
        .iter()
        .flat_map(|p| (0..3).map(move |round| (p.id.clone(), round)))
        .map(|(who, round)| {
            let engine = engine.clone();
            let capsule_id = capsule.id.clone();
            tokio::spawn(async move {
                engine
                    .submit_letter(&capsule_id, &who, &format!("draft {}", round))
                    .await
                    .unwrap();
                engine.progress(&capsule_id).await.unwrap().letters_collected
            })
        })
        .collect();

    let mut last_seen = 0;
    for h in join_all(handles).await {
        let seen = h.unwrap();
        assert!(seen <= people.len() as u32);
        last_seen = last_seen.max(seen);
    }

    let progress = engine.progress(&capsule.id).await.unwrap();
    assert_eq!(progress.letters_collected, 8);
    assert!(progress.letters_collected >= last_seen);
}

// =============================================================================
// Delivery
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_once_delivery_under_contention() {
    let sink = Arc::new(MemorySink::new());
    let engine = Arc::new(CapsuleEngine::builder().sink(sink.clone()).build());
    let capsule = engine.create_capsule(request(3, far_future(), true)).await.unwrap();
    let people = join(&engine, &capsule, 10).await;

    let mut handles = Vec::new();
    for person in &people {
        let engine = engine.clone();
        let capsule_id = capsule.id.clone();
        let who = person.id.clone();
        handles.push(tokio::spawn(async move {
            // Late submissions lose to the delivery and are rejected.
            let _ = engine.submit_letter(&capsule_id, &who, "thinking of you").await;
        }));
    }
    for _ in 0..5 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.tick_now().await.unwrap();
        }));
    }
    for h in join_all(handles).await {
        h.unwrap();
    }
    engine.tick_now().await.unwrap();

    assert_eq!(engine.capsule(&capsule.id).await.unwrap().status, CapsuleStatus::Delivered);
    let deliveries = sink.deliveries(&capsule.id).await;
    assert_eq!(deliveries.len(), 1);
    assert!(deliveries[0].letters.len() >= 3);
}

#[tokio::test]
async fn test_scenario_goal_reached_then_closed() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let sink = Arc::new(MemorySink::new());
    let engine = CapsuleEngine::builder()
        .clock(clock.clone())
        .sink(sink.clone())
        .eager_on_submit(false)
        .build();

    let tomorrow = (Utc::now() + Duration::days(1)).date_naive();
    let capsule = engine.create_capsule(request(2, tomorrow, true)).await.unwrap();
    let people = join(&engine, &capsule, 3).await;

    engine.submit_letter(&capsule.id, &people[0].id, "From A").await.unwrap();
    let progress = engine.progress(&capsule.id).await.unwrap();
    assert_eq!((progress.letters_collected, progress.target_letter_count), (1, 2));
    assert_eq!(engine.capsule(&capsule.id).await.unwrap().status, CapsuleStatus::Collecting);

    engine.submit_letter(&capsule.id, &people[1].id, "From B").await.unwrap();
    let progress = engine.progress(&capsule.id).await.unwrap();
    assert_eq!((progress.letters_collected, progress.target_letter_count), (2, 2));

    let report = engine.tick_now().await.unwrap();
    assert_eq!(report.delivered, vec![capsule.id.clone()]);
    assert_eq!(engine.capsule(&capsule.id).await.unwrap().status, CapsuleStatus::Delivered);

    let err = engine
        .submit_letter(&capsule.id, &people[2].id, "From C")
        .await
        .unwrap_err();
    assert!(matches!(err, CapsuleError::CapsuleClosed { .. }));
    assert_eq!(sink.deliveries(&capsule.id).await.len(), 1);
}

#[tokio::test]
async fn test_target_date_delivers_without_goal() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let sink = Arc::new(MemorySink::new());
    let engine = CapsuleEngine::builder().clock(clock.clone()).sink(sink.clone()).build();

    let in_three_days = (Utc::now() + Duration::days(3)).date_naive();
    let capsule = engine.create_capsule(request(10, in_three_days, false)).await.unwrap();
    let people = join(&engine, &capsule, 1).await;
    engine.submit_letter(&capsule.id, &people[0].id, "Only me").await.unwrap();

    assert!(engine.tick_now().await.unwrap().delivered.is_empty());

    clock.advance(Duration::days(3));
    let report = engine.tick_now().await.unwrap();
    assert_eq!(report.delivered.len(), 1);

    let delivered = &sink.deliveries(&capsule.id).await[0];
    assert_eq!(delivered.letters.len(), 1);
    assert_eq!(delivered.recipients[0].inmate_number.as_deref(), Some("12345-678"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_and_tick_have_one_winner() {
    for _ in 0..25 {
        let sink = Arc::new(MemorySink::new());
        let engine = Arc::new(CapsuleEngine::builder().sink(sink.clone()).build());
        let today = Utc::now().date_naive();
        let capsule = engine.create_capsule(request(1, today, false)).await.unwrap();

        let cancel = {
            let engine = engine.clone();
            let id = capsule.id.clone();
            tokio::spawn(async move { engine.cancel(&id).await })
        };
        let tick = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.tick_now().await })
        };
        let cancelled = cancel.await.unwrap();
        tick.await.unwrap().unwrap();

        let status = engine.capsule(&capsule.id).await.unwrap().status;
        let deliveries = sink.deliveries(&capsule.id).await.len();
        match cancelled {
            Ok(_) => {
                assert_eq!(status, CapsuleStatus::Cancelled);
                assert_eq!(deliveries, 0);
            }
            Err(CapsuleError::CapsuleClosed { status: closed, .. }) => {
                assert_eq!(closed, CapsuleStatus::Delivered);
                assert_eq!(status, CapsuleStatus::Delivered);
                assert_eq!(deliveries, 1);
            }
            Err(e) => panic!("unexpected cancel error: {}", e),
        }
    }
}

#[tokio::test]
async fn test_failed_notification_is_replayed_once() {
    let sink = Arc::new(FlakySink::new(1));
    let engine = CapsuleEngine::builder().sink(sink.clone()).build();
    let capsule = engine
        .create_capsule(request(1, Utc::now().date_naive(), false))
        .await
        .unwrap();
    engine.add_gift(&capsule.id, &SkuId::new("stamp-book"), 2).await.unwrap();

    let first = engine.tick_now().await.unwrap();
    assert_eq!(first.delivered, vec![capsule.id.clone()]);
    assert_eq!(first.undispatched, vec![capsule.id.clone()]);
    assert_eq!(engine.capsule(&capsule.id).await.unwrap().status, CapsuleStatus::Delivered);

    let pending = engine.pending_outbox().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0].last_error.is_some());
    assert_eq!(pending[0].snapshot.gift_total.total_price_cents, 2 * 1460);
    assert!(sink.inner.deliveries(&capsule.id).await.is_empty());

    let second = engine.tick_now().await.unwrap();
    assert_eq!(second.replay.dispatched, 1);
    assert!(second.delivered.is_empty());

    let third = engine.tick_now().await.unwrap();
    assert_eq!(third.replay.dispatched, 0);
    let delivered = sink.inner.deliveries(&capsule.id).await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].gift_total.total_price_cents, 2920);
    assert_eq!(delivered[0].gift_total.line_items[0].quantity, 2);
    assert!(engine.pending_outbox().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_replay_keeps_total_priced_at_delivery() {
    let store = Arc::new(MemoryStore::new());
    let stamps = SkuId::new("stamp-book");

    let outage = Arc::new(FlakySink::new(1));
    let before = CapsuleEngine::builder()
        .store(store.clone())
        .sink(outage.clone())
        .build();
    let capsule = before
        .create_capsule(request(1, Utc::now().date_naive(), false))
        .await
        .unwrap();
    before.add_gift(&capsule.id, &stamps, 2).await.unwrap();
    let first = before.tick_now().await.unwrap();
    assert_eq!(first.undispatched, vec![capsule.id.clone()]);

    // A restarted node with a new price list picks up the entry.
    let mut repriced = EngineConfig::default();
    repriced.gifts.skus.retain(|sku| sku.id != stamps);
    repriced.gifts.skus.push(GiftSku::new("stamp-book", "Book of stamps", 9999));
    let sink = Arc::new(MemorySink::new());
    let after = CapsuleEngine::builder()
        .config(repriced)
        .store(store)
        .sink(sink.clone())
        .build();
    assert_eq!(after.total(&capsule.id).await.unwrap().total_price_cents, 2 * 9999);

    let replayed = after.tick_now().await.unwrap();
    assert_eq!(replayed.replay.dispatched, 1);

    let delivered = sink.deliveries(&capsule.id).await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].gift_total.total_price_cents, 2920);
    assert_eq!(delivered[0].gift_total.line_items[0].unit_price_cents, 1460);
}

// =============================================================================
// Gifts
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_gift_additivity() {
    let engine = Arc::new(CapsuleEngine::new());
    let capsule = engine.create_capsule(request(2, far_future(), false)).await.unwrap();
    let stamps = SkuId::new("stamp-book");

    let handles: Vec<_> = [2u32, 3]
        .into_iter()
        .map(|quantity| {
            let engine = engine.clone();
            let capsule_id = capsule.id.clone();
            let sku = stamps.clone();
            tokio::spawn(async move { engine.add_gift(&capsule_id, &sku, quantity).await })
        })
        .collect();
    for h in join_all(handles).await {
        h.unwrap().unwrap();
    }

    let total = engine.total(&capsule.id).await.unwrap();
    assert_eq!(total.line_items.len(), 1);
    assert_eq!(total.line_items[0].quantity, 5);
    assert_eq!(total.total_price_cents, 5 * 1460);
}

#[tokio::test]
async fn test_remove_gift_clamps_and_reports() {
    let engine = CapsuleEngine::new();
    let capsule = engine.create_capsule(request(2, far_future(), false)).await.unwrap();
    let cards = SkuId::new("greeting-card");

    engine.add_gift(&capsule.id, &cards, 2).await.unwrap();
    let err = engine.remove_gift(&capsule.id, &cards, 5).await.unwrap_err();
    assert!(matches!(err, CapsuleError::InvalidQuantity(_)));

    let total = engine.total(&capsule.id).await.unwrap();
    assert!(total.line_items.is_empty());
    assert_eq!(total.total_price_cents, 0);

    let err = engine
        .add_gift(&capsule.id, &SkuId::new("cigarettes"), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, CapsuleError::UnknownSku(_)));
}

// =============================================================================
// Closed capsules
// =============================================================================

#[tokio::test]
async fn test_delivered_capsule_rejects_mutation() {
    let engine = CapsuleEngine::new();
    let capsule = engine.create_capsule(request(1, far_future(), true)).await.unwrap();
    let invite = engine.issue_invite(&capsule.id, None, None).await.unwrap();
    let ana = engine
        .redeem(&invite.code, &Admission::new("ana@example.com", "Ana", "sister"))
        .await
        .unwrap();
    let ben = engine
        .redeem(&invite.code, &Admission::new("ben@example.com", "Ben", "cousin"))
        .await
        .unwrap();
    engine.add_gift(&capsule.id, &SkuId::new("paperback"), 1).await.unwrap();
    engine.submit_letter(&capsule.id, &ana.id, "Delivered on my letter").await.unwrap();
    assert_eq!(engine.capsule(&capsule.id).await.unwrap().status, CapsuleStatus::Delivered);

    let letters_before = engine.letters(&capsule.id).await.unwrap();
    let total_before = engine.total(&capsule.id).await.unwrap();

    let submit = engine.submit_letter(&capsule.id, &ben.id, "Too late").await;
    let gift = engine.add_gift(&capsule.id, &SkuId::new("paperback"), 1).await;
    let redeem = engine
        .redeem(&invite.code, &Admission::new("cam@example.com", "Cam", "friend"))
        .await;
    let reissue = engine.issue_invite(&capsule.id, None, None).await;
    let cancel = engine.cancel(&capsule.id).await;

    assert!(matches!(submit, Err(CapsuleError::CapsuleClosed { .. })));
    assert!(matches!(gift, Err(CapsuleError::CapsuleClosed { .. })));
    assert!(matches!(redeem, Err(CapsuleError::CapsuleClosed { .. })));
    assert!(matches!(reissue, Err(CapsuleError::CapsuleNotOpen { .. })));
    assert!(matches!(cancel, Err(CapsuleError::CapsuleClosed { .. })));

    assert_eq!(engine.letters(&capsule.id).await.unwrap(), letters_before);
    assert_eq!(engine.total(&capsule.id).await.unwrap(), total_before);
    assert_eq!(engine.contributors(&capsule.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_closed_capsule_reported_before_bad_input() {
    let engine = CapsuleEngine::new();
    let capsule = engine.create_capsule(request(1, far_future(), true)).await.unwrap();
    let who = join(&engine, &capsule, 2).await;
    engine.submit_letter(&capsule.id, &who[0].id, "See you soon").await.unwrap();
    assert_eq!(engine.capsule(&capsule.id).await.unwrap().status, CapsuleStatus::Delivered);

    let blank = tokio_test::assert_err!(engine.submit_letter(&capsule.id, &who[1].id, " ").await);
    let zero = tokio_test::assert_err!(engine.add_gift(&capsule.id, &SkuId::new("stamp-book"), 0).await);
    let unknown = tokio_test::assert_err!(engine.add_gift(&capsule.id, &SkuId::new("nope"), 1).await);
    let remove_zero =
        tokio_test::assert_err!(engine.remove_gift(&capsule.id, &SkuId::new("stamp-book"), 0).await);

    for err in [blank, zero, unknown, remove_zero] {
        assert!(
            matches!(
                err,
                CapsuleError::CapsuleClosed {
                    status: CapsuleStatus::Delivered,
                    ..
                }
            ),
            "expected CapsuleClosed, got {:?}",
            err
        );
    }
}

#[tokio::test]
async fn test_gift_quantity_overflow_rejected() {
    let engine = CapsuleEngine::new();
    let capsule = engine.create_capsule(request(2, far_future(), false)).await.unwrap();
    let prints = SkuId::new("photo-print");

    engine.add_gift(&capsule.id, &prints, u32::MAX).await.unwrap();
    let err = engine.add_gift(&capsule.id, &prints, 1).await.unwrap_err();
    assert!(matches!(err, CapsuleError::InvalidQuantity(_)));

    let selections = engine.gift_selections(&capsule.id).await.unwrap();
    assert_eq!(selections[0].quantity, u32::MAX);
}

#[tokio::test]
async fn test_unknown_capsule() {
    let engine = CapsuleEngine::new();
    let missing = time_capsule::CapsuleId::new("missing");

    assert!(matches!(
        engine.progress(&missing).await,
        Err(CapsuleError::CapsuleNotFound(_))
    ));
    assert!(matches!(
        engine.total(&missing).await,
        Err(CapsuleError::CapsuleNotFound(_))
    ));
    assert_eq!(
        engine.capsule(&missing).await.unwrap_err().kind(),
        time_capsule::ErrorKind::CapsuleNotFound
    );
}
