//! SQLite store integration tests
//!
//! The engine over a file-backed SQLite store must behave like the in-memory
//! one:
//! - Admission uniqueness enforced by the database
//! - Exactly-once delivery with the snapshot committed alongside the status
//! - Outbox leases surviving a reopen

use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use futures::future::join_all;
use tempfile::TempDir;
use time_capsule::events::MemorySink;
use time_capsule::gifts::PriceList;
use time_capsule::outbox::OutboxState;
use time_capsule::{
    Admission, CapsuleEngine, CapsuleError, CapsuleStatus, CapsuleStore, NewCapsule, Recipient,
    SkuId, SqliteStore,
};

fn engine_at(dir: &TempDir, sink: Arc<MemorySink>) -> CapsuleEngine {
    let store = Arc::new(SqliteStore::open(dir.path()).unwrap());
    CapsuleEngine::builder().store(store).sink(sink).build()
}

fn request(target: u32, target_date: NaiveDate, early: bool) -> NewCapsule {
    NewCapsule::new(
        "Holiday letters",
        Recipient::new("Jo", "SCI Muncy"),
        target,
        target_date,
        "organizer@example.com",
    )
    .with_recipient(Recipient::new("Kai", "SCI Muncy"))
    .deliver_on_goal(early)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_concurrent_redeem() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(engine_at(&dir, Arc::new(MemorySink::new())));
    let capsule = engine
        .create_capsule(request(2, NaiveDate::from_ymd_opt(2099, 1, 1).unwrap(), false))
        .await
        .unwrap();
    let invite = engine.issue_invite(&capsule.id, None, None).await.unwrap();

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let engine = engine.clone();
            let code = invite.code.clone();
            tokio::spawn(async move {
                engine
                    .redeem(&code, &Admission::new("dee@example.com", "Dee", "aunt"))
                    .await
                    .unwrap()
                    .id
            })
        })
        .collect();
    let ids: Vec<_> = join_all(handles).await.into_iter().map(|h| h.unwrap()).collect();

    assert!(ids.iter().all(|id| id == &ids[0]));
    assert_eq!(engine.contributors(&capsule.id).await.unwrap().len(), 1);
    let stored = engine.store().invite(&invite.code).await.unwrap().unwrap();
    assert_eq!(stored.uses, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_exactly_once_delivery() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(MemorySink::new());
    let engine = Arc::new(engine_at(&dir, sink.clone()));
    let capsule = engine
        .create_capsule(request(3, NaiveDate::from_ymd_opt(2099, 1, 1).unwrap(), true))
        .await
        .unwrap();
    let invite = engine.issue_invite(&capsule.id, None, None).await.unwrap();

    let mut people = Vec::new();
    for i in 0..6 {
        let admission = Admission::new(format!("p{}", i), format!("P{}", i), "friend");
        people.push(engine.redeem(&invite.code, &admission).await.unwrap());
    }
    engine.add_gift(&capsule.id, &SkuId::new("photo-print"), 4).await.unwrap();

    let mut handles = Vec::new();
    for person in people {
        let engine = engine.clone();
        let capsule_id = capsule.id.clone();
        handles.push(tokio::spawn(async move {
            let _ = engine.submit_letter(&capsule_id, &person.id, "hello from outside").await;
        }));
    }
    for _ in 0..3 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.tick_now().await.unwrap();
        }));
    }
    for h in join_all(handles).await {
        h.unwrap();
    }

    let delivered = engine.capsule(&capsule.id).await.unwrap();
    assert_eq!(delivered.status, CapsuleStatus::Delivered);
    assert_eq!(delivered.version, 1);

    let deliveries = sink.deliveries(&capsule.id).await;
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].recipients.len(), 2);
    assert_eq!(deliveries[0].gift_total.total_price_cents, 4 * 99);
    assert_eq!(deliveries[0].letters.len(), engine.letters(&capsule.id).await.unwrap().len());
}

#[tokio::test]
async fn test_sqlite_closed_rejects_and_persists() {
    let dir = TempDir::new().unwrap();
    let capsule_id = {
        let engine = engine_at(&dir, Arc::new(MemorySink::new()));
        let capsule = engine
            .create_capsule(request(5, NaiveDate::from_ymd_opt(2099, 1, 1).unwrap(), false))
            .await
            .unwrap();
        engine.add_gift(&capsule.id, &SkuId::new("stamp-book"), 2).await.unwrap();
        engine.add_gift(&capsule.id, &SkuId::new("stamp-book"), 3).await.unwrap();
        engine.cancel(&capsule.id).await.unwrap();
        capsule.id
    };

    let engine = engine_at(&dir, Arc::new(MemorySink::new()));
    let capsule = engine.capsule(&capsule_id).await.unwrap();
    assert_eq!(capsule.status, CapsuleStatus::Cancelled);
    assert_eq!(engine.total(&capsule_id).await.unwrap().line_items[0].quantity, 5);

    let err = engine
        .add_gift(&capsule_id, &SkuId::new("stamp-book"), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, CapsuleError::CapsuleClosed { .. }));
    assert!(engine.tick_now().await.unwrap().delivered.is_empty());
}

#[tokio::test]
async fn test_sqlite_outbox_lease() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(dir.path()).unwrap();
    let engine = CapsuleEngine::builder()
        .store(Arc::new(SqliteStore::open(dir.path()).unwrap()))
        .build();
    let capsule = engine
        .create_capsule(request(1, NaiveDate::from_ymd_opt(2099, 1, 1).unwrap(), false))
        .await
        .unwrap();

    // A writer that commits and then dies before dispatching.
    let now = Utc::now();
    let prices = PriceList::from_config(&Default::default());
    let entry = store
        .commit_delivery(&capsule.id, 0, now, Duration::seconds(30), &prices)
        .await
        .unwrap();
    assert!(matches!(entry.state, OutboxState::Claimed { .. }));

    assert!(store
        .claim_outbox(now + Duration::seconds(10), now + Duration::seconds(40), 10)
        .await
        .unwrap()
        .is_empty());

    let report = engine.tick(now + Duration::seconds(31)).await.unwrap();
    assert_eq!(report.replay.dispatched, 1);

    let entry = store.outbox_for(&capsule.id).await.unwrap().unwrap();
    assert!(entry.is_dispatched());
    assert!(store.pending_outbox().await.unwrap().is_empty());
}
