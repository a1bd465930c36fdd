mod common;

use chrono::Duration;
use common::*;
use newsletter_dispatch::error::LedgerError;
use newsletter_dispatch::ledger;
use newsletter_dispatch::model::{PayloadStatus, SendRequestId, UserId};
use newsletter_dispatch::schedule::ScheduleDefaults;
use sqlx::SqlitePool;

#[tokio::test]
async fn creation_is_idempotent() {
    let pool = setup_pool().await;
    let ids = users(&["alice", "bob"]);
    // Any instant of the day normalizes onto its UTC midnight.
    let first = ledger::get_or_create_send_requests_for_day(
        &pool,
        &ids,
        &es(),
        utc(2020, 12, 25, 13, 37),
        &ScheduleDefaults::default(),
    )
    .await
    .unwrap();
    let second = ledger::get_or_create_send_requests_for_day(
        &pool,
        &ids,
        &es(),
        utc(2020, 12, 25, 23, 59),
        &ScheduleDefaults::default(),
    )
    .await
    .unwrap();

    assert_eq!(first.len(), 2);
    let mut a: Vec<_> = first.iter().map(|r| r.id.clone()).collect();
    let mut b: Vec<_> = second.iter().map(|r| r.id.clone()).collect();
    a.sort();
    b.sort();
    assert_eq!(a, b);
    assert_eq!(count_rows(&pool).await, 2);

    for req in &first {
        assert_eq!(req.payload_status, PayloadStatus::NeedsPreload);
        assert_eq!(req.date_of_send.to_string(), "2020-12-25");
        assert_eq!(req.hour_to_send_utc.map(|h| h.value()), Some(11));
        assert_eq!(
            req.id,
            SendRequestId::derive(req.date_of_send, &req.user_id, &es())
        );
    }
}

#[tokio::test]
async fn send_time_follows_user_schedule() {
    let pool = setup_pool().await;
    set_schedule(&pool, "la", "America/Los_Angeles", 21).await;
    let rows = ledger::get_or_create_send_requests_for_day(
        &pool,
        &users(&["la"]),
        &es(),
        utc(2020, 12, 25, 0, 0),
        &ScheduleDefaults::default(),
    )
    .await
    .unwrap();
    assert_eq!(rows.len(), 1);
    // 21:00 on Christmas Eve in Los Angeles is 05:00 UTC on Christmas.
    assert_eq!(rows[0].send_at(), utc(2020, 12, 25, 5, 0));
}

#[tokio::test]
async fn unresolvable_user_is_skipped() {
    let pool = setup_pool().await;
    sqlx::query(
        "INSERT INTO user_newsletter_schedule \
         (user_id, language_code, iana_timezone, hour_of_day_index, quarter_hour_index, number_of_articles_per_email) \
         VALUES ('broken', 'es', 'Not/AZone', 9, 0, 8)",
    )
    .execute(&pool)
    .await
    .unwrap();

    let rows = ledger::get_or_create_send_requests_for_day(
        &pool,
        &users(&["broken", "fine"]),
        &es(),
        utc(2021, 3, 1, 0, 0),
        &ScheduleDefaults::default(),
    )
    .await
    .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].user_id, UserId::new("fine"));
}

#[tokio::test]
async fn deleted_rows_are_not_recreated() {
    let pool = setup_pool().await;
    let day = utc(2021, 3, 1, 0, 0);
    let rows = ledger::get_or_create_send_requests_for_day(
        &pool,
        &users(&["alice"]),
        &es(),
        day,
        &ScheduleDefaults::default(),
    )
    .await
    .unwrap();
    ledger::mark_deleted(&pool, &rows[0].id).await.unwrap();

    let again = ledger::get_or_create_send_requests_for_day(
        &pool,
        &users(&["alice"]),
        &es(),
        day,
        &ScheduleDefaults::default(),
    )
    .await
    .unwrap();
    assert!(again.is_empty());
    assert_eq!(count_rows(&pool).await, 1);
}

#[tokio::test]
async fn lifecycle_only_moves_forward() {
    let pool = setup_pool().await;
    let rows = ledger::get_or_create_send_requests_for_day(
        &pool,
        &users(&["alice"]),
        &es(),
        utc(2021, 3, 1, 0, 0),
        &ScheduleDefaults::default(),
    )
    .await
    .unwrap();
    let id = rows[0].id.clone();

    // Not ready yet.
    let err = ledger::mark_sent(&pool, &id).await.unwrap_err();
    assert!(matches!(
        err,
        LedgerError::StatusConflict { actual: PayloadStatus::NeedsPreload, .. }
    ));

    ledger::mark_preloaded(&pool, &id).await.unwrap();
    let err = ledger::mark_preloaded(&pool, &id).await.unwrap_err();
    assert!(err.is_conflict());
    assert!(ledger::mark_no_send_requested(&pool, &id).await.unwrap_err().is_conflict());
    // A rendered payload is only retired by the retention sweep.
    assert!(matches!(
        ledger::mark_deleted(&pool, &id).await,
        Err(LedgerError::StatusConflict { actual: PayloadStatus::PayloadReady, .. })
    ));

    ledger::mark_sent(&pool, &id).await.unwrap();
    assert!(ledger::mark_unverified_user(&pool, &id).await.unwrap_err().is_conflict());
    assert!(matches!(
        ledger::mark_deleted(&pool, &id).await,
        Err(LedgerError::StatusConflict { actual: PayloadStatus::Sent, .. })
    ));

    let stored = ledger::get_send_request(&pool, &id).await.unwrap();
    assert_eq!(stored.payload_status, PayloadStatus::Sent);
    assert_eq!(
        ledger::list_transitions(&pool, &id).await.unwrap(),
        vec![PayloadStatus::PayloadReady, PayloadStatus::Sent]
    );
}

#[tokio::test]
async fn skipped_day_can_be_retired() {
    let pool = setup_pool().await;
    let rows = ledger::get_or_create_send_requests_for_day(
        &pool,
        &users(&["alice"]),
        &es(),
        utc(2021, 3, 1, 0, 0),
        &ScheduleDefaults::default(),
    )
    .await
    .unwrap();
    let id = rows[0].id.clone();
    ledger::mark_no_send_requested(&pool, &id).await.unwrap();
    ledger::mark_deleted(&pool, &id).await.unwrap();
    assert!(ledger::mark_deleted(&pool, &id).await.unwrap_err().is_conflict());
    assert_eq!(
        ledger::get_send_request(&pool, &id).await.unwrap().payload_status,
        PayloadStatus::Deleted
    );
}

#[tokio::test]
async fn unknown_id_is_not_found() {
    let pool = setup_pool().await;
    let id = SendRequestId("missing".into());
    assert!(matches!(
        ledger::mark_preloaded(&pool, &id).await,
        Err(LedgerError::NotFound(_))
    ));
    assert!(matches!(
        ledger::get_send_request(&pool, &id).await,
        Err(LedgerError::NotFound(_))
    ));
}

async fn claimed_until(pool: &SqlitePool, id: &SendRequestId) -> Option<String> {
    sqlx::query_scalar("SELECT send_claimed_until FROM newsletter_send_requests WHERE _id = ?")
        .bind(id.as_str())
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn send_claim_is_exclusive_until_released_or_expired() {
    let pool = setup_pool().await;
    let rows = ledger::get_or_create_send_requests_for_day(
        &pool,
        &users(&["alice"]),
        &es(),
        utc(2021, 3, 1, 0, 0),
        &ScheduleDefaults::default(),
    )
    .await
    .unwrap();
    let id = rows[0].id.clone();
    let lease = Duration::minutes(15);
    let t0 = utc(2021, 3, 1, 11, 0);

    // Nothing to send before the payload exists.
    assert!(matches!(
        ledger::claim_for_send(&pool, &id, t0, lease).await,
        Err(LedgerError::StatusConflict { actual: PayloadStatus::NeedsPreload, .. })
    ));
    ledger::mark_preloaded(&pool, &id).await.unwrap();

    ledger::claim_for_send(&pool, &id, t0, lease).await.unwrap();
    assert!(matches!(
        ledger::claim_for_send(&pool, &id, t0 + Duration::minutes(5), lease).await,
        Err(LedgerError::AlreadyClaimed(_))
    ));
    // A lease left behind by a dead worker runs out.
    ledger::claim_for_send(&pool, &id, t0 + Duration::minutes(16), lease)
        .await
        .unwrap();

    ledger::release_send_claim(&pool, &id).await.unwrap();
    assert_eq!(claimed_until(&pool, &id).await, None);
    ledger::claim_for_send(&pool, &id, t0 + Duration::minutes(17), lease)
        .await
        .unwrap();
    assert_eq!(
        ledger::get_send_request(&pool, &id).await.unwrap().payload_status,
        PayloadStatus::PayloadReady
    );

    ledger::mark_sent(&pool, &id).await.unwrap();
    assert_eq!(claimed_until(&pool, &id).await, None);
    assert!(ledger::claim_for_send(&pool, &id, t0 + Duration::hours(1), lease)
        .await
        .unwrap_err()
        .is_conflict());
    assert!(matches!(
        ledger::claim_for_send(&pool, &SendRequestId("missing".into()), t0, lease).await,
        Err(LedgerError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_creators_converge_on_one_row_per_user() {
    let dir = tempfile::tempdir().unwrap();
    let pool = file_pool(dir.path()).await;
    let names: Vec<String> = (0..25).map(|i| format!("user{i:02}")).collect();
    let ids: Vec<UserId> = names.iter().map(|n| UserId::new(n.as_str())).collect();
    let day = utc(2021, 3, 1, 6, 0);

    let spawn_creator = move |pool: SqlitePool, ids: Vec<UserId>| {
        tokio::spawn(async move {
            ledger::ensure_send_requests_for_day(&pool, &ids, &es(), day, &ScheduleDefaults::default())
                .await
                .unwrap()
        })
    };
    let (a, b) = tokio::join!(
        spawn_creator(pool.clone(), ids.clone()),
        spawn_creator(pool.clone(), ids.clone())
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    let sorted_ids = |rows: &[newsletter_dispatch::model::SendRequest]| {
        let mut out: Vec<SendRequestId> = rows.iter().map(|r| r.id.clone()).collect();
        out.sort();
        out
    };
    assert_eq!(a.requests.len(), ids.len());
    assert_eq!(sorted_ids(&a.requests), sorted_ids(&b.requests));
    assert_eq!(count_rows(&pool).await, ids.len() as i64);
    assert_eq!(a.created + b.created, ids.len());
}

#[tokio::test]
async fn schedule_change_retimes_outstanding_requests() {
    let pool = setup_pool().await;
    let rows = ledger::get_or_create_send_requests_for_day(
        &pool,
        &users(&["alice", "bob"]),
        &es(),
        utc(2020, 12, 25, 0, 0),
        &ScheduleDefaults::default(),
    )
    .await
    .unwrap();
    let alice = rows.iter().find(|r| r.user_id.as_str() == "alice").unwrap().id.clone();
    let bob = rows.iter().find(|r| r.user_id.as_str() == "bob").unwrap().id.clone();
    ledger::mark_preloaded(&pool, &bob).await.unwrap();
    ledger::mark_sent(&pool, &bob).await.unwrap();

    // 09:00 in Madrid during winter is 08:00 UTC.
    set_schedule(&pool, "alice", "Europe/Madrid", 9).await;
    set_schedule(&pool, "bob", "Europe/Madrid", 9).await;

    let alice_row = ledger::get_send_request(&pool, &alice).await.unwrap();
    assert_eq!(alice_row.send_at(), utc(2020, 12, 25, 8, 0));
    // Already sent rows keep their time.
    let bob_row = ledger::get_send_request(&pool, &bob).await.unwrap();
    assert_eq!(bob_row.send_at(), utc(2020, 12, 25, 11, 0));

    let outstanding = ledger::list_outstanding_send_requests_for_user(&pool, &UserId::new("alice"), &es())
        .await
        .unwrap();
    assert_eq!(outstanding.len(), 1);
}
