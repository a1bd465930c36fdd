//! Durable send-request ledger: one row per user, language and UTC day.
//!
//! Creation is idempotent through the deterministic id. Every status change is
//! a conditional update that only succeeds from the expected source states, so
//! concurrent writers cannot move a row backwards or apply a step twice.
use crate::db::{self, Pool};
use crate::error::LedgerError;
use crate::model::{
    HourIndex, LanguageCode, PayloadStatus, QuarterHourIndex, SendRequest, SendRequestId, UserId,
};
use crate::schedule::{get_user_newsletter_schedule, ScheduleDefaults};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use sqlx::SqliteConnection;
use std::collections::HashSet;
use tracing::{debug, error, info, instrument, warn};

const NON_DELETED: [PayloadStatus; 5] = [
    PayloadStatus::NeedsPreload,
    PayloadStatus::NoSendRequested,
    PayloadStatus::PayloadReady,
    PayloadStatus::UnverifiedUser,
    PayloadStatus::Sent,
];

fn utc_midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

/// Rows for one day and language, and how many of them this call inserted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DayRequests {
    pub requests: Vec<SendRequest>,
    pub created: usize,
}

/// Return the non-deleted send request of every user in `user_ids` for the UTC
/// day containing `day`, creating `needs-preload` rows where none exist.
///
/// A user whose schedule cannot be resolved is logged and left out. Rows that
/// were already swept to `deleted` are never recreated.
pub async fn get_or_create_send_requests_for_day(
    pool: &Pool,
    user_ids: &[UserId],
    language_code: &LanguageCode,
    day: DateTime<Utc>,
    defaults: &ScheduleDefaults,
) -> Result<Vec<SendRequest>, LedgerError> {
    Ok(ensure_send_requests_for_day(pool, user_ids, language_code, day, defaults)
        .await?
        .requests)
}

/// Same as [`get_or_create_send_requests_for_day`], also reporting how many
/// rows were inserted. Concurrent callers converge on the same rows and each
/// insert is counted by exactly one of them.
#[instrument(skip_all, fields(language = %language_code, users = user_ids.len()))]
pub async fn ensure_send_requests_for_day(
    pool: &Pool,
    user_ids: &[UserId],
    language_code: &LanguageCode,
    day: DateTime<Utc>,
    defaults: &ScheduleDefaults,
) -> Result<DayRequests, LedgerError> {
    let date_of_send = day.date_naive();
    let anchor = utc_midnight(date_of_send);

    let mut requests =
        db::send_requests::list_active_for_day(pool, date_of_send, language_code, user_ids).await?;
    let existing: HashSet<UserId> = requests.iter().map(|r| r.user_id.clone()).collect();

    let mut created = 0usize;
    for user_id in user_ids.iter().filter(|u| !existing.contains(*u)) {
        match create_for_user(pool, user_id, language_code, date_of_send, anchor, defaults).await {
            Ok(Some((req, inserted))) => {
                if inserted {
                    created += 1;
                }
                requests.push(req);
            }
            Ok(None) => debug!(user_id = %user_id, "send request already retired for day"),
            Err(err) => error!(user_id = %user_id, ?err, "failed to create send request; skipping user"),
        }
    }
    info!(date = %date_of_send, total = requests.len(), created, "send requests ready for day");
    Ok(DayRequests { requests, created })
}

async fn create_for_user(
    pool: &Pool,
    user_id: &UserId,
    language_code: &LanguageCode,
    date_of_send: NaiveDate,
    anchor: DateTime<Utc>,
    defaults: &ScheduleDefaults,
) -> Result<Option<(SendRequest, bool)>, LedgerError> {
    let schedule = get_user_newsletter_schedule(pool, user_id, language_code, anchor, defaults).await?;
    let send_at = schedule.send_time_local().with_timezone(&Utc);
    let candidate = SendRequest {
        id: SendRequestId::derive(date_of_send, user_id, language_code),
        user_id: user_id.clone(),
        language_code: language_code.clone(),
        date_of_send,
        hour_to_send_utc: Some(HourIndex(send_at.hour() as u8)),
        quarter_hour_to_send_utc: Some(QuarterHourIndex::from_minute(send_at.minute())),
        payload_status: PayloadStatus::NeedsPreload,
    };
    let inserted = db::send_requests::insert_if_absent(pool, &candidate).await?;
    // Re-read so racing creators all see the same row.
    let stored = db::send_requests::get(pool, &candidate.id)
        .await?
        .ok_or_else(|| LedgerError::NotFound(candidate.id.clone()))?;
    if stored.payload_status == PayloadStatus::Deleted {
        return Ok(None);
    }
    Ok(Some((stored, inserted)))
}

async fn transition_on(
    conn: &mut SqliteConnection,
    id: &SendRequestId,
    from: &[PayloadStatus],
    to: PayloadStatus,
) -> Result<(), LedgerError> {
    let changed = db::send_requests::transition_status(&mut *conn, id, from, to).await?;
    if changed == 0 {
        return match db::send_requests::current_status(&mut *conn, id).await? {
            None => Err(LedgerError::NotFound(id.clone())),
            Some(actual) => {
                warn!(id = %id, %actual, target = %to, "send request status conflict");
                Err(LedgerError::StatusConflict {
                    id: id.clone(),
                    expected: from.to_vec(),
                    actual,
                })
            }
        };
    }
    db::send_requests::record_transition(&mut *conn, id, to).await?;
    debug!(id = %id, status = %to, "send request transitioned");
    Ok(())
}

async fn transition(
    pool: &Pool,
    id: &SendRequestId,
    from: &[PayloadStatus],
    to: PayloadStatus,
) -> Result<(), LedgerError> {
    let mut tx = pool.begin().await?;
    transition_on(&mut tx, id, from, to).await?;
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all, fields(id = %id))]
pub async fn mark_preloaded(pool: &Pool, id: &SendRequestId) -> Result<(), LedgerError> {
    transition(pool, id, &[PayloadStatus::NeedsPreload], PayloadStatus::PayloadReady).await
}

#[instrument(skip_all, fields(id = %id))]
pub async fn mark_sent(pool: &Pool, id: &SendRequestId) -> Result<(), LedgerError> {
    transition(pool, id, &[PayloadStatus::PayloadReady], PayloadStatus::Sent).await
}

/// Lease a `payload-ready` row to the calling worker until `now + lease`.
///
/// The lease commits on its own, so no write transaction is held while the
/// email goes out. The row stays `payload-ready` until [`mark_sent`]; a worker
/// that dies mid-send leaves a lease that simply expires.
#[instrument(skip_all, fields(id = %id))]
pub async fn claim_for_send(
    pool: &Pool,
    id: &SendRequestId,
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<(), LedgerError> {
    let mut conn = pool.acquire().await?;
    if db::send_requests::claim_for_send(&mut conn, id, now, now + lease).await? == 1 {
        debug!(id = %id, "send claimed");
        return Ok(());
    }
    match db::send_requests::current_status(&mut conn, id).await? {
        None => Err(LedgerError::NotFound(id.clone())),
        Some(PayloadStatus::PayloadReady) => Err(LedgerError::AlreadyClaimed(id.clone())),
        Some(actual) => {
            warn!(id = %id, %actual, "send request no longer ready to send");
            Err(LedgerError::StatusConflict {
                id: id.clone(),
                expected: vec![PayloadStatus::PayloadReady],
                actual,
            })
        }
    }
}

/// Drop a send lease after a failed delivery so the row can be retried.
#[instrument(skip_all, fields(id = %id))]
pub async fn release_send_claim(pool: &Pool, id: &SendRequestId) -> Result<(), LedgerError> {
    let mut conn = pool.acquire().await?;
    db::send_requests::release_claim(&mut conn, id).await?;
    Ok(())
}

#[instrument(skip_all, fields(id = %id))]
pub async fn mark_no_send_requested(pool: &Pool, id: &SendRequestId) -> Result<(), LedgerError> {
    transition(pool, id, &[PayloadStatus::NeedsPreload], PayloadStatus::NoSendRequested).await
}

#[instrument(skip_all, fields(id = %id))]
pub async fn mark_unverified_user(pool: &Pool, id: &SendRequestId) -> Result<(), LedgerError> {
    transition(
        pool,
        id,
        &[PayloadStatus::NeedsPreload, PayloadStatus::PayloadReady],
        PayloadStatus::UnverifiedUser,
    )
    .await
}

/// Retire a row that will never be sent: one that is `needs-preload` or
/// `no-send-requested`. Rows further along are only retired by the sweeper.
#[instrument(skip_all, fields(id = %id))]
pub async fn mark_deleted(pool: &Pool, id: &SendRequestId) -> Result<(), LedgerError> {
    transition(
        pool,
        id,
        &[PayloadStatus::NeedsPreload, PayloadStatus::NoSendRequested],
        PayloadStatus::Deleted,
    )
    .await
}

/// Retention retirement of a row the sweeper last saw in `observed`.
#[instrument(skip_all, fields(id = %id, observed = %observed))]
pub(crate) async fn retire_expired(
    pool: &Pool,
    id: &SendRequestId,
    observed: PayloadStatus,
) -> Result<(), LedgerError> {
    if observed == PayloadStatus::Deleted {
        return Err(LedgerError::StatusConflict {
            id: id.clone(),
            expected: NON_DELETED.to_vec(),
            actual: observed,
        });
    }
    transition(pool, id, &[observed], PayloadStatus::Deleted).await
}

pub async fn get_send_request(pool: &Pool, id: &SendRequestId) -> Result<SendRequest, LedgerError> {
    db::send_requests::get(pool, id)
        .await?
        .ok_or_else(|| LedgerError::NotFound(id.clone()))
}

pub async fn list_send_requests_for_day_with_status(
    pool: &Pool,
    date_of_send: NaiveDate,
    status: PayloadStatus,
) -> Result<Vec<SendRequest>, LedgerError> {
    Ok(db::send_requests::list_for_day_with_status(pool, date_of_send, status).await?)
}

pub async fn list_non_deleted_send_requests_older_than(
    pool: &Pool,
    older_than: DateTime<Utc>,
) -> Result<Vec<SendRequest>, LedgerError> {
    Ok(db::send_requests::list_non_deleted_created_at_or_before(pool, older_than).await?)
}

pub async fn list_outstanding_send_requests_for_user(
    pool: &Pool,
    user_id: &UserId,
    language_code: &LanguageCode,
) -> Result<Vec<SendRequest>, LedgerError> {
    let mut conn = pool.acquire().await?;
    Ok(db::send_requests::list_outstanding_for_user(&mut conn, user_id, language_code).await?)
}

/// Statuses `id` has moved into, oldest first.
pub async fn list_transitions(pool: &Pool, id: &SendRequestId) -> Result<Vec<PayloadStatus>, LedgerError> {
    Ok(db::send_requests::list_transitions(pool, id).await?)
}
