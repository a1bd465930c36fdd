//! SQL for `newsletter_send_requests` and its transition audit table.
//!
//! Functions here return `sqlx::Error`; status preconditions and conflict
//! reporting live in `crate::ledger`.

use super::Pool;
use crate::model::{
    HourIndex, LanguageCode, PayloadStatus, QuarterHourIndex, SendRequest, SendRequestId, UserId,
    DATE_OF_SEND_FORMAT,
};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tracing::instrument;

const SELECT_SEND_REQUEST: &str = "SELECT _id, user_id, language_code, date_of_send, hour_to_send_index_utc, \
     quarter_hour_to_send_index_utc, payload_status FROM newsletter_send_requests";

/// SQLite `CURRENT_TIMESTAMP` layout, used for `created_at` comparisons.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, sqlx::FromRow)]
struct SendRequestRow {
    #[sqlx(rename = "_id")]
    id: String,
    user_id: String,
    language_code: String,
    date_of_send: String,
    hour_to_send_index_utc: Option<i64>,
    quarter_hour_to_send_index_utc: Option<i64>,
    payload_status: String,
}

fn decode_error(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

impl TryFrom<SendRequestRow> for SendRequest {
    type Error = sqlx::Error;

    fn try_from(row: SendRequestRow) -> Result<Self, Self::Error> {
        let language_code = LanguageCode::new(&row.language_code)
            .map_err(|e| decode_error(format!("send request {}: {e}", row.id)))?;
        let date_of_send = NaiveDate::parse_from_str(&row.date_of_send, DATE_OF_SEND_FORMAT)
            .map_err(|e| decode_error(format!("send request {}: date_of_send {e}", row.id)))?;
        let hour_to_send_utc = row
            .hour_to_send_index_utc
            .map(HourIndex::new)
            .transpose()
            .map_err(|e| decode_error(format!("send request {}: {e}", row.id)))?;
        let quarter_hour_to_send_utc = row
            .quarter_hour_to_send_index_utc
            .map(QuarterHourIndex::new)
            .transpose()
            .map_err(|e| decode_error(format!("send request {}: {e}", row.id)))?;
        let payload_status = PayloadStatus::parse_status(&row.payload_status).ok_or_else(|| {
            decode_error(format!(
                "send request {}: unknown payload status {}",
                row.id, row.payload_status
            ))
        })?;
        Ok(SendRequest {
            id: SendRequestId(row.id),
            user_id: UserId(row.user_id),
            language_code,
            date_of_send,
            hour_to_send_utc,
            quarter_hour_to_send_utc,
            payload_status,
        })
    }
}

fn decode_rows(rows: Vec<SendRequestRow>) -> Result<Vec<SendRequest>, sqlx::Error> {
    rows.into_iter().map(SendRequest::try_from).collect()
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_OF_SEND_FORMAT).to_string()
}

#[instrument(skip_all)]
pub async fn get(pool: &Pool, id: &SendRequestId) -> Result<Option<SendRequest>, sqlx::Error> {
    let row = sqlx::query_as::<_, SendRequestRow>(&format!("{SELECT_SEND_REQUEST} WHERE _id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(SendRequest::try_from).transpose()
}

/// Non-deleted rows for one day and language, restricted to `user_ids`.
#[instrument(skip_all)]
pub async fn list_active_for_day(
    pool: &Pool,
    date_of_send: NaiveDate,
    language_code: &LanguageCode,
    user_ids: &[UserId],
) -> Result<Vec<SendRequest>, sqlx::Error> {
    if user_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_SEND_REQUEST);
    qb.push(" WHERE date_of_send = ")
        .push_bind(format_date(date_of_send))
        .push(" AND language_code = ")
        .push_bind(language_code.as_str().to_string())
        .push(" AND payload_status != ")
        .push_bind(PayloadStatus::Deleted.as_str())
        .push(" AND user_id IN (");
    let mut separated = qb.separated(", ");
    for user_id in user_ids {
        separated.push_bind(user_id.as_str().to_string());
    }
    separated.push_unseparated(") ORDER BY user_id");
    let rows = qb.build_query_as::<SendRequestRow>().fetch_all(pool).await?;
    decode_rows(rows)
}

/// Insert unless the id already exists. Returns whether a row was written.
#[instrument(skip_all)]
pub async fn insert_if_absent(pool: &Pool, req: &SendRequest) -> Result<bool, sqlx::Error> {
    let created_at = Utc::now().format(TIMESTAMP_FORMAT).to_string();
    let res = sqlx::query(
        "INSERT INTO newsletter_send_requests \
         (_id, user_id, language_code, date_of_send, hour_to_send_index_utc, quarter_hour_to_send_index_utc, \
          payload_status, created_at, last_modified_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
    )
    .bind(&req.id)
    .bind(&req.user_id)
    .bind(req.language_code.as_str())
    .bind(format_date(req.date_of_send))
    .bind(req.hour_to_send_utc.map(|h| i64::from(h.value())))
    .bind(req.quarter_hour_to_send_utc.map(|q| i64::from(q.value())))
    .bind(req.payload_status.as_str())
    .bind(&created_at)
    .bind(&created_at)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn current_status(
    conn: &mut SqliteConnection,
    id: &SendRequestId,
) -> Result<Option<PayloadStatus>, sqlx::Error> {
    let status = sqlx::query_scalar::<_, String>(
        "SELECT payload_status FROM newsletter_send_requests WHERE _id = ?",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    status
        .map(|s| {
            PayloadStatus::parse_status(&s)
                .ok_or_else(|| decode_error(format!("send request {id}: unknown payload status {s}")))
        })
        .transpose()
}

/// Move `id` to `to` only while its status is one of `from`. Returns rows changed.
/// Any send claim is cleared with the move.
pub async fn transition_status(
    conn: &mut SqliteConnection,
    id: &SendRequestId,
    from: &[PayloadStatus],
    to: PayloadStatus,
) -> Result<u64, sqlx::Error> {
    if from.is_empty() {
        return Ok(0);
    }
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new("UPDATE newsletter_send_requests SET payload_status = ");
    qb.push_bind(to.as_str())
        .push(", send_claimed_until = NULL, last_modified_at = CURRENT_TIMESTAMP WHERE _id = ")
        .push_bind(id.as_str().to_string())
        .push(" AND payload_status IN (");
    let mut separated = qb.separated(", ");
    for status in from {
        separated.push_bind(status.as_str());
    }
    separated.push_unseparated(")");
    let res = qb.build().execute(&mut *conn).await?;
    Ok(res.rows_affected())
}

/// Set the send lease on a `payload-ready` row to `until`, unless another
/// lease is still live at `now`. Returns rows changed.
pub async fn claim_for_send(
    conn: &mut SqliteConnection,
    id: &SendRequestId,
    now: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let res = sqlx::query(
        "UPDATE newsletter_send_requests SET send_claimed_until = ?, last_modified_at = CURRENT_TIMESTAMP \
         WHERE _id = ? AND payload_status = ? \
         AND (send_claimed_until IS NULL OR datetime(send_claimed_until) <= datetime(?))",
    )
    .bind(until.format(TIMESTAMP_FORMAT).to_string())
    .bind(id)
    .bind(PayloadStatus::PayloadReady.as_str())
    .bind(now.format(TIMESTAMP_FORMAT).to_string())
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected())
}

pub async fn release_claim(conn: &mut SqliteConnection, id: &SendRequestId) -> Result<u64, sqlx::Error> {
    let res = sqlx::query(
        "UPDATE newsletter_send_requests SET send_claimed_until = NULL, last_modified_at = CURRENT_TIMESTAMP \
         WHERE _id = ? AND payload_status = ? AND send_claimed_until IS NOT NULL",
    )
    .bind(id)
    .bind(PayloadStatus::PayloadReady.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected())
}

pub async fn record_transition(
    conn: &mut SqliteConnection,
    id: &SendRequestId,
    to: PayloadStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO newsletter_send_request_transitions (send_request_id, to_payload_status) \
         VALUES (?, ?) ON CONFLICT DO NOTHING",
    )
    .bind(id)
    .bind(to.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn list_transitions(
    pool: &Pool,
    id: &SendRequestId,
) -> Result<Vec<PayloadStatus>, sqlx::Error> {
    let rows = sqlx::query_scalar::<_, String>(
        "SELECT to_payload_status FROM newsletter_send_request_transitions WHERE send_request_id = ? ORDER BY id",
    )
    .bind(id)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|s| {
            PayloadStatus::parse_status(&s)
                .ok_or_else(|| decode_error(format!("transition of {id}: unknown payload status {s}")))
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn list_for_day_with_status(
    pool: &Pool,
    date_of_send: NaiveDate,
    status: PayloadStatus,
) -> Result<Vec<SendRequest>, sqlx::Error> {
    let rows = sqlx::query_as::<_, SendRequestRow>(&format!(
        "{SELECT_SEND_REQUEST} WHERE date_of_send = ? AND payload_status = ? \
         ORDER BY hour_to_send_index_utc, quarter_hour_to_send_index_utc, _id"
    ))
    .bind(format_date(date_of_send))
    .bind(status.as_str())
    .fetch_all(pool)
    .await?;
    decode_rows(rows)
}

/// Non-deleted rows created at or before `cutoff`, oldest first.
#[instrument(skip_all)]
pub async fn list_non_deleted_created_at_or_before(
    pool: &Pool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<SendRequest>, sqlx::Error> {
    let rows = sqlx::query_as::<_, SendRequestRow>(&format!(
        "{SELECT_SEND_REQUEST} WHERE payload_status != ? AND datetime(created_at) <= datetime(?) \
         ORDER BY datetime(created_at), _id"
    ))
    .bind(PayloadStatus::Deleted.as_str())
    .bind(cutoff.format(TIMESTAMP_FORMAT).to_string())
    .fetch_all(pool)
    .await?;
    decode_rows(rows)
}

/// Rows for a user and language that are still waiting on preload or delivery.
#[instrument(skip_all)]
pub async fn list_outstanding_for_user(
    conn: &mut SqliteConnection,
    user_id: &UserId,
    language_code: &LanguageCode,
) -> Result<Vec<SendRequest>, sqlx::Error> {
    let rows = sqlx::query_as::<_, SendRequestRow>(&format!(
        "{SELECT_SEND_REQUEST} WHERE user_id = ? AND language_code = ? AND payload_status IN (?, ?) \
         ORDER BY date_of_send, _id"
    ))
    .bind(user_id)
    .bind(language_code.as_str())
    .bind(PayloadStatus::NeedsPreload.as_str())
    .bind(PayloadStatus::PayloadReady.as_str())
    .fetch_all(&mut *conn)
    .await?;
    decode_rows(rows)
}

#[instrument(skip_all)]
pub async fn update_send_at_time(
    conn: &mut SqliteConnection,
    id: &SendRequestId,
    hour: HourIndex,
    quarter_hour: QuarterHourIndex,
) -> Result<u64, sqlx::Error> {
    let res = sqlx::query(
        "UPDATE newsletter_send_requests SET hour_to_send_index_utc = ?, quarter_hour_to_send_index_utc = ?, \
         last_modified_at = CURRENT_TIMESTAMP WHERE _id = ?",
    )
    .bind(i64::from(hour.value()))
    .bind(i64::from(quarter_hour.value()))
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected())
}
