//! Error taxonomies for schedule resolution and the send-request ledger.
use crate::model::{PayloadStatus, SendRequestId};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Input-validation and resolution failures. None of these are ever persisted.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid IANA timezone: {0}")]
    InvalidTimezone(String),
    #[error("day of week must be between 0 and 6, got {0}")]
    InvalidDayOfWeek(i64),
    #[error("hour must be between 0 and 23, got {0}")]
    InvalidHour(i64),
    #[error("quarter hour index must be between 0 and 3, got {0}")]
    InvalidQuarterHour(i64),
    #[error("number of articles must be between {min} and {max}, got {got}")]
    InvalidArticleCount { min: i64, max: i64, got: i64 },
    #[error("at most {max} content topics are allowed, got {got}")]
    TooManyTopics { max: usize, got: usize },
    #[error("invalid language code: {0}")]
    InvalidLanguageCode(String),
    #[error("expected an exact UTC midnight, got {0}")]
    NotMidnight(DateTime<Utc>),
    #[error("send time did not converge onto the UTC day starting {utc_midnight} after {iterations} shifts")]
    ScheduleResolution {
        utc_midnight: DateTime<Utc>,
        iterations: usize,
    },
    #[error("invalid date of send: {0}")]
    InvalidDateOfSend(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Failures raised by ledger status mutations and lookups.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("send request {id} is {actual}, expected one of {expected:?}")]
    StatusConflict {
        id: SendRequestId,
        expected: Vec<PayloadStatus>,
        actual: PayloadStatus,
    },
    #[error("send request {0} is already claimed for sending")]
    AlreadyClaimed(SendRequestId),
    #[error("send request {0} not found")]
    NotFound(SendRequestId),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl LedgerError {
    /// True when another writer already moved or claimed the row.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            LedgerError::StatusConflict { .. } | LedgerError::AlreadyClaimed(_)
        )
    }
}
