use crate::error::ScheduleError;
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub const MINIMUM_NUMBER_OF_ARTICLES: i64 = 4;
pub const MAXIMUM_NUMBER_OF_ARTICLES: i64 = 12;
pub const DEFAULT_NUMBER_OF_ARTICLES: i64 = 12;
pub const MAXIMUM_NUMBER_OF_TOPICS: usize = 6;

/// Storage format for `date_of_send`.
pub const DATE_OF_SEND_FORMAT: &str = "%Y-%m-%d";

static LANGUAGE_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z]{2}$").expect("static language code pattern"));

/// Namespace for deterministic send request ids.
const SEND_REQUEST_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_8d3b_4c1f_9a7e_52b0_d4c8_e913);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Two-letter lowercase language code, e.g. `es`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LanguageCode(String);

impl LanguageCode {
    pub fn new(code: &str) -> Result<Self, ScheduleError> {
        if LANGUAGE_CODE_RE.is_match(code) {
            Ok(Self(code.to_string()))
        } else {
            Err(ScheduleError::InvalidLanguageCode(code.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for LanguageCode {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        LanguageCode::new(&value)
    }
}

impl From<LanguageCode> for String {
    fn from(value: LanguageCode) -> Self {
        value.0
    }
}

impl fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Day of week with Sunday = 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DayOfWeekIndex(pub(crate) u8);

impl DayOfWeekIndex {
    pub fn new(index: i64) -> Result<Self, ScheduleError> {
        if (0..=6).contains(&index) {
            Ok(Self(index as u8))
        } else {
            Err(ScheduleError::InvalidDayOfWeek(index))
        }
    }

    pub fn from_weekday(weekday: Weekday) -> Self {
        Self(weekday.num_days_from_sunday() as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn matches(self, weekday: Weekday) -> bool {
        weekday.num_days_from_sunday() as u8 == self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HourIndex(pub(crate) u8);

impl HourIndex {
    pub fn new(index: i64) -> Result<Self, ScheduleError> {
        if (0..=23).contains(&index) {
            Ok(Self(index as u8))
        } else {
            Err(ScheduleError::InvalidHour(index))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

/// Quarter of an hour: 0 → :00, 3 → :45.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuarterHourIndex(pub(crate) u8);

impl QuarterHourIndex {
    pub fn new(index: i64) -> Result<Self, ScheduleError> {
        if (0..=3).contains(&index) {
            Ok(Self(index as u8))
        } else {
            Err(ScheduleError::InvalidQuarterHour(index))
        }
    }

    /// Quarter containing the given minute of the hour.
    pub fn from_minute(minute: u32) -> Self {
        Self((minute.min(59) / 15) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn minutes(self) -> u32 {
        u32::from(self.0) * 15
    }
}

/// A (weekday, hour, quarter-hour) triple; the storage representation of a send slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedTime {
    pub day_of_week: DayOfWeekIndex,
    pub hour: HourIndex,
    pub quarter_hour: QuarterHourIndex,
}

impl IndexedTime {
    pub fn from_datetime<Tz: TimeZone>(dt: &DateTime<Tz>) -> Self {
        use chrono::Timelike;
        Self {
            day_of_week: DayOfWeekIndex::from_weekday(dt.weekday()),
            hour: HourIndex(dt.hour() as u8),
            quarter_hour: QuarterHourIndex::from_minute(dt.minute()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PayloadStatus {
    NeedsPreload,
    NoSendRequested,
    PayloadReady,
    UnverifiedUser,
    Sent,
    Deleted,
}

impl PayloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadStatus::NeedsPreload => "needs-preload",
            PayloadStatus::NoSendRequested => "no-send-requested",
            PayloadStatus::PayloadReady => "payload-ready",
            PayloadStatus::UnverifiedUser => "user-not-verified",
            PayloadStatus::Sent => "sent",
            PayloadStatus::Deleted => "deleted",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "needs-preload" => Some(PayloadStatus::NeedsPreload),
            "no-send-requested" => Some(PayloadStatus::NoSendRequested),
            "payload-ready" => Some(PayloadStatus::PayloadReady),
            "user-not-verified" => Some(PayloadStatus::UnverifiedUser),
            "sent" => Some(PayloadStatus::Sent),
            "deleted" => Some(PayloadStatus::Deleted),
            _ => None,
        }
    }

    /// Rows in these states still have work pending.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, PayloadStatus::NeedsPreload | PayloadStatus::PayloadReady)
    }
}

impl fmt::Display for PayloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct SendRequestId(pub String);

impl SendRequestId {
    /// Deterministic id over the business key, so repeated creation collides.
    pub fn derive(date_of_send: NaiveDate, user_id: &UserId, language_code: &LanguageCode) -> Self {
        let name = format!(
            "{}|{}|{}",
            date_of_send.format(DATE_OF_SEND_FORMAT),
            user_id.as_str(),
            language_code.as_str()
        );
        Self(Uuid::new_v5(&SEND_REQUEST_NAMESPACE, name.as_bytes()).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SendRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendRequest {
    pub id: SendRequestId,
    pub user_id: UserId,
    pub language_code: LanguageCode,
    pub date_of_send: NaiveDate,
    pub hour_to_send_utc: Option<HourIndex>,
    pub quarter_hour_to_send_utc: Option<QuarterHourIndex>,
    pub payload_status: PayloadStatus,
}

impl SendRequest {
    /// Scheduled UTC instant; legacy rows without a slot resolve to midnight.
    pub fn send_at(&self) -> DateTime<Utc> {
        let hour = self.hour_to_send_utc.map(HourIndex::value).unwrap_or(0);
        let minute = self
            .quarter_hour_to_send_utc
            .map(QuarterHourIndex::minutes)
            .unwrap_or(0);
        let time = NaiveTime::from_hms_opt(u32::from(hour), minute, 0).unwrap_or(NaiveTime::MIN);
        Utc.from_utc_datetime(&self.date_of_send.and_time(time))
    }

    pub fn utc_midnight(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.date_of_send.and_time(NaiveTime::MIN))
    }

    /// Object storage key of the rendered payload.
    pub fn file_key(&self, environment: &str) -> String {
        format!("worker-{}/newsletter-data/{}.json", environment, self.id)
    }
}

/// Rendered newsletter as stored between preload and fulfillment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewsletterPayload {
    pub send_request_id: SendRequestId,
    pub user_id: UserId,
    pub language_code: LanguageCode,
    pub date_of_send: NaiveDate,
    pub number_of_articles: i64,
    pub content_topics: Vec<String>,
    pub body: serde_json::Value,
}
