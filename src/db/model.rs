//! Raw schedule rows. Range checks and timezone parsing happen when these are
//! converted in `crate::schedule`.

use crate::model::UserId;

/// One row of `user_newsletter_schedule`: the user's local send preference.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ScheduleRow {
    pub user_id: UserId,
    pub language_code: String,
    pub iana_timezone: String,
    pub hour_of_day_index: i64,
    pub quarter_hour_index: i64,
    pub number_of_articles_per_email: i64,
}

/// One row of `user_newsletter_schedule_days`, keyed by UTC weekday.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ScheduleDayRow {
    pub user_id: UserId,
    pub language_code: String,
    pub day_of_week_index_utc: i64,
    pub hour_of_day_index_utc: i64,
    pub quarter_hour_index_utc: i64,
    /// `;`-joined topic identifiers, `NULL` when unrestricted.
    pub content_topics: Option<String>,
    pub number_of_articles: i64,
    pub is_active: bool,
}
