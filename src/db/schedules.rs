use super::model::{ScheduleDayRow, ScheduleRow};
use super::Pool;
use crate::model::{LanguageCode, UserId};
use sqlx::SqliteConnection;
use tracing::instrument;

#[instrument(skip_all)]
pub async fn get_schedule(
    pool: &Pool,
    user_id: &UserId,
    language_code: &LanguageCode,
) -> Result<Option<ScheduleRow>, sqlx::Error> {
    sqlx::query_as::<_, ScheduleRow>(
        "SELECT user_id, language_code, iana_timezone, hour_of_day_index, quarter_hour_index, number_of_articles_per_email \
         FROM user_newsletter_schedule WHERE user_id = ? AND language_code = ?",
    )
    .bind(user_id)
    .bind(language_code.as_str())
    .fetch_optional(pool)
    .await
}

#[instrument(skip_all)]
pub async fn upsert_schedule(conn: &mut SqliteConnection, row: &ScheduleRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO user_newsletter_schedule \
         (user_id, language_code, iana_timezone, hour_of_day_index, quarter_hour_index, number_of_articles_per_email) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT (user_id, language_code) DO UPDATE SET \
         iana_timezone = excluded.iana_timezone, \
         hour_of_day_index = excluded.hour_of_day_index, \
         quarter_hour_index = excluded.quarter_hour_index, \
         number_of_articles_per_email = excluded.number_of_articles_per_email, \
         last_modified_at = CURRENT_TIMESTAMP",
    )
    .bind(&row.user_id)
    .bind(&row.language_code)
    .bind(&row.iana_timezone)
    .bind(row.hour_of_day_index)
    .bind(row.quarter_hour_index)
    .bind(row.number_of_articles_per_email)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_schedule_day(
    pool: &Pool,
    user_id: &UserId,
    language_code: &LanguageCode,
    day_of_week_index_utc: i64,
) -> Result<Option<ScheduleDayRow>, sqlx::Error> {
    sqlx::query_as::<_, ScheduleDayRow>(
        "SELECT user_id, language_code, day_of_week_index_utc, hour_of_day_index_utc, quarter_hour_index_utc, \
         content_topics, number_of_articles, is_active \
         FROM user_newsletter_schedule_days \
         WHERE user_id = ? AND language_code = ? AND day_of_week_index_utc = ?",
    )
    .bind(user_id)
    .bind(language_code.as_str())
    .bind(day_of_week_index_utc)
    .fetch_optional(pool)
    .await
}

#[instrument(skip_all)]
pub async fn list_schedule_days(
    pool: &Pool,
    user_id: &UserId,
    language_code: &LanguageCode,
) -> Result<Vec<ScheduleDayRow>, sqlx::Error> {
    sqlx::query_as::<_, ScheduleDayRow>(
        "SELECT user_id, language_code, day_of_week_index_utc, hour_of_day_index_utc, quarter_hour_index_utc, \
         content_topics, number_of_articles, is_active \
         FROM user_newsletter_schedule_days \
         WHERE user_id = ? AND language_code = ? ORDER BY day_of_week_index_utc",
    )
    .bind(user_id)
    .bind(language_code.as_str())
    .fetch_all(pool)
    .await
}

#[instrument(skip_all)]
pub async fn upsert_schedule_day(pool: &Pool, row: &ScheduleDayRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO user_newsletter_schedule_days \
         (user_id, language_code, day_of_week_index_utc, hour_of_day_index_utc, quarter_hour_index_utc, \
          content_topics, number_of_articles, is_active) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (user_id, language_code, day_of_week_index_utc) DO UPDATE SET \
         hour_of_day_index_utc = excluded.hour_of_day_index_utc, \
         quarter_hour_index_utc = excluded.quarter_hour_index_utc, \
         content_topics = excluded.content_topics, \
         number_of_articles = excluded.number_of_articles, \
         is_active = excluded.is_active, \
         last_modified_at = CURRENT_TIMESTAMP",
    )
    .bind(&row.user_id)
    .bind(&row.language_code)
    .bind(row.day_of_week_index_utc)
    .bind(row.hour_of_day_index_utc)
    .bind(row.quarter_hour_index_utc)
    .bind(&row.content_topics)
    .bind(row.number_of_articles)
    .bind(row.is_active)
    .execute(pool)
    .await?;
    Ok(())
}
