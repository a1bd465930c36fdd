//! User schedules: where a user's local send time falls on a given UTC day,
//! plus the read/write paths for schedule and per-weekday rows.
use crate::db::{self, Pool, ScheduleDayRow, ScheduleRow};
use crate::error::ScheduleError;
use crate::model::{
    DayOfWeekIndex, HourIndex, IndexedTime, LanguageCode, QuarterHourIndex, UserId,
    DEFAULT_NUMBER_OF_ARTICLES, MAXIMUM_NUMBER_OF_ARTICLES, MAXIMUM_NUMBER_OF_TOPICS,
    MINIMUM_NUMBER_OF_ARTICLES,
};
use crate::timezone::{
    closest_utc_send_time, convert_indexed_utc_to_user_timezone, localize, parse_timezone,
    OperationalTarget,
};
use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::HashSet;
use tracing::{info, instrument};

/// Upper bound on ±24h shifts before giving up on a send time.
const MAX_SHIFT_ITERATIONS: usize = 4;

const TOPIC_SEPARATOR: char = ';';

/// Values used for users that never saved a schedule, plus the checkpoint
/// that weekday rows are keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleDefaults {
    pub utc_hour: HourIndex,
    pub number_of_articles: i64,
    pub target: OperationalTarget,
}

impl ScheduleDefaults {
    pub fn with_utc_hour(hour: i64) -> Result<Self, ScheduleError> {
        Ok(Self {
            utc_hour: HourIndex::new(hour)?,
            ..Self::default()
        })
    }
}

impl Default for ScheduleDefaults {
    fn default() -> Self {
        Self {
            utc_hour: HourIndex(11),
            number_of_articles: DEFAULT_NUMBER_OF_ARTICLES,
            target: OperationalTarget::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserNewsletterSchedule {
    pub user_id: UserId,
    pub language_code: LanguageCode,
    pub timezone: Tz,
    pub hour: HourIndex,
    pub quarter_hour: QuarterHourIndex,
    pub number_of_articles_per_email: i64,
}

impl UserNewsletterSchedule {
    pub fn default_for(user_id: &UserId, language_code: &LanguageCode, defaults: &ScheduleDefaults) -> Self {
        Self {
            user_id: user_id.clone(),
            language_code: language_code.clone(),
            timezone: chrono_tz::UTC,
            hour: defaults.utc_hour,
            quarter_hour: QuarterHourIndex(0),
            number_of_articles_per_email: defaults.number_of_articles,
        }
    }

    fn local_time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(u32::from(self.hour.value()), self.quarter_hour.minutes(), 0)
            .unwrap_or(NaiveTime::MIN)
    }
}

impl TryFrom<ScheduleRow> for UserNewsletterSchedule {
    type Error = ScheduleError;

    fn try_from(row: ScheduleRow) -> Result<Self, Self::Error> {
        Ok(Self {
            language_code: LanguageCode::new(&row.language_code)?,
            timezone: parse_timezone(&row.iana_timezone)?,
            hour: HourIndex::new(row.hour_of_day_index)?,
            quarter_hour: QuarterHourIndex::new(row.quarter_hour_index)?,
            number_of_articles_per_email: validate_article_count(row.number_of_articles_per_email)?,
            user_id: row.user_id,
        })
    }
}

/// Preferences for one UTC weekday.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserScheduleDay {
    pub user_id: UserId,
    pub language_code: LanguageCode,
    pub utc: IndexedTime,
    pub content_topics: Vec<String>,
    pub number_of_articles: i64,
    pub is_active: bool,
}

impl TryFrom<ScheduleDayRow> for UserScheduleDay {
    type Error = ScheduleError;

    fn try_from(row: ScheduleDayRow) -> Result<Self, Self::Error> {
        Ok(Self {
            language_code: LanguageCode::new(&row.language_code)?,
            utc: IndexedTime {
                day_of_week: DayOfWeekIndex::new(row.day_of_week_index_utc)?,
                hour: HourIndex::new(row.hour_of_day_index_utc)?,
                quarter_hour: QuarterHourIndex::new(row.quarter_hour_index_utc)?,
            },
            content_topics: split_topics(row.content_topics.as_deref()),
            number_of_articles: validate_article_count(row.number_of_articles)?,
            is_active: row.is_active,
            user_id: row.user_id,
        })
    }
}

/// A resolved send for one UTC day together with what should be in it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleWithMetadata {
    pub schedule: UserNewsletterSchedule,
    pub day: Option<UserScheduleDay>,
    pub send_at: DateTime<Tz>,
}

impl ScheduleWithMetadata {
    pub fn is_send_requested(&self) -> bool {
        self.day.as_ref().map_or(true, |d| d.is_active)
    }

    pub fn send_instant(&self) -> Option<DateTime<Utc>> {
        self.is_send_requested()
            .then(|| self.send_at.with_timezone(&Utc))
    }

    pub fn send_time_local(&self) -> DateTime<Tz> {
        self.send_at
    }

    pub fn number_of_articles(&self) -> i64 {
        self.day
            .as_ref()
            .map_or(self.schedule.number_of_articles_per_email, |d| d.number_of_articles)
    }

    pub fn content_topics(&self) -> &[String] {
        self.day
            .as_ref()
            .map(|d| d.content_topics.as_slice())
            .unwrap_or(&[])
    }
}

fn validate_article_count(count: i64) -> Result<i64, ScheduleError> {
    if (MINIMUM_NUMBER_OF_ARTICLES..=MAXIMUM_NUMBER_OF_ARTICLES).contains(&count) {
        Ok(count)
    } else {
        Err(ScheduleError::InvalidArticleCount {
            min: MINIMUM_NUMBER_OF_ARTICLES,
            max: MAXIMUM_NUMBER_OF_ARTICLES,
            got: count,
        })
    }
}

fn split_topics(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(TOPIC_SEPARATOR)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Drop blanks and repeats, keeping first occurrences in order.
fn normalize_topics(topics: &[String]) -> Result<Vec<String>, ScheduleError> {
    let mut seen = HashSet::new();
    let deduped: Vec<String> = topics
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty() && !t.contains(TOPIC_SEPARATOR))
        .filter(|t| seen.insert(t.to_string()))
        .map(str::to_string)
        .collect();
    if deduped.len() > MAXIMUM_NUMBER_OF_TOPICS {
        return Err(ScheduleError::TooManyTopics {
            max: MAXIMUM_NUMBER_OF_TOPICS,
            got: deduped.len(),
        });
    }
    Ok(deduped)
}

pub(crate) fn ensure_utc_midnight(utc_midnight: DateTime<Utc>) -> Result<(), ScheduleError> {
    if utc_midnight.time() == NaiveTime::MIN {
        Ok(())
    } else {
        Err(ScheduleError::NotMidnight(utc_midnight))
    }
}

/// Place the user's local send time inside `[utc_midnight, utc_midnight + 24h)`.
///
/// The local hour and quarter are first put on the anchor's calendar date in
/// the user's timezone, then shifted a day at a time until the instant lands in
/// the UTC window. The returned instant therefore always has the anchor's UTC
/// weekday, while its local weekday may differ by one.
pub fn resolve_send_for_utc_day(
    utc_midnight: DateTime<Utc>,
    schedule: &UserNewsletterSchedule,
) -> Result<DateTime<Tz>, ScheduleError> {
    ensure_utc_midnight(utc_midnight)?;
    let window_end = utc_midnight + Duration::hours(24);
    let mut send_at = localize(
        &schedule.timezone,
        utc_midnight.date_naive().and_time(schedule.local_time()),
    );
    for _ in 0..MAX_SHIFT_ITERATIONS {
        if send_at < utc_midnight {
            send_at = send_at + Duration::hours(24);
        } else if send_at >= window_end {
            send_at = send_at - Duration::hours(24);
        } else {
            return Ok(send_at);
        }
    }
    if send_at >= utc_midnight && send_at < window_end {
        return Ok(send_at);
    }
    Err(ScheduleError::ScheduleResolution {
        utc_midnight,
        iterations: MAX_SHIFT_ITERATIONS,
    })
}

/// Schedule for `user_id` on the UTC day starting at `utc_midnight`, with
/// defaults filled in for users that never saved one.
#[instrument(skip_all, fields(user_id = %user_id, language = %language_code))]
pub async fn get_user_newsletter_schedule(
    pool: &Pool,
    user_id: &UserId,
    language_code: &LanguageCode,
    utc_midnight: DateTime<Utc>,
    defaults: &ScheduleDefaults,
) -> Result<ScheduleWithMetadata, ScheduleError> {
    ensure_utc_midnight(utc_midnight)?;
    let schedule = match db::schedules::get_schedule(pool, user_id, language_code).await? {
        Some(row) => UserNewsletterSchedule::try_from(row)?,
        None => UserNewsletterSchedule::default_for(user_id, language_code, defaults),
    };
    let send_at = resolve_send_for_utc_day(utc_midnight, &schedule)?;
    // Day rows are stored under the checkpoint slot of a local weekday, which
    // is not necessarily the anchor's UTC weekday.
    let local_weekday = DayOfWeekIndex::from_weekday(send_at.weekday());
    let slot = closest_utc_send_time(
        local_weekday,
        schedule.timezone.name(),
        send_at.with_timezone(&Utc),
        &defaults.target,
    )?;
    let day = db::schedules::get_schedule_day(pool, user_id, language_code, i64::from(slot.day_of_week.value()))
        .await?
        .map(UserScheduleDay::try_from)
        .transpose()?;
    Ok(ScheduleWithMetadata {
        schedule,
        day,
        send_at,
    })
}

/// Fields accepted when saving a user's schedule.
#[derive(Debug, Clone)]
pub struct ScheduleInput {
    pub iana_timezone: String,
    pub hour: i64,
    pub quarter_hour: i64,
    pub number_of_articles_per_email: i64,
}

/// Save the user's schedule and move every outstanding send request for the
/// same user and language onto the new time.
#[instrument(skip_all, fields(user_id = %user_id, language = %language_code))]
pub async fn upsert_user_newsletter_schedule(
    pool: &Pool,
    user_id: &UserId,
    language_code: &LanguageCode,
    input: &ScheduleInput,
) -> Result<UserNewsletterSchedule, ScheduleError> {
    let schedule = UserNewsletterSchedule {
        user_id: user_id.clone(),
        language_code: language_code.clone(),
        timezone: parse_timezone(&input.iana_timezone)?,
        hour: HourIndex::new(input.hour)?,
        quarter_hour: QuarterHourIndex::new(input.quarter_hour)?,
        number_of_articles_per_email: validate_article_count(input.number_of_articles_per_email)?,
    };
    // Schedule and re-timed rows commit together or not at all.
    let mut tx = pool.begin().await?;
    db::schedules::upsert_schedule(
        &mut tx,
        &ScheduleRow {
            user_id: user_id.clone(),
            language_code: language_code.as_str().to_string(),
            iana_timezone: input.iana_timezone.clone(),
            hour_of_day_index: input.hour,
            quarter_hour_index: input.quarter_hour,
            number_of_articles_per_email: input.number_of_articles_per_email,
        },
    )
    .await?;

    let outstanding = db::send_requests::list_outstanding_for_user(&mut tx, user_id, language_code).await?;
    let mut retimed = 0usize;
    for req in &outstanding {
        let send_at = resolve_send_for_utc_day(req.utc_midnight(), &schedule)?.with_timezone(&Utc);
        retimed += db::send_requests::update_send_at_time(
            &mut tx,
            &req.id,
            HourIndex(send_at.hour() as u8),
            QuarterHourIndex::from_minute(send_at.minute()),
        )
        .await? as usize;
    }
    tx.commit().await?;
    info!(retimed, "saved newsletter schedule");
    Ok(schedule)
}

/// Fields accepted when saving the preferences for one local weekday.
#[derive(Debug, Clone)]
pub struct ScheduleDayInput {
    pub local_day_of_week: i64,
    pub iana_timezone: String,
    pub content_topics: Vec<String>,
    pub number_of_articles: i64,
    pub is_active: bool,
}

#[instrument(skip_all, fields(user_id = %user_id, language = %language_code))]
pub async fn upsert_schedule_day(
    pool: &Pool,
    user_id: &UserId,
    language_code: &LanguageCode,
    input: &ScheduleDayInput,
    now: DateTime<Utc>,
    target: &OperationalTarget,
) -> Result<UserScheduleDay, ScheduleError> {
    let local_day = DayOfWeekIndex::new(input.local_day_of_week)?;
    let number_of_articles = validate_article_count(input.number_of_articles)?;
    let content_topics = normalize_topics(&input.content_topics)?;
    let utc = closest_utc_send_time(local_day, &input.iana_timezone, now, target)?;

    let joined = content_topics.join(&TOPIC_SEPARATOR.to_string());
    db::schedules::upsert_schedule_day(
        pool,
        &ScheduleDayRow {
            user_id: user_id.clone(),
            language_code: language_code.as_str().to_string(),
            day_of_week_index_utc: i64::from(utc.day_of_week.value()),
            hour_of_day_index_utc: i64::from(utc.hour.value()),
            quarter_hour_index_utc: i64::from(utc.quarter_hour.value()),
            content_topics: (!joined.is_empty()).then_some(joined),
            number_of_articles,
            is_active: input.is_active,
        },
    )
    .await?;
    Ok(UserScheduleDay {
        user_id: user_id.clone(),
        language_code: language_code.clone(),
        utc,
        content_topics,
        number_of_articles,
        is_active: input.is_active,
    })
}

/// A stored weekday preference read back in some timezone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalScheduleDay {
    pub local: IndexedTime,
    pub content_topics: Vec<String>,
    pub number_of_articles: i64,
    pub is_active: bool,
}

#[instrument(skip_all, fields(user_id = %user_id, language = %language_code))]
pub async fn list_schedule_days_in_timezone(
    pool: &Pool,
    user_id: &UserId,
    language_code: &LanguageCode,
    iana_timezone: &str,
    now: DateTime<Utc>,
) -> Result<Vec<LocalScheduleDay>, ScheduleError> {
    let rows = db::schedules::list_schedule_days(pool, user_id, language_code).await?;
    let mut days = Vec::with_capacity(rows.len());
    for row in rows {
        let day = UserScheduleDay::try_from(row)?;
        days.push(LocalScheduleDay {
            local: convert_indexed_utc_to_user_timezone(day.utc, iana_timezone, now)?,
            content_topics: day.content_topics,
            number_of_articles: day.number_of_articles,
            is_active: day.is_active,
        });
    }
    Ok(days)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn christmas() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 12, 25, 0, 0, 0).unwrap()
    }

    fn schedule(tz: &str, hour: i64) -> UserNewsletterSchedule {
        UserNewsletterSchedule {
            user_id: UserId::new("u1"),
            language_code: LanguageCode::new("es").unwrap(),
            timezone: tz.parse().unwrap(),
            hour: HourIndex::new(hour).unwrap(),
            quarter_hour: QuarterHourIndex::new(0).unwrap(),
            number_of_articles_per_email: 12,
        }
    }

    #[test]
    fn resolves_across_day_boundaries() {
        let cases = [
            ("America/Los_Angeles", 21, 4),
            ("America/Los_Angeles", 5, 5),
            ("Pacific/Tarawa", 12, 5),
            ("Pacific/Tarawa", 11, 6),
        ];
        for (tz, hour, local_weekday) in cases {
            let got = resolve_send_for_utc_day(christmas(), &schedule(tz, hour)).unwrap();
            assert_eq!(
                got.weekday().num_days_from_sunday(),
                local_weekday,
                "{tz} at {hour}:00"
            );
            assert_eq!(got.hour(), hour as u32);
            let utc = got.with_timezone(&Utc);
            assert_eq!(utc.weekday(), christmas().weekday());
            assert!(utc >= christmas() && utc < christmas() + Duration::hours(24));
        }
    }

    #[test]
    fn rejects_non_midnight_anchor() {
        let anchor = christmas() + Duration::milliseconds(1);
        let err = resolve_send_for_utc_day(anchor, &schedule("UTC", 11)).unwrap_err();
        assert!(matches!(err, ScheduleError::NotMidnight(_)));
    }

    #[test]
    fn topics_are_deduplicated_and_capped() {
        let topics: Vec<String> = ["a", "b", "a", " ", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(normalize_topics(&topics).unwrap(), vec!["a", "b", "c"]);

        let too_many: Vec<String> = (0..7).map(|i| format!("t{i}")).collect();
        assert!(matches!(
            normalize_topics(&too_many),
            Err(ScheduleError::TooManyTopics { max: 6, got: 7 })
        ));
    }

    #[tokio::test]
    async fn missing_schedule_uses_defaults() {
        let pool = db::test_pool().await;
        let es = LanguageCode::new("es").unwrap();
        let meta = get_user_newsletter_schedule(
            &pool,
            &UserId::new("nobody"),
            &es,
            christmas(),
            &ScheduleDefaults::default(),
        )
        .await
        .unwrap();
        assert!(meta.is_send_requested());
        assert_eq!(meta.number_of_articles(), 12);
        assert!(meta.content_topics().is_empty());
        assert_eq!(
            meta.send_instant().unwrap(),
            Utc.with_ymd_and_hms(2020, 12, 25, 11, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn inactive_day_suppresses_send() {
        let pool = db::test_pool().await;
        let user = UserId::new("u1");
        let es = LanguageCode::new("es").unwrap();
        let now = Utc.with_ymd_and_hms(2020, 12, 20, 12, 0, 0).unwrap();
        // Friday in Etc/GMT+5 maps straight onto the Friday UTC checkpoint.
        let day = upsert_schedule_day(
            &pool,
            &user,
            &es,
            &ScheduleDayInput {
                local_day_of_week: 5,
                iana_timezone: "Etc/GMT+5".into(),
                content_topics: vec!["sports".into(), "sports".into(), "tech".into()],
                number_of_articles: 6,
                is_active: false,
            },
            now,
            &OperationalTarget::default(),
        )
        .await
        .unwrap();
        assert_eq!(day.utc.day_of_week.value(), 5);
        assert_eq!(day.content_topics, vec!["sports", "tech"]);

        let meta = get_user_newsletter_schedule(&pool, &user, &es, christmas(), &ScheduleDefaults::default())
            .await
            .unwrap();
        assert!(!meta.is_send_requested());
        assert!(meta.send_instant().is_none());
        assert_eq!(meta.number_of_articles(), 6);
        assert_eq!(meta.content_topics(), ["sports".to_string(), "tech".to_string()]);

        let listed = list_schedule_days_in_timezone(&pool, &user, &es, "Etc/GMT+5", now)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].local.day_of_week.value(), 5);
        assert_eq!(listed[0].local.hour.value(), 10);
    }

    #[tokio::test]
    async fn weekday_preference_follows_local_send_day() {
        let pool = db::test_pool().await;
        let user = UserId::new("la");
        let es = LanguageCode::new("es").unwrap();
        upsert_user_newsletter_schedule(
            &pool,
            &user,
            &es,
            &ScheduleInput {
                iana_timezone: "America/Los_Angeles".into(),
                hour: 21,
                quarter_hour: 0,
                number_of_articles_per_email: 8,
            },
        )
        .await
        .unwrap();
        upsert_schedule_day(
            &pool,
            &user,
            &es,
            &ScheduleDayInput {
                local_day_of_week: 4,
                iana_timezone: "America/Los_Angeles".into(),
                content_topics: vec![],
                number_of_articles: 8,
                is_active: false,
            },
            Utc.with_ymd_and_hms(2020, 12, 20, 12, 0, 0).unwrap(),
            &OperationalTarget::default(),
        )
        .await
        .unwrap();

        // The Christmas UTC day sends at 21:00 on local Thursday the 24th.
        let thursday = get_user_newsletter_schedule(&pool, &user, &es, christmas(), &ScheduleDefaults::default())
            .await
            .unwrap();
        assert_eq!(thursday.send_time_local().weekday().num_days_from_sunday(), 4);
        assert!(!thursday.is_send_requested());

        // The day before sends on local Wednesday, which has no preference.
        let eve = christmas() - Duration::days(1);
        let wednesday = get_user_newsletter_schedule(&pool, &user, &es, eve, &ScheduleDefaults::default())
            .await
            .unwrap();
        assert_eq!(wednesday.send_time_local().weekday().num_days_from_sunday(), 3);
        assert!(wednesday.is_send_requested());
        assert_eq!(wednesday.number_of_articles(), 8);
    }

    #[tokio::test]
    async fn failed_retime_keeps_previous_schedule() {
        let pool = db::test_pool().await;
        let user = UserId::new("u1");
        let es = LanguageCode::new("es").unwrap();
        let mut input = ScheduleInput {
            iana_timezone: "Europe/Madrid".into(),
            hour: 8,
            quarter_hour: 0,
            number_of_articles_per_email: 8,
        };
        upsert_user_newsletter_schedule(&pool, &user, &es, &input).await.unwrap();
        sqlx::query(
            "INSERT INTO newsletter_send_requests \
             (_id, user_id, language_code, date_of_send, payload_status) \
             VALUES ('corrupt', 'u1', 'es', 'not-a-date', 'needs-preload')",
        )
        .execute(&pool)
        .await
        .unwrap();

        input.hour = 20;
        let err = upsert_user_newsletter_schedule(&pool, &user, &es, &input)
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Database(_)));

        let saved = db::schedules::get_schedule(&pool, &user, &es).await.unwrap().unwrap();
        assert_eq!(saved.hour_of_day_index, 8);
    }

    #[tokio::test]
    async fn invalid_schedule_input_is_rejected() {
        let pool = db::test_pool().await;
        let es = LanguageCode::new("es").unwrap();
        let mut input = ScheduleInput {
            iana_timezone: "Europe/Madrid".into(),
            hour: 8,
            quarter_hour: 1,
            number_of_articles_per_email: 3,
        };
        let err = upsert_user_newsletter_schedule(&pool, &UserId::new("u"), &es, &input)
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidArticleCount { got: 3, .. }));

        input.number_of_articles_per_email = 8;
        input.iana_timezone = "Europe/Atlantis".into();
        let err = upsert_user_newsletter_schedule(&pool, &UserId::new("u"), &es, &input)
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidTimezone(_)));
    }
}
