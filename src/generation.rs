use crate::db::Pool;
use crate::delivery::UserDirectory;
use crate::ledger;
use crate::model::LanguageCode;
use crate::schedule::ScheduleDefaults;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationReport {
    pub date_of_send: NaiveDate,
    pub active_users: usize,
    /// Rows present after the pass, per language in configured order.
    pub per_language: Vec<(LanguageCode, usize)>,
    /// Rows inserted by this pass.
    pub created: usize,
}

impl GenerationReport {
    pub fn total(&self) -> usize {
        self.per_language.iter().map(|(_, n)| n).sum()
    }
}

/// Make sure every active user has a send request per language for `day`.
#[instrument(skip_all, fields(day = %day.date_naive()))]
pub async fn generate_send_requests_for_day(
    pool: &Pool,
    directory: &dyn UserDirectory,
    languages: &[LanguageCode],
    day: DateTime<Utc>,
    defaults: &ScheduleDefaults,
) -> Result<GenerationReport> {
    let users = directory
        .get_all_active_users()
        .await
        .context("listing active users")?;
    let mut per_language = Vec::with_capacity(languages.len());
    let mut created = 0;
    for language in languages {
        let day_requests = ledger::ensure_send_requests_for_day(pool, &users, language, day, defaults)
            .await
            .with_context(|| format!("creating {language} send requests"))?;
        per_language.push((language.clone(), day_requests.requests.len()));
        created += day_requests.created;
    }
    let report = GenerationReport {
        date_of_send: day.date_naive(),
        active_users: users.len(),
        per_language,
        created,
    };
    info!(
        users = report.active_users,
        rows = report.total(),
        created = report.created,
        "generation pass complete"
    );
    Ok(report)
}
