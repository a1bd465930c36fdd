use crate::model::UserId;
use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

/// Account status that makes a user eligible for delivery.
pub const USER_STATUS_VERIFIED: &str = "verified";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL and stricter durability.
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn upsert_user(pool: &Pool, user_id: &UserId, email_address: &str, status: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO users (id, email_address, status) VALUES (?, ?, ?) \
         ON CONFLICT (id) DO UPDATE SET email_address = excluded.email_address, status = excluded.status",
    )
    .bind(user_id)
    .bind(email_address)
    .bind(status)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn list_verified_user_ids(pool: &Pool) -> Result<Vec<UserId>> {
    let ids = sqlx::query_scalar::<_, UserId>("SELECT id FROM users WHERE status = ? ORDER BY id")
        .bind(USER_STATUS_VERIFIED)
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn user_status(pool: &Pool, user_id: &UserId) -> Result<Option<String>> {
    let status = sqlx::query_scalar::<_, String>("SELECT status FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(status)
}
