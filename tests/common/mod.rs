#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use newsletter_dispatch::db;
use newsletter_dispatch::delivery::{ContentRenderer, EmailTransport, PreloadInput, UserDirectory};
use newsletter_dispatch::model::{LanguageCode, NewsletterPayload, SendRequest, SendRequestId, UserId};
use newsletter_dispatch::schedule::{upsert_user_newsletter_schedule, ScheduleInput};
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

pub async fn setup_pool() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

/// File-backed pool with several connections, for tests that need writers
/// running side by side.
pub async fn file_pool(dir: &Path) -> SqlitePool {
    let url = format!("sqlite://{}", dir.join("newsletter.db").display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

pub fn es() -> LanguageCode {
    LanguageCode::new("es").unwrap()
}

pub fn users(ids: &[&str]) -> Vec<UserId> {
    ids.iter().map(|id| UserId::new(*id)).collect()
}

pub fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

/// Save a schedule for `user` in `tz` at `hour`:00 local.
pub async fn set_schedule(pool: &SqlitePool, user: &str, tz: &str, hour: i64) {
    upsert_user_newsletter_schedule(
        pool,
        &UserId::new(user),
        &es(),
        &ScheduleInput {
            iana_timezone: tz.to_string(),
            hour,
            quarter_hour: 0,
            number_of_articles_per_email: 8,
        },
    )
    .await
    .unwrap();
}

pub async fn backdate(pool: &SqlitePool, id: &SendRequestId, created_at: DateTime<Utc>) {
    sqlx::query("UPDATE newsletter_send_requests SET created_at = ? WHERE _id = ?")
        .bind(created_at.format("%Y-%m-%d %H:%M:%S").to_string())
        .bind(id.as_str())
        .execute(pool)
        .await
        .unwrap();
}

pub async fn count_rows(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM newsletter_send_requests")
        .fetch_one(pool)
        .await
        .unwrap()
}

#[derive(Clone, Default)]
pub struct FakeDirectory {
    pub active: Arc<Mutex<Vec<UserId>>>,
    pub unverified: Arc<Mutex<HashSet<UserId>>>,
}

impl FakeDirectory {
    pub fn with_users(ids: &[&str]) -> Self {
        Self {
            active: Arc::new(Mutex::new(users(ids))),
            unverified: Arc::default(),
        }
    }
}

#[async_trait]
impl UserDirectory for FakeDirectory {
    async fn get_all_active_users(&self) -> Result<Vec<UserId>> {
        Ok(self.active.lock().await.clone())
    }

    async fn is_user_verified(&self, user_id: &UserId) -> Result<bool> {
        Ok(!self.unverified.lock().await.contains(user_id))
    }
}

#[derive(Clone, Default)]
pub struct RecordingRenderer {
    pub calls: Arc<Mutex<Vec<PreloadInput>>>,
}

#[async_trait]
impl ContentRenderer for RecordingRenderer {
    async fn render(&self, input: &PreloadInput) -> Result<serde_json::Value> {
        self.calls.lock().await.push(input.clone());
        Ok(json!({ "articles": input.number_of_articles }))
    }
}

#[derive(Clone, Default)]
pub struct RecordingTransport {
    pub sent: Arc<Mutex<Vec<(SendRequestId, NewsletterPayload)>>>,
    pub fail: Arc<Mutex<bool>>,
}

#[async_trait]
impl EmailTransport for RecordingTransport {
    async fn send(&self, request: &SendRequest, payload: &NewsletterPayload) -> Result<()> {
        if *self.fail.lock().await {
            return Err(anyhow!("smtp unavailable"));
        }
        self.sent
            .lock()
            .await
            .push((request.id.clone(), payload.clone()));
        Ok(())
    }
}
