//! Collaborators the workers call out to: who receives mail, what goes in it,
//! and how it leaves. Each has a small default that works against the local
//! database and log output.
use crate::db::{self, Pool};
use crate::model::{LanguageCode, NewsletterPayload, SendRequest, SendRequestId, UserId};
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::json;
use tracing::info;

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Users that should receive newsletters.
    async fn get_all_active_users(&self) -> Result<Vec<UserId>>;
    async fn is_user_verified(&self, user_id: &UserId) -> Result<bool>;
}

/// Selection parameters handed to the renderer for one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadInput {
    pub send_request_id: SendRequestId,
    pub user_id: UserId,
    pub language_code: LanguageCode,
    pub date_of_send: NaiveDate,
    pub number_of_articles: i64,
    pub content_topics: Vec<String>,
}

#[async_trait]
pub trait ContentRenderer: Send + Sync {
    async fn render(&self, input: &PreloadInput) -> Result<serde_json::Value>;
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, request: &SendRequest, payload: &NewsletterPayload) -> Result<()>;
}

/// Reads the `users` table.
#[derive(Debug, Clone)]
pub struct SqliteUserDirectory {
    pool: Pool,
}

impl SqliteUserDirectory {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for SqliteUserDirectory {
    async fn get_all_active_users(&self) -> Result<Vec<UserId>> {
        db::list_verified_user_ids(&self.pool).await
    }

    async fn is_user_verified(&self, user_id: &UserId) -> Result<bool> {
        Ok(db::user_status(&self.pool, user_id).await?.as_deref() == Some(db::USER_STATUS_VERIFIED))
    }
}

/// Renders a manifest of what the newsletter should contain.
#[derive(Debug, Clone, Default)]
pub struct ManifestRenderer;

#[async_trait]
impl ContentRenderer for ManifestRenderer {
    async fn render(&self, input: &PreloadInput) -> Result<serde_json::Value> {
        Ok(json!({
            "language_code": input.language_code.as_str(),
            "date_of_send": input.date_of_send.to_string(),
            "number_of_articles": input.number_of_articles,
            "content_topics": input.content_topics,
        }))
    }
}

/// Dry-run transport that only logs.
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

#[async_trait]
impl EmailTransport for LogTransport {
    async fn send(&self, request: &SendRequest, payload: &NewsletterPayload) -> Result<()> {
        info!(
            id = %request.id,
            user_id = %request.user_id,
            language = %request.language_code,
            send_at = %request.send_at(),
            articles = payload.number_of_articles,
            "newsletter dispatched (dry run)"
        );
        Ok(())
    }
}
