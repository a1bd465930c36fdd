//! Single-step preload and fulfill routines driven by the daemon loops.
use crate::db::Pool;
use crate::delivery::{ContentRenderer, EmailTransport, PreloadInput, UserDirectory};
use crate::error::LedgerError;
use crate::ledger;
use crate::model::{NewsletterPayload, SendRequest};
use crate::payload::PayloadStore;
use crate::processor::SendRequestProcessor;
use crate::schedule::{get_user_newsletter_schedule, ScheduleDefaults};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// How long a fulfill worker holds a row while the transport call runs.
const SEND_LEASE_MINUTES: i64 = 15;

/// Everything a worker step needs; cheap to clone into each task.
#[derive(Clone)]
pub struct WorkerContext {
    pub pool: Pool,
    pub processor: Arc<SendRequestProcessor>,
    pub directory: Arc<dyn UserDirectory>,
    pub renderer: Arc<dyn ContentRenderer>,
    pub transport: Arc<dyn EmailTransport>,
    pub store: Arc<dyn PayloadStore>,
    pub environment: String,
    pub defaults: ScheduleDefaults,
}

/// A conflict means another worker already advanced the row.
fn settle(result: Result<(), LedgerError>, req: &SendRequest, step: &'static str) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.is_conflict() => {
            warn!(id = %req.id, step, %err, "send request already advanced; skipping");
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("{step} {}", req.id)),
    }
}

pub async fn process_next_preload(ctx: &WorkerContext) -> Result<bool> {
    process_next_preload_at(ctx, Utc::now()).await
}

/// Pop one row due for preload and build its payload. Returns whether a row was taken.
#[instrument(skip_all)]
pub async fn process_next_preload_at(ctx: &WorkerContext, now: DateTime<Utc>) -> Result<bool> {
    let Some(req) = ctx.processor.next_to_preload_at(now).await? else {
        return Ok(false);
    };
    preload(ctx, &req).await?;
    Ok(true)
}

async fn preload(ctx: &WorkerContext, req: &SendRequest) -> Result<()> {
    let schedule = get_user_newsletter_schedule(
        &ctx.pool,
        &req.user_id,
        &req.language_code,
        req.utc_midnight(),
        &ctx.defaults,
    )
    .await
    .with_context(|| format!("resolving schedule for {}", req.id))?;

    if !schedule.is_send_requested() {
        info!(id = %req.id, "no send requested for day");
        return settle(ledger::mark_no_send_requested(&ctx.pool, &req.id).await, req, "mark_no_send_requested");
    }

    let input = PreloadInput {
        send_request_id: req.id.clone(),
        user_id: req.user_id.clone(),
        language_code: req.language_code.clone(),
        date_of_send: req.date_of_send,
        number_of_articles: schedule.number_of_articles(),
        content_topics: schedule.content_topics().to_vec(),
    };
    let body = ctx
        .renderer
        .render(&input)
        .await
        .with_context(|| format!("rendering {}", req.id))?;
    let payload = NewsletterPayload {
        send_request_id: input.send_request_id,
        user_id: input.user_id,
        language_code: input.language_code,
        date_of_send: input.date_of_send,
        number_of_articles: input.number_of_articles,
        content_topics: input.content_topics,
        body,
    };
    let bytes = serde_json::to_vec(&payload)?;
    ctx.store
        .put(&req.file_key(&ctx.environment), bytes)
        .await
        .with_context(|| format!("storing payload for {}", req.id))?;

    settle(ledger::mark_preloaded(&ctx.pool, &req.id).await, req, "mark_preloaded")?;
    info!(id = %req.id, user_id = %req.user_id, "payload ready");
    Ok(())
}

pub async fn process_next_fulfill(ctx: &WorkerContext) -> Result<bool> {
    process_next_fulfill_at(ctx, Utc::now()).await
}

/// Pop one row whose send time has arrived and deliver it.
#[instrument(skip_all)]
pub async fn process_next_fulfill_at(ctx: &WorkerContext, now: DateTime<Utc>) -> Result<bool> {
    let Some(req) = ctx.processor.next_to_fulfill_at(now).await? else {
        return Ok(false);
    };
    fulfill(ctx, &req, now).await?;
    Ok(true)
}

async fn fulfill(ctx: &WorkerContext, req: &SendRequest, now: DateTime<Utc>) -> Result<()> {
    let verified = ctx
        .directory
        .is_user_verified(&req.user_id)
        .await
        .with_context(|| format!("checking verification of {}", req.user_id))?;
    if !verified {
        info!(id = %req.id, user_id = %req.user_id, "user not verified; not sending");
        return settle(ledger::mark_unverified_user(&ctx.pool, &req.id).await, req, "mark_unverified_user");
    }

    match ledger::claim_for_send(&ctx.pool, &req.id, now, Duration::minutes(SEND_LEASE_MINUTES)).await {
        Ok(()) => {}
        Err(err) if err.is_conflict() => {
            warn!(id = %req.id, %err, "send already claimed; skipping");
            return Ok(());
        }
        Err(err) => return Err(err).with_context(|| format!("claiming {}", req.id)),
    }

    if let Err(err) = deliver(ctx, req).await {
        if let Err(release_err) = ledger::release_send_claim(&ctx.pool, &req.id).await {
            error!(id = %req.id, ?release_err, "failed to release send claim");
        }
        return Err(err);
    }
    settle(ledger::mark_sent(&ctx.pool, &req.id).await, req, "mark_sent")?;
    info!(id = %req.id, user_id = %req.user_id, "newsletter sent");
    Ok(())
}

async fn deliver(ctx: &WorkerContext, req: &SendRequest) -> Result<()> {
    let key = req.file_key(&ctx.environment);
    let bytes = ctx
        .store
        .get(&key)
        .await
        .with_context(|| format!("loading payload {key}"))?;
    let payload: NewsletterPayload =
        serde_json::from_slice(&bytes).with_context(|| format!("decoding payload {key}"))?;
    ctx.transport
        .send(req, &payload)
        .await
        .with_context(|| format!("sending {}", req.id))
}
