//! In-memory dispatch queues fed from the ledger.
//!
//! The processor keeps an ordered snapshot of the rows that still need a
//! preload (today and tomorrow) and the rows ready to send (today). Workers pop
//! from it; a pop is only a local reservation and the worker commits the status
//! through the ledger. The snapshot is rebuilt wholesale once it is older than
//! the resync interval, so rows whose worker failed come back on their own.
use crate::db::Pool;
use crate::ledger;
use crate::model::{PayloadStatus, SendRequest};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorSettings {
    /// Maximum snapshot age before the next pop resyncs.
    pub resync_interval: Duration,
    /// How far ahead of its send time a row may be preloaded.
    pub preload_lead: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            resync_interval: Duration::hours(3),
            preload_lead: Duration::hours(24),
        }
    }
}

#[derive(Debug, Default)]
struct QueueSnapshot {
    ordered_to_preload: VecDeque<SendRequest>,
    ordered_to_fulfill: VecDeque<SendRequest>,
    last_synced_at: Option<DateTime<Utc>>,
}

pub struct SendRequestProcessor {
    pool: Pool,
    settings: ProcessorSettings,
    state: Mutex<QueueSnapshot>,
}

fn sort_by_send_time(rows: &mut [SendRequest]) {
    rows.sort_by(|a, b| a.send_at().cmp(&b.send_at()).then_with(|| a.id.cmp(&b.id)));
}

impl SendRequestProcessor {
    /// Build the processor and take the first snapshot.
    pub async fn new(pool: Pool, settings: ProcessorSettings) -> Result<Self> {
        Self::new_at(pool, settings, Utc::now()).await
    }

    pub async fn new_at(pool: Pool, settings: ProcessorSettings, now: DateTime<Utc>) -> Result<Self> {
        let processor = Self {
            pool,
            settings,
            state: Mutex::new(QueueSnapshot::default()),
        };
        processor.force_resync_at(now).await?;
        Ok(processor)
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    pub async fn next_to_preload(&self) -> Result<Option<SendRequest>> {
        self.next_to_preload_at(Utc::now()).await
    }

    /// Pop the earliest row awaiting preload once it is inside the preload lead.
    pub async fn next_to_preload_at(&self, now: DateTime<Utc>) -> Result<Option<SendRequest>> {
        let mut state = self.state.lock().await;
        self.resync_if_stale(&mut state, now).await?;
        let due = state
            .ordered_to_preload
            .front()
            .is_some_and(|head| now >= head.send_at() - self.settings.preload_lead);
        Ok(if due { state.ordered_to_preload.pop_front() } else { None })
    }

    pub async fn next_to_fulfill(&self) -> Result<Option<SendRequest>> {
        self.next_to_fulfill_at(Utc::now()).await
    }

    /// Pop the earliest ready row whose send time has arrived.
    pub async fn next_to_fulfill_at(&self, now: DateTime<Utc>) -> Result<Option<SendRequest>> {
        let mut state = self.state.lock().await;
        self.resync_if_stale(&mut state, now).await?;
        let due = state
            .ordered_to_fulfill
            .front()
            .is_some_and(|head| now >= head.send_at());
        Ok(if due { state.ordered_to_fulfill.pop_front() } else { None })
    }

    pub async fn force_resync(&self) -> Result<()> {
        self.force_resync_at(Utc::now()).await
    }

    pub async fn force_resync_at(&self, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        *state = self.load_snapshot(now).await?;
        Ok(())
    }

    /// Queue lengths as (preload, fulfill).
    pub async fn pending(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        (state.ordered_to_preload.len(), state.ordered_to_fulfill.len())
    }

    async fn resync_if_stale(&self, state: &mut QueueSnapshot, now: DateTime<Utc>) -> Result<()> {
        let stale = match state.last_synced_at {
            Some(at) => now - at > self.settings.resync_interval,
            None => true,
        };
        if stale {
            *state = self.load_snapshot(now).await?;
        }
        Ok(())
    }

    #[instrument(skip_all)]
    async fn load_snapshot(&self, now: DateTime<Utc>) -> Result<QueueSnapshot> {
        let today = now.date_naive();
        let tomorrow = today
            .succ_opt()
            .context("date overflow computing tomorrow")?;

        let mut to_preload = Vec::new();
        for date in [today, tomorrow] {
            let rows = ledger::list_send_requests_for_day_with_status(&self.pool, date, PayloadStatus::NeedsPreload)
                .await
                .with_context(|| format!("loading rows to preload for {date}"))?;
            to_preload.extend(rows);
        }
        let mut to_fulfill =
            ledger::list_send_requests_for_day_with_status(&self.pool, today, PayloadStatus::PayloadReady)
                .await
                .with_context(|| format!("loading rows to fulfill for {today}"))?;
        sort_by_send_time(&mut to_preload);
        sort_by_send_time(&mut to_fulfill);

        info!(
            preload = to_preload.len(),
            fulfill = to_fulfill.len(),
            "processor resynced"
        );
        debug!(synced_at = %now, "processor snapshot replaced");
        Ok(QueueSnapshot {
            ordered_to_preload: to_preload.into(),
            ordered_to_fulfill: to_fulfill.into(),
            last_synced_at: Some(now),
        })
    }
}
