//! Retention sweep: retire send requests past the retention period and drop
//! their payload blobs.
use crate::db::Pool;
use crate::ledger;
use crate::model::{PayloadStatus, SendRequest};
use crate::payload::PayloadStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub deleted: usize,
    /// Rows retired while still waiting on preload or delivery.
    pub stuck: usize,
    pub failed: usize,
}

/// Retire every non-deleted row created at or before `older_than`.
///
/// Rows are handled one at a time; a failure is logged and counted and the
/// sweep moves on. Only the listing query can fail the whole sweep.
#[instrument(skip_all, fields(older_than = %older_than))]
pub async fn sweep_expired_requests(
    pool: &Pool,
    store: &dyn PayloadStore,
    environment: &str,
    older_than: DateTime<Utc>,
) -> Result<SweepReport> {
    let rows = ledger::list_non_deleted_send_requests_older_than(pool, older_than).await?;
    let mut report = SweepReport {
        examined: rows.len(),
        ..SweepReport::default()
    };
    for req in &rows {
        let stuck = req.payload_status.is_outstanding();
        match retire(pool, store, environment, req).await {
            Ok(()) => {
                report.deleted += 1;
                if stuck {
                    report.stuck += 1;
                }
            }
            Err(err) => {
                report.failed += 1;
                error!(id = %req.id, status = %req.payload_status, ?err, "failed to retire send request");
            }
        }
    }
    info!(
        examined = report.examined,
        deleted = report.deleted,
        stuck = report.stuck,
        failed = report.failed,
        "retention sweep finished"
    );
    Ok(report)
}

async fn retire(
    pool: &Pool,
    store: &dyn PayloadStore,
    environment: &str,
    req: &SendRequest,
) -> Result<()> {
    match req.payload_status {
        // Blob first, so a failed delete leaves the row for the next sweep.
        PayloadStatus::Sent => {
            store.delete(&req.file_key(environment)).await?;
            ledger::retire_expired(pool, &req.id, req.payload_status).await?;
        }
        PayloadStatus::NeedsPreload | PayloadStatus::PayloadReady => {
            warn!(
                id = %req.id,
                status = %req.payload_status,
                date = %req.date_of_send,
                "send request never completed; force deleting"
            );
            store.delete(&req.file_key(environment)).await?;
            ledger::retire_expired(pool, &req.id, req.payload_status).await?;
        }
        PayloadStatus::NoSendRequested | PayloadStatus::UnverifiedUser => {
            ledger::retire_expired(pool, &req.id, req.payload_status).await?;
        }
        PayloadStatus::Deleted => {}
    }
    Ok(())
}
