//! Database module: row models and SQL repositories.
//!
//! - `model`: rows returned by the schedule queries.
//! - `repo`: pool setup, migrations and the `users` table.
//! - `schedules`: per-user schedule and per-weekday rows.
//! - `send_requests`: the send-request ledger tables.
//!
//! The pool and user helpers are re-exported at `crate::db::*`.

pub mod model;
pub mod repo;
pub mod schedules;
pub mod send_requests;

pub use repo::*;

pub use model::{ScheduleDayRow, ScheduleRow};

/// Single-connection in-memory pool with migrations applied.
#[cfg(test)]
pub(crate) async fn test_pool() -> Pool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}
