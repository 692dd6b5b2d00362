//! Health surface: a single snapshot combining the scheduler's heartbeat
//! row with per-bucket scan staleness, for an operator-facing `health`
//! command or a future status endpoint.

use crate::pipeline::bucket_registry;
use crate::pipeline::model::BucketHealth;
use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub last_tick_at: Option<i64>,
    pub next_tick_at: Option<i64>,
    pub last_error: Option<String>,
    pub baseline_echo_total: i64,
    pub prev_echo_total: i64,
    pub buckets: Vec<BucketHealth>,
}

pub fn snapshot(conn: &Connection, now: i64, stale_horizon_seconds: i64) -> Result<HealthSnapshot> {
    let (last_tick_at, next_tick_at, last_error, baseline_echo_total, prev_echo_total) = conn
        .query_row(
            "SELECT last_tick_at, next_tick_at, last_error, baseline_echo_total, prev_echo_total
             FROM job_heartbeat WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, Option<i64>>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )
        .context("reading job heartbeat")?;

    let buckets = bucket_registry::get_bucket_health(conn, now, stale_horizon_seconds)?;

    Ok(HealthSnapshot {
        last_tick_at,
        next_tick_at,
        last_error,
        baseline_echo_total,
        prev_echo_total,
        buckets,
    })
}
