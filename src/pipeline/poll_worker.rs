//! Poll Worker -- the central component. One call to `poll` performs the
//! full fetch -> diff -> emit -> apply cycle for a single bucket under its
//! per-bucket lease.

use crate::pipeline::db::DbPool;
use crate::pipeline::events;
use crate::pipeline::model::{DropEvent, EventType, NormalizedSlot, PollInvariants, TimeBucket};
use crate::pipeline::projection;
use crate::pipeline::provider::ProviderAdapter;
use crate::pipeline::sessions;
use crate::pipeline::{bucket_registry, error::PipelineError};
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// Another worker already holds this bucket's lease.
    LeaseContended,
    /// Provider fetch failed; bucket state untouched.
    FetchFailed { retried: bool },
    /// First successful poll on a fresh bucket: baseline written, nothing
    /// else emitted.
    Bootstrapped { slot_count: usize },
    /// Normal poll: diff computed and applied.
    Applied {
        new_drops: usize,
        closed: usize,
        invariants: PollInvariants,
    },
}

fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// Tries to acquire the per-bucket lease via `INSERT ... ON CONFLICT DO
/// NOTHING`. Only the inserting process proceeds; everyone else gets back
/// `false` and skips this bucket for the tick.
fn acquire_lease(conn: &Connection, bucket_id: &str, holder: &str, now: i64) -> Result<bool> {
    let n = conn.execute(
        "INSERT INTO bucket_leases (bucket_id, holder, acquired_at) VALUES (?1, ?2, ?3)
         ON CONFLICT (bucket_id) DO NOTHING",
        params![bucket_id, holder, now],
    )?;
    Ok(n > 0)
}

fn release_lease(conn: &Connection, bucket_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM bucket_leases WHERE bucket_id = ?1",
        params![bucket_id],
    )?;
    Ok(())
}

/// Runs one full poll cycle for `bucket_id`. Never returns an `Err` for
/// provider or idempotency failures -- those are reported via
/// `PollOutcome` or logged, since no single bucket's trouble should stop
/// the scheduler from polling everything else. `Err` is reserved for
/// DB-layer failures the caller should surface.
pub async fn poll(
    pool: &DbPool,
    adapter: Arc<dyn ProviderAdapter>,
    bucket_id: &str,
    party_sizes: &[u32],
    dedupe_minutes: i64,
    holder: &str,
) -> Result<PollOutcome> {
    let (date_str, time_slot) = bucket_id
        .split_once('_')
        .with_context(|| format!("malformed bucket id {bucket_id}"))?;
    let date_str = date_str.to_string();
    let time_slot = time_slot.to_string();

    {
        let conn = pool.checkout().await?;
        if !acquire_lease(&conn, bucket_id, holder, now_unix())? {
            debug!(bucket_id, "lease contended, skipping");
            return Ok(PollOutcome::LeaseContended);
        }
    }

    let outcome = poll_under_lease(pool, adapter, bucket_id, &date_str, &time_slot, party_sizes, dedupe_minutes).await;

    {
        let conn = pool.checkout().await?;
        release_lease(&conn, bucket_id)?;
    }

    outcome
}

async fn poll_under_lease(
    pool: &DbPool,
    adapter: Arc<dyn ProviderAdapter>,
    bucket_id: &str,
    date_str: &str,
    time_slot: &str,
    party_sizes: &[u32],
    dedupe_minutes: i64,
) -> Result<PollOutcome> {
    // Step 2: network fetch, outside any DB transaction.
    let fetch_result = adapter.fetch(date_str, time_slot, party_sizes).await;

    let slots = match fetch_result {
        Ok(slots) => slots,
        Err(e) => {
            warn!(bucket_id, error = %e, "provider fetch failed");
            let conn = pool.checkout().await?;
            bucket_registry::record_error(&conn, bucket_id, &e.to_string())?;
            return Ok(PollOutcome::FetchFailed {
                retried: e.is_retryable(),
            });
        }
    };

    // Step 3: normalize -> curr_set, plus lookup maps for venue id/name.
    let mut venue_of: HashMap<String, i64> = HashMap::new();
    let mut venue_name_of: HashMap<String, String> = HashMap::new();
    let mut slot_of: HashMap<String, NormalizedSlot> = HashMap::new();
    let curr_set: HashSet<String> = slots
        .into_iter()
        .map(|s| {
            venue_of.insert(s.slot_id.clone(), s.venue_id);
            venue_name_of.insert(s.slot_id.clone(), s.venue_name.clone());
            let id = s.slot_id.clone();
            slot_of.insert(id.clone(), s);
            id
        })
        .collect();

    let now = now_unix();
    let conn = pool.checkout().await?;

    // Step 4: read bucket state.
    let bucket = bucket_registry::load_bucket(&conn, bucket_id)?
        .with_context(|| format!("bucket {bucket_id} missing from registry"))?;

    // Step 5: baseline bootstrap.
    if !bucket.is_initialized() {
        let baseline_venue_ids: HashSet<i64> = venue_of.values().copied().collect();
        bucket_registry::bootstrap_baseline(&conn, bucket_id, &curr_set, &baseline_venue_ids, now)?;
        info!(bucket_id, slot_count = curr_set.len(), "baseline bootstrapped");
        return Ok(PollOutcome::Bootstrapped {
            slot_count: curr_set.len(),
        });
    }

    let baseline_set = bucket.baseline_slot_ids.clone().unwrap_or_default();
    let baseline_venue_ids = bucket.baseline_venue_ids.clone().unwrap_or_default();
    let prev_set = bucket.prev_slot_ids.clone().unwrap_or_default();

    // Step 6: diffs. The emit set applies the "venue had zero slots, now
    // has one" rule at venue granularity (see DESIGN.md): a slot only
    // counts as a true drop if its venue had no presence in the baseline
    // at all, not merely if this exact slot fingerprint was absent.
    let added: Vec<String> = curr_set.difference(&prev_set).cloned().collect();
    let closed: Vec<String> = prev_set.difference(&curr_set).cloned().collect();
    let emit_set: Vec<String> = added
        .iter()
        .filter(|s| {
            let venue_id = venue_of.get(*s).copied().unwrap_or_default();
            !baseline_venue_ids.contains(&venue_id) && !baseline_set.contains(*s)
        })
        .cloned()
        .collect();

    let invariants = PollInvariants {
        baseline_echo: emit_set.iter().filter(|s| baseline_set.contains(*s)).count(),
        prev_echo: emit_set.iter().filter(|s| prev_set.contains(*s)).count(),
    };

    // Step 7: TTL dedupe.
    let mut to_insert_new = Vec::new();
    for slot_id in &emit_set {
        if !events::has_recent_new_drop(&conn, bucket_id, slot_id, now, dedupe_minutes)? {
            to_insert_new.push(slot_id.clone());
        }
    }

    // Step 8: build CLOSED events via one batch query.
    let latest_opened = events::latest_new_drop_opened_at(&conn, bucket_id, &closed)?;
    let mut closed_events = Vec::new();
    for slot_id in &closed {
        if let Some(&opened_at) = latest_opened.get(slot_id) {
            closed_events.push((slot_id.clone(), opened_at));
        }
        // else: closed outside this pipeline's memory -- nothing to skip.
    }

    // Step 9: short write transaction, no network I/O.
    conn.execute("BEGIN IMMEDIATE", [])
        .context("beginning poll write txn")?;

    let write_result = (|| -> Result<(usize, usize)> {
        let mut new_drops_written = 0;
        for slot_id in &to_insert_new {
            let slot = slot_of.get(slot_id);
            let venue_id = venue_of.get(slot_id).copied().unwrap_or_default();
            let venue_name = venue_name_of.get(slot_id).cloned().unwrap_or_default();
            let opened_at_dt = chrono::DateTime::from_timestamp(now, 0).unwrap_or_else(Utc::now);
            let hour: u32 = opened_at_dt.format("%H").to_string().parse().unwrap_or(0);
            let event = DropEvent {
                dedupe_key: events::dedupe_key(bucket_id, slot_id, opened_at_dt),
                bucket_id: bucket_id.to_string(),
                slot_id: slot_id.clone(),
                venue_id,
                venue_name,
                opened_at: now,
                event_type: EventType::NewDrop,
                closed_at: None,
                duration_seconds: None,
                time_bucket: TimeBucket::classify(hour),
                slot_date: date_str.to_string(),
                slot_time: time_slot.to_string(),
                payload: slot
                    .and_then(|s| serde_json::to_string(&s.payload).ok())
                    .unwrap_or_else(|| "{}".to_string()),
            };
            if events::insert_event(&conn, &event)? {
                new_drops_written += 1;
            }
        }

        let mut closed_written = 0;
        for (slot_id, opened_at) in &closed_events {
            let venue_id = venue_of.get(slot_id).copied().unwrap_or_else(|| {
                // venue id not in the current fetch (it just disappeared); fall
                // back to what the projection already has on file.
                conn.query_row(
                    "SELECT venue_id FROM projection WHERE bucket_id = ?1 AND slot_id = ?2",
                    params![bucket_id, slot_id],
                    |row| row.get(0),
                )
                .unwrap_or_default()
            });
            let venue_name = venue_name_of.get(slot_id).cloned().unwrap_or_default();
            let closed_at_dt = chrono::DateTime::from_timestamp(now, 0).unwrap_or_else(Utc::now);
            let duration = now - opened_at;
            let hour: u32 = closed_at_dt.format("%H").to_string().parse().unwrap_or(0);
            let event = DropEvent {
                dedupe_key: events::dedupe_key(bucket_id, slot_id, closed_at_dt),
                bucket_id: bucket_id.to_string(),
                slot_id: slot_id.clone(),
                venue_id,
                venue_name,
                opened_at: *opened_at,
                event_type: EventType::Closed,
                closed_at: Some(now),
                duration_seconds: Some(duration),
                time_bucket: TimeBucket::classify(hour),
                slot_date: date_str.to_string(),
                slot_time: time_slot.to_string(),
                payload: "{}".to_string(),
            };
            if events::insert_event(&conn, &event)? {
                closed_written += 1;
            }
        }

        // Projection upserts.
        projection::open_slots(&conn, bucket_id, |s| venue_of.get(s).copied().unwrap_or_default(), &added, now)?;
        projection::close_slots(&conn, bucket_id, &closed, now)?;

        // Sessions.
        for slot_id in &added {
            let venue_id = venue_of.get(slot_id).copied().unwrap_or_default();
            sessions::open_if_absent(&conn, bucket_id, slot_id, venue_id, now)?;
        }
        for slot_id in &closed {
            sessions::close_open(&conn, bucket_id, slot_id, now)?;
        }

        // prev_slot_ids / scanned_at.
        bucket_registry::update_prev(&conn, bucket_id, &curr_set, now)?;

        Ok((new_drops_written, closed_written))
    })();

    let (new_drops, closed_count) = match write_result {
        Ok(counts) => {
            conn.execute("COMMIT", [])?;
            counts
        }
        Err(e) => {
            let _ = conn.execute("ROLLBACK", []);
            return Err(e);
        }
    };

    if invariants.baseline_echo != 0 || invariants.prev_echo != 0 {
        warn!(
            bucket_id,
            baseline_echo = invariants.baseline_echo,
            prev_echo = invariants.prev_echo,
            "poll invariant violation"
        );
    }

    Ok(PollOutcome::Applied {
        new_drops,
        closed: closed_count,
        invariants,
    })
}

/// Out-of-band admin op: forces `baseline = prev = curr` for a bucket
/// without emitting events. Used after a provider search-region change, so
/// the next regular poll doesn't mistake the whole region for a fresh drop.
pub async fn refresh_baseline_in_place(
    pool: &DbPool,
    adapter: Arc<dyn ProviderAdapter>,
    bucket_id: &str,
    party_sizes: &[u32],
) -> Result<()> {
    let (date_str, time_slot) = bucket_id
        .split_once('_')
        .with_context(|| format!("malformed bucket id {bucket_id}"))?;

    let slots = adapter
        .fetch(date_str, time_slot, party_sizes)
        .await
        .map_err(|e| anyhow::anyhow!("refresh baseline fetch failed: {e}"))?;
    let baseline_venue_ids: HashSet<i64> = slots.iter().map(|s| s.venue_id).collect();
    let curr_set: HashSet<String> = slots.into_iter().map(|s| s.slot_id).collect();

    let conn = pool.checkout().await?;
    bucket_registry::bootstrap_baseline(&conn, bucket_id, &curr_set, &baseline_venue_ids, now_unix())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::PipelineError;
    use crate::pipeline::model::SlotPayload;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use tokio::sync::Mutex as TokioMutex;

    struct ScriptedAdapter {
        responses: TokioMutex<Vec<Vec<NormalizedSlot>>>,
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn provider_id(&self) -> &'static str {
            "p"
        }

        async fn fetch(
            &self,
            _date_str: &str,
            _time_anchor: &str,
            _party_sizes: &[u32],
        ) -> Result<Vec<NormalizedSlot>, PipelineError> {
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                return Ok(Vec::new());
            }
            Ok(responses.remove(0))
        }
    }

    fn slot(venue_id: i64, venue_name: &str, hour: u32, minute: u32) -> NormalizedSlot {
        let t = Utc.with_ymd_and_hms(2026, 2, 18, hour, minute, 0).unwrap();
        NormalizedSlot {
            slot_id: crate::pipeline::fingerprint::slot_id("p", venue_id, t),
            venue_id,
            venue_name: venue_name.to_string(),
            actual_time: t,
            payload: SlotPayload::default(),
        }
    }

    async fn setup_bucket(pool: &DbPool, bucket_id: &str) {
        let conn = pool.checkout().await.unwrap();
        crate::pipeline::bucket_registry::ensure_buckets(
            &conn,
            &["2026-02-18".to_string()],
            &["19:00".to_string()],
        )
        .unwrap();
        drop(conn);
        let _ = bucket_id;
    }

    #[tokio::test]
    async fn first_poll_bootstraps_baseline_with_no_events() {
        let pool = DbPool::open_memory().unwrap();
        let bucket_id = "2026-02-18_19:00";
        setup_bucket(&pool, bucket_id).await;

        let adapter: Arc<dyn ProviderAdapter> = Arc::new(ScriptedAdapter {
            responses: TokioMutex::new(vec![vec![
                slot(42, "Venue A", 19, 0),
                slot(42, "Venue A", 20, 30),
            ]]),
        });

        let outcome = poll(&pool, adapter, bucket_id, &[2], 30, "worker-1")
            .await
            .unwrap();

        match outcome {
            PollOutcome::Bootstrapped { slot_count } => assert_eq!(slot_count, 2),
            other => panic!("expected bootstrap, got {other:?}"),
        }

        let conn = pool.checkout().await.unwrap();
        let event_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM drop_events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(event_count, 0);
    }

    #[tokio::test]
    async fn existing_venue_gain_does_not_emit_new_drop() {
        let pool = DbPool::open_memory().unwrap();
        let bucket_id = "2026-02-18_19:00";
        setup_bucket(&pool, bucket_id).await;

        let adapter: Arc<dyn ProviderAdapter> = Arc::new(ScriptedAdapter {
            responses: TokioMutex::new(vec![
                vec![slot(42, "Venue A", 19, 0)],
                vec![slot(42, "Venue A", 19, 0), slot(42, "Venue A", 21, 0)],
            ]),
        });

        poll(&pool, adapter.clone(), bucket_id, &[2], 30, "worker-1")
            .await
            .unwrap();
        let outcome = poll(&pool, adapter, bucket_id, &[2], 30, "worker-1")
            .await
            .unwrap();

        match outcome {
            PollOutcome::Applied {
                new_drops,
                invariants,
                ..
            } => {
                assert_eq!(new_drops, 0, "existing-venue gain must not emit NEW_DROP");
                assert_eq!(invariants.baseline_echo, 0);
                assert_eq!(invariants.prev_echo, 0);
            }
            other => panic!("expected applied, got {other:?}"),
        }

        let conn = pool.checkout().await.unwrap();
        let open_sessions: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sessions WHERE closed_at IS NULL",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(open_sessions, 2, "both times should have open sessions");
    }

    #[tokio::test]
    async fn first_slot_for_new_venue_emits_new_drop_and_opens_session() {
        let pool = DbPool::open_memory().unwrap();
        let bucket_id = "2026-02-18_19:00";
        setup_bucket(&pool, bucket_id).await;

        let adapter: Arc<dyn ProviderAdapter> = Arc::new(ScriptedAdapter {
            responses: TokioMutex::new(vec![
                vec![slot(42, "Venue A", 19, 0)],
                vec![slot(42, "Venue A", 19, 0), slot(99, "Venue B", 20, 0)],
            ]),
        });

        poll(&pool, adapter.clone(), bucket_id, &[2], 30, "worker-1")
            .await
            .unwrap();
        let outcome = poll(&pool, adapter, bucket_id, &[2], 30, "worker-1")
            .await
            .unwrap();

        match outcome {
            PollOutcome::Applied { new_drops, .. } => assert_eq!(new_drops, 1),
            other => panic!("expected applied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_dispatch_for_same_bucket_only_one_writes() {
        let pool = DbPool::open_memory().unwrap();
        let bucket_id = "2026-02-18_19:00";
        setup_bucket(&pool, bucket_id).await;

        // simulate a lease already held by stamping it directly.
        {
            let conn = pool.checkout().await.unwrap();
            conn.execute(
                "INSERT INTO bucket_leases (bucket_id, holder, acquired_at) VALUES (?1, 'other', 0)",
                params![bucket_id],
            )
            .unwrap();
        }

        let adapter: Arc<dyn ProviderAdapter> = Arc::new(ScriptedAdapter {
            responses: TokioMutex::new(vec![vec![slot(42, "Venue A", 19, 0)]]),
        });

        let outcome = poll(&pool, adapter, bucket_id, &[2], 30, "worker-2")
            .await
            .unwrap();
        assert!(matches!(outcome, PollOutcome::LeaseContended));

        let conn = pool.checkout().await.unwrap();
        let baseline: Option<String> = conn
            .query_row(
                "SELECT baseline_slot_ids FROM buckets WHERE bucket_id = ?1",
                params![bucket_id],
                |r| r.get(0),
            )
            .unwrap();
        assert!(baseline.is_none(), "second worker must not have written state");
    }

    #[tokio::test]
    async fn empty_response_closes_everything_previously_open() {
        let pool = DbPool::open_memory().unwrap();
        let bucket_id = "2026-02-18_19:00";
        setup_bucket(&pool, bucket_id).await;

        let adapter: Arc<dyn ProviderAdapter> = Arc::new(ScriptedAdapter {
            responses: TokioMutex::new(vec![
                vec![slot(42, "Venue A", 19, 0)],
                vec![slot(42, "Venue A", 19, 0), slot(99, "Venue B", 20, 0)],
                vec![],
            ]),
        });

        poll(&pool, adapter.clone(), bucket_id, &[2], 30, "w").await.unwrap();
        poll(&pool, adapter.clone(), bucket_id, &[2], 30, "w").await.unwrap();
        let outcome = poll(&pool, adapter, bucket_id, &[2], 30, "w").await.unwrap();

        match outcome {
            PollOutcome::Applied { closed, .. } => assert_eq!(closed, 1),
            other => panic!("expected applied, got {other:?}"),
        }

        let conn = pool.checkout().await.unwrap();
        let open_sessions: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sessions WHERE closed_at IS NULL",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(open_sessions, 0);
    }
}
