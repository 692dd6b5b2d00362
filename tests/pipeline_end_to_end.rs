//! End-to-end integration test: bootstrap a bucket, poll through a drop and
//! a close, run the daily job, and confirm metrics land.

use async_trait::async_trait;
use chrono::TimeZone;
use reservation_watchdog::pipeline::db::DbPool;
use reservation_watchdog::pipeline::error::PipelineError;
use reservation_watchdog::pipeline::model::{NormalizedSlot, SlotPayload};
use reservation_watchdog::pipeline::provider::ProviderAdapter;
use reservation_watchdog::pipeline::{aggregator, bucket_registry, poll_worker};
use std::sync::Arc;
use tokio::sync::Mutex;

struct ScriptedAdapter {
    responses: Mutex<Vec<Vec<NormalizedSlot>>>,
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn provider_id(&self) -> &'static str {
        "seated"
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

fn slot(venue_id: i64, venue_name: &str, hour: u32) -> NormalizedSlot {
    let t = chrono::Utc
        .with_ymd_and_hms(2026, 2, 18, hour, 0, 0)
        .unwrap();
    NormalizedSlot {
        slot_id: reservation_watchdog::pipeline::fingerprint::slot_id("seated", venue_id, t),
        venue_id,
        venue_name: venue_name.to_string(),
        actual_time: t,
        payload: SlotPayload::default(),
    }
}

#[tokio::test]
async fn full_lifecycle_bootstrap_drop_close_aggregate() {
    let pool = DbPool::open_memory().unwrap();
    let bucket_id = "2026-02-18_19:00";

    {
        let conn = pool.checkout().await.unwrap();
        bucket_registry::ensure_buckets(&conn, &["2026-02-18".to_string()], &["19:00".to_string()]).unwrap();
    }

    let adapter: Arc<dyn ProviderAdapter> = Arc::new(ScriptedAdapter {
        responses: Mutex::new(vec![
            vec![slot(1, "Original Venue", 19)],
            vec![slot(1, "Original Venue", 19), slot(2, "New Venue", 20)],
            vec![slot(1, "Original Venue", 19)],
        ]),
    });

    // 1. bootstrap: baseline = {venue 1's slot}, no events.
    let outcome = poll_worker::poll(&pool, adapter.clone(), bucket_id, &[2], 30, "w1")
        .await
        .unwrap();
    assert!(matches!(outcome, poll_worker::PollOutcome::Bootstrapped { slot_count: 1 }));

    // 2. new venue appears: exactly one NEW_DROP.
    let outcome = poll_worker::poll(&pool, adapter.clone(), bucket_id, &[2], 30, "w1")
        .await
        .unwrap();
    match outcome {
        poll_worker::PollOutcome::Applied { new_drops, closed, .. } => {
            assert_eq!(new_drops, 1);
            assert_eq!(closed, 0);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    // 3. new venue's slot disappears again: one CLOSED, session duration recorded.
    let outcome = poll_worker::poll(&pool, adapter.clone(), bucket_id, &[2], 30, "w1")
        .await
        .unwrap();
    match outcome {
        poll_worker::PollOutcome::Applied { new_drops, closed, .. } => {
            assert_eq!(new_drops, 0);
            assert_eq!(closed, 1);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    // 4. aggregator rolls the closed session into venue 2's metrics.
    let conn = pool.checkout().await.unwrap();
    let updated = aggregator::run(&conn, "2026-02-19", "2026-02-18", 999_999).unwrap();
    assert_eq!(updated, 1);

    let new_drop_count: i64 = conn
        .query_row(
            "SELECT new_drop_count FROM venue_metrics WHERE venue_id = 2",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(new_drop_count, 1);

    // event log is append-only and holds both events for this slot.
    let event_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM drop_events WHERE venue_id = 2",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(event_count, 2);
}
