//! Admin operations: out-of-band maintenance driven by the CLI, never by
//! the scheduler loop.

use crate::pipeline::db::DbPool;
use crate::pipeline::provider::ProviderAdapter;
use crate::pipeline::{bucket_registry, poll_worker};
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// Refreshes every bucket's baseline in place, one at a time -- deliberately
/// sequential, since this is a rare operator-triggered op (after a provider
/// search-region change) rather than a latency-sensitive path.
pub async fn refresh_all_baselines(pool: &DbPool, adapter: Arc<dyn ProviderAdapter>, party_sizes: &[u32]) -> Result<usize> {
    let bucket_ids = all_bucket_ids(pool).await?;
    let mut refreshed = 0;
    for bucket_id in &bucket_ids {
        match poll_worker::refresh_baseline_in_place(pool, adapter.clone(), bucket_id, party_sizes).await {
            Ok(()) => {
                refreshed += 1;
                info!(bucket_id, "baseline refreshed");
            }
            Err(e) => warn!(bucket_id, error = %e, "baseline refresh failed, continuing"),
        }
    }
    Ok(refreshed)
}

/// Wipes every bucket, lease, and drop event. Projection rows and sessions
/// are left untouched; a subsequent daily job re-creates buckets and the
/// next poll on each re-bootstraps its baseline.
pub async fn reset_buckets(pool: &DbPool) -> Result<()> {
    let conn = pool.checkout().await?;
    bucket_registry::reset_all(&conn)?;
    info!("buckets reset");
    Ok(())
}

async fn all_bucket_ids(pool: &DbPool) -> Result<Vec<String>> {
    let conn = pool.checkout().await?;
    let mut stmt = conn.prepare("SELECT bucket_id FROM buckets ORDER BY bucket_id")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    rows.collect::<Result<_, _>>().map_err(Into::into)
}
