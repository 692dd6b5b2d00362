//! Provider Adapter contract.
//!
//! `provider_id` is stamped into every fingerprint and event so that
//! cross-provider data never collides. The registry is a plain map built
//! once at startup; no dynamic attribute lookup, no global mutable
//! dictionary.

pub mod seated;

use crate::pipeline::error::PipelineError;
use crate::pipeline::model::NormalizedSlot;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable identifier stamped into every slot fingerprint from this
    /// provider. Must never change for a live deployment.
    fn provider_id(&self) -> &'static str;

    /// Fetches normalized slots for one bucket's time anchor, expanding the
    /// anchor into a +/-2h search window and merging pages internally.
    /// Must not be called from inside a write transaction -- this is a
    /// network call and can run long.
    async fn fetch(
        &self,
        date_str: &str,
        time_anchor: &str,
        party_sizes: &[u32],
    ) -> Result<Vec<NormalizedSlot>, PipelineError>;
}

#[derive(Clone)]
pub struct ProviderRegistry {
    adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider_id(), adapter);
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider_id).cloned()
    }

    pub fn provider_ids(&self) -> Vec<&'static str> {
        self.adapters.keys().copied().collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Expands a `HH:MM` time anchor into a `[start, end)` search window of
/// +/-2 hours, as whole-minute offsets from midnight. Shared by adapter
/// implementations so the window policy lives in one place.
pub fn expand_anchor_window(time_anchor: &str) -> Option<(i64, i64)> {
    let mut parts = time_anchor.splitn(2, ':');
    let hour: i64 = parts.next()?.parse().ok()?;
    let minute: i64 = parts.next()?.parse().ok()?;
    let anchor_minutes = hour * 60 + minute;
    Some((anchor_minutes - 120, anchor_minutes + 120))
}

pub const DEFAULT_ADAPTER_TIMEOUT: Duration = Duration::from_secs(12);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_window_expands_by_two_hours_each_side() {
        let (start, end) = expand_anchor_window("19:00").unwrap();
        assert_eq!(start, 17 * 60);
        assert_eq!(end, 21 * 60);
    }

    #[test]
    fn malformed_anchor_returns_none() {
        assert!(expand_anchor_window("not-a-time").is_none());
    }

    #[test]
    fn registry_looks_up_by_provider_id() {
        let registry = ProviderRegistry::new();
        assert!(registry.get("seated").is_none());
        assert!(registry.provider_ids().is_empty());
    }
}
