use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::metrics::series::LatencySeries;
use crate::metrics::stats::{LifetimeSummary, StatsSnapshot};
use crate::types::SeriesKey;

/// Snapshots of every known series, ordered by key for stable rendering.
pub type SnapshotBoard = BTreeMap<SeriesKey, StatsSnapshot>;

/// Owner of all latency series.
///
/// Sampling loops grab their `Arc<LatencySeries>` once at spawn time, so the map
/// itself is only touched when loops start and when the aggregator reads.
#[derive(Clone, Default)]
pub struct SeriesRegistry {
    window_cap: Option<usize>,
    series: Arc<DashMap<SeriesKey, Arc<LatencySeries>>>,
}

impl SeriesRegistry {
    pub fn new(window_cap: Option<usize>) -> Self {
        Self {
            window_cap,
            series: Arc::new(DashMap::new()),
        }
    }

    /// Returns the series for `key`, creating it on first use.
    pub fn series(&self, key: &SeriesKey) -> Arc<LatencySeries> {
        self.series
            .entry(key.clone())
            .or_insert_with(|| Arc::new(LatencySeries::new(key.clone(), self.window_cap)))
            .clone()
    }

    pub fn get(&self, key: &SeriesKey) -> Option<Arc<LatencySeries>> {
        self.series.get(key).map(|s| s.value().clone())
    }

    pub fn keys(&self) -> Vec<SeriesKey> {
        let mut keys: Vec<SeriesKey> = self.series.iter().map(|kv| kv.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn snapshot_all(&self) -> SnapshotBoard {
        // Clone the handles first so no shard lock is held while series locks are taken.
        let handles: Vec<Arc<LatencySeries>> =
            self.series.iter().map(|kv| kv.value().clone()).collect();
        handles
            .into_iter()
            .map(|s| (s.key().clone(), s.snapshot()))
            .collect()
    }

    pub fn lifetime_all(&self) -> BTreeMap<SeriesKey, Option<LifetimeSummary>> {
        let handles: Vec<Arc<LatencySeries>> =
            self.series.iter().map(|kv| kv.value().clone()).collect();
        handles
            .into_iter()
            .map(|s| (s.key().clone(), s.lifetime()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExchangeId, OperationKind, Transport};

    #[test]
    fn series_handles_are_shared() {
        let registry = SeriesRegistry::new(Some(10));
        let key = SeriesKey::new(ExchangeId("a".into()), OperationKind::Cancel, Transport::WebSocket);
        let first = registry.series(&key);
        let second = registry.series(&key);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.cap(), Some(10));
    }

    #[test]
    fn board_lists_registered_series_even_without_samples() {
        let registry = SeriesRegistry::new(None);
        let key = SeriesKey::new(ExchangeId("a".into()), OperationKind::Orderbook, Transport::Rest);
        registry.series(&key);
        let board = registry.snapshot_all();
        assert!(board[&key].is_no_data());
    }
}
