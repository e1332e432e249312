use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::events::SampleRecord;
use crate::metrics::stats::{Histo, LifetimeSummary, SampleCounts, StatsSnapshot};
use crate::types::SeriesKey;

#[derive(Debug, Default)]
struct SeriesState {
    records: VecDeque<SampleRecord>,
    counts: SampleCounts,
    lifetime: Histo,
}

/// Rolling window of samples for one (exchange, operation, transport).
///
/// A single mutex guards the window; writers hold it for one push (plus at most
/// one eviction), readers hold it only long enough to copy the successful
/// durations out.
#[derive(Debug)]
pub struct LatencySeries {
    key: SeriesKey,
    cap: Option<usize>,
    state: Mutex<SeriesState>,
}

impl LatencySeries {
    /// `cap = None` keeps every record; a cap of zero is treated as one.
    pub fn new(key: SeriesKey, cap: Option<usize>) -> Self {
        Self {
            key,
            cap: cap.map(|c| c.max(1)),
            state: Mutex::new(SeriesState::default()),
        }
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn cap(&self) -> Option<usize> {
        self.cap
    }

    pub fn record(&self, sample: SampleRecord) {
        let mut s = self.state.lock();
        if let Some(cap) = self.cap {
            while s.records.len() >= cap {
                let Some(evicted) = s.records.pop_front() else { break };
                s.counts.remove(evicted.is_success());
            }
        }
        if let Some(ms) = sample.success_ms() {
            s.lifetime.record_micros((ms * 1_000.0) as u64);
        }
        s.counts.add(sample.is_success());
        s.records.push_back(sample);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let (counts, successes) = {
            let s = self.state.lock();
            let successes: Vec<f64> = s.records.iter().filter_map(SampleRecord::success_ms).collect();
            (s.counts, successes)
        };
        StatsSnapshot::from_parts(counts, successes)
    }

    pub fn counts(&self) -> SampleCounts {
        self.state.lock().counts
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the stored records, oldest first.
    pub fn records(&self) -> Vec<SampleRecord> {
        self.state.lock().records.iter().cloned().collect()
    }

    pub fn lifetime(&self) -> Option<LifetimeSummary> {
        LifetimeSummary::from_histo(&self.state.lock().lifetime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FailureKind, FailureReason};
    use crate::types::{ExchangeId, OperationKind, Transport};
    use std::time::{Duration, SystemTime};

    fn key() -> SeriesKey {
        SeriesKey::new(ExchangeId("x".into()), OperationKind::Orderbook, Transport::Rest)
    }

    fn ok(ms: u64) -> SampleRecord {
        SampleRecord::success(key(), SystemTime::now(), Duration::from_millis(ms))
    }

    fn failed() -> SampleRecord {
        SampleRecord::failure(
            key(),
            SystemTime::now(),
            None,
            FailureReason::new(FailureKind::Timeout, "deadline"),
        )
    }

    #[test]
    fn eviction_keeps_counts_consistent() {
        let series = LatencySeries::new(key(), Some(2));
        series.record(failed());
        series.record(ok(5));
        series.record(ok(6));
        let counts = series.counts();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.successes, 2);
        assert_eq!(counts.failures, 0);
    }

    #[test]
    fn lifetime_survives_eviction() {
        let series = LatencySeries::new(key(), Some(1));
        series.record(ok(5));
        series.record(ok(7));
        assert_eq!(series.len(), 1);
        assert_eq!(series.lifetime().unwrap().successes, 2);
    }

    #[test]
    fn zero_cap_is_clamped() {
        let series = LatencySeries::new(key(), Some(0));
        series.record(ok(1));
        assert_eq!(series.cap(), Some(1));
        assert_eq!(series.len(), 1);
    }
}
