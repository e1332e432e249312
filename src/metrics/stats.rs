use hdrhistogram::Histogram;
use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SampleCounts {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
}

impl SampleCounts {
    /// Fraction of attempts that failed; `None` before the first attempt.
    pub fn failure_rate(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some((self.failures as f64) / (self.total as f64))
    }

    pub(crate) fn add(&mut self, success: bool) {
        self.total += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
    }

    pub(crate) fn remove(&mut self, success: bool) {
        self.total -= 1;
        if success {
            self.successes -= 1;
        } else {
            self.failures -= 1;
        }
    }
}

/// Descriptive statistics over successful durations, in milliseconds.
///
/// Percentiles (median included) interpolate linearly between the two closest
/// ranks of the ascending sample, rank = q * (n - 1). Standard deviation is the
/// population one (divides by n).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LatencyStats {
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub stddev_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl LatencyStats {
    pub fn from_durations_ms(mut values: Vec<f64>) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        Some(Self {
            min_ms: values[0],
            max_ms: values[values.len() - 1],
            mean_ms: mean,
            median_ms: percentile(&values, 0.50),
            stddev_ms: variance.sqrt(),
            p95_ms: percentile(&values, 0.95),
            p99_ms: percentile(&values, 0.99),
        })
    }
}

/// Linear-interpolation percentile over an ascending, non-empty slice.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    let last = sorted.len() - 1;
    let rank = q.clamp(0.0, 1.0) * last as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let (a, b) = (sorted[lo], sorted[hi]);
    if lo == hi {
        return a;
    }
    let frac = rank - lo as f64;
    (a + (b - a) * frac).max(a).min(b)
}

/// Point-in-time view of one latency series.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StatsSnapshot {
    /// No operation was attempted yet.
    NoData,
    /// Attempts happened but none succeeded, so latency is undefined.
    InsufficientData {
        counts: SampleCounts,
        failure_rate: f64,
    },
    Ready {
        counts: SampleCounts,
        failure_rate: f64,
        latency: LatencyStats,
    },
}

impl StatsSnapshot {
    pub fn from_parts(counts: SampleCounts, successes_ms: Vec<f64>) -> Self {
        let Some(failure_rate) = counts.failure_rate() else {
            return StatsSnapshot::NoData;
        };
        match LatencyStats::from_durations_ms(successes_ms) {
            Some(latency) => StatsSnapshot::Ready {
                counts,
                failure_rate,
                latency,
            },
            None => StatsSnapshot::InsufficientData {
                counts,
                failure_rate,
            },
        }
    }

    pub fn counts(&self) -> SampleCounts {
        match self {
            StatsSnapshot::NoData => SampleCounts::default(),
            StatsSnapshot::InsufficientData { counts, .. } | StatsSnapshot::Ready { counts, .. } => {
                *counts
            }
        }
    }

    pub fn failure_rate(&self) -> Option<f64> {
        match self {
            StatsSnapshot::NoData => None,
            StatsSnapshot::InsufficientData { failure_rate, .. }
            | StatsSnapshot::Ready { failure_rate, .. } => Some(*failure_rate),
        }
    }

    pub fn latency(&self) -> Option<&LatencyStats> {
        match self {
            StatsSnapshot::Ready { latency, .. } => Some(latency),
            _ => None,
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, StatsSnapshot::NoData)
    }

    pub fn is_insufficient(&self) -> bool {
        matches!(self, StatsSnapshot::InsufficientData { .. })
    }
}

/// One hour; slower successes are recorded at this ceiling.
pub const HISTO_MAX_MICROS: u64 = 3_600_000_000;

/// Successful durations in microseconds, 3 significant digits, bounded to
/// `[1, HISTO_MAX_MICROS]`.
#[derive(Clone, Debug)]
pub struct Histo {
    inner: Histogram<u64>,
}

impl Default for Histo {
    fn default() -> Self {
        Self::micros()
    }
}

impl Histo {
    pub fn micros() -> Self {
        Self {
            inner: Histogram::new_with_bounds(1, HISTO_MAX_MICROS, 3).expect("constant histogram bounds"),
        }
    }

    pub fn record_micros(&mut self, us: u64) {
        self.inner.saturating_record(us.clamp(1, HISTO_MAX_MICROS));
    }

    pub fn p50(&self) -> u64 {
        self.inner.value_at_quantile(0.50)
    }

    pub fn p99(&self) -> u64 {
        self.inner.value_at_quantile(0.99)
    }

    pub fn max(&self) -> u64 {
        self.inner.max()
    }

    pub fn count(&self) -> u64 {
        self.inner.len()
    }
}

/// Whole-run summary of successful durations, unaffected by window eviction.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LifetimeSummary {
    pub successes: u64,
    pub p50_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl LifetimeSummary {
    pub fn from_histo(histo: &Histo) -> Option<Self> {
        if histo.count() == 0 {
            return None;
        }
        Some(Self {
            successes: histo.count(),
            p50_ms: histo.p50() as f64 / 1_000.0,
            p99_ms: histo.p99() as f64 / 1_000.0,
            max_ms: histo.max() as f64 / 1_000.0,
        })
    }
}
