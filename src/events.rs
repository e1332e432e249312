use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

use crate::error::FailureReason;
use crate::types::SeriesKey;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Failure(FailureReason),
}

/// Result of one timed operation attempt. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    key: SeriesKey,
    ts: SystemTime,
    /// Absent when the attempt was abandoned at the sampler's own deadline.
    duration: Option<Duration>,
    outcome: Outcome,
}

impl SampleRecord {
    pub fn success(key: SeriesKey, ts: SystemTime, duration: Duration) -> Self {
        Self {
            key,
            ts,
            duration: Some(duration),
            outcome: Outcome::Success,
        }
    }

    pub fn failure(
        key: SeriesKey,
        ts: SystemTime,
        duration: Option<Duration>,
        reason: FailureReason,
    ) -> Self {
        Self {
            key,
            ts,
            duration,
            outcome: Outcome::Failure(reason),
        }
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn ts(&self) -> SystemTime {
        self.ts
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success)
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        match &self.outcome {
            Outcome::Success => None,
            Outcome::Failure(reason) => Some(reason),
        }
    }

    /// Duration in milliseconds, only for successful attempts.
    pub fn success_ms(&self) -> Option<f64> {
        if !self.is_success() {
            return None;
        }
        self.duration.map(duration_ms)
    }
}

pub(crate) fn duration_ms(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}
