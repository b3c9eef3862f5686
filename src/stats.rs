//! Streaming statistics: whole-run `{count, sum, min, max}` aggregates and
//! the periodic bitrate sampling discipline shared by both sides of a test.
//!
//! Everything here is O(1) memory. Averages are recomputed from the running
//! sum on every read rather than stored, so they cannot drift from the
//! accumulators they derive from. There is no windowing or decay.

use crate::defaults;
use serde::Serialize;

/// Running aggregate over signed timing deltas (microseconds).
///
/// `min` starts at the maximum representable value so the first sample always
/// replaces it; `max` starts at zero, symmetrically. Non-positive samples are
/// valid input: clock anomalies are absorbed by the aggregate, never excluded.
#[derive(Debug, Clone, Copy)]
pub struct DeltaStats {
    count: u64,
    sum: i64,
    min: i64,
    max: i64,
}

impl Default for DeltaStats {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0,
            min: i64::MAX,
            max: 0,
        }
    }
}

impl DeltaStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, delta: i64) {
        self.count += 1;
        self.sum += delta;
        if delta > self.max {
            self.max = delta;
        }
        if delta < self.min {
            self.min = delta;
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> i64 {
        self.sum
    }

    pub fn min(&self) -> i64 {
        if self.count == 0 {
            0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    /// Summary with the average taken over an explicit denominator.
    ///
    /// The consumer's transmit and arrival averages intentionally use
    /// different denominators than the raw sample count, so the divisor is
    /// the caller's to choose. A zero denominator yields a zero average.
    pub fn summary_over(&self, denominator: u64) -> DeltaSummary {
        let avg = if denominator > 0 {
            self.sum as f64 / denominator as f64
        } else {
            0.0
        };
        DeltaSummary {
            min: self.min(),
            max: self.max,
            avg,
        }
    }
}

/// Running aggregate over bitrate samples (bits/sec).
///
/// A zero `min` is the unset sentinel: the first recorded sample seeds it
/// before the usual comparison runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct BitrateStats {
    samples: u32,
    total: u64,
    min: u64,
    max: u64,
}

impl BitrateStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, bitrate: u64) {
        self.samples += 1;
        self.total += bitrate;
        if self.min == 0 {
            self.min = bitrate;
        }
        if bitrate > self.max {
            self.max = bitrate;
        }
        if bitrate < self.min {
            self.min = bitrate;
        }
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn min(&self) -> u64 {
        self.min
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn avg(&self) -> f64 {
        if self.samples > 0 {
            self.total as f64 / f64::from(self.samples)
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> BitrateSummary {
        BitrateSummary {
            min: self.min,
            max: self.max,
            avg: self.avg(),
        }
    }
}

/// Periodic-callback bitrate computation shared by producer and consumer.
///
/// The transport reports cumulative byte counts on its own cadence; each
/// sample yields `delta_bytes * 8 / elapsed_secs` with the divisor floored at
/// one second. The very first callback only seeds the baseline and yields
/// nothing, since there is no prior sample to delta against.
#[derive(Debug, Clone, Copy, Default)]
pub struct BitrateSampler {
    last_bytes: u64,
    last_time_us: Option<u64>,
}

impl BitrateSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, cumulative_bytes: u64, now_us: u64) -> Option<u64> {
        let Some(last_us) = self.last_time_us else {
            self.last_bytes = cumulative_bytes;
            self.last_time_us = Some(now_us);
            return None;
        };
        let delta_bytes = cumulative_bytes.saturating_sub(self.last_bytes);
        let elapsed_secs = now_us.saturating_sub(last_us) / 1_000_000;
        let bitrate = delta_bytes * 8 / elapsed_secs.max(defaults::MIN_BITRATE_ELAPSED_SECS);
        self.last_bytes = cumulative_bytes;
        self.last_time_us = Some(now_us);
        Some(bitrate)
    }
}

/// Publish-side metrics record, mirrored byte-for-byte into the completion
/// record's snapshot.
///
/// `avg_publish_bitrate` is recomputed from `bitrate_total / metric_samples`
/// on every sample, preserving the invariant that the stored average never
/// drifts from its accumulators. Zero timestamps mean "not yet set".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestMetrics {
    pub start_transmit_time: u64,
    pub end_transmit_time: u64,
    pub total_published_objects: u64,
    pub total_objects_dropped_not_ok: u64,
    pub total_published_bytes: u64,
    pub max_publish_bitrate: u64,
    pub min_publish_bitrate: u64,
    pub avg_publish_bitrate: u64,
    pub metric_samples: u32,
    pub bitrate_total: u64,
}

impl TestMetrics {
    pub fn record_bitrate(&mut self, bitrate: u64) {
        self.metric_samples += 1;
        self.bitrate_total += bitrate;
        if self.min_publish_bitrate == 0 {
            self.min_publish_bitrate = bitrate;
        }
        if bitrate > self.max_publish_bitrate {
            self.max_publish_bitrate = bitrate;
        }
        if bitrate < self.min_publish_bitrate {
            self.min_publish_bitrate = bitrate;
        }
        self.avg_publish_bitrate = self.bitrate_total / u64::from(self.metric_samples);
    }

    pub fn bitrate_summary(&self) -> BitrateSummary {
        let avg = if self.metric_samples > 0 {
            self.bitrate_total as f64 / f64::from(self.metric_samples)
        } else {
            0.0
        };
        BitrateSummary {
            min: self.min_publish_bitrate,
            max: self.max_publish_bitrate,
            avg,
        }
    }
}

/// Reported min/max/avg for a signed delta aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DeltaSummary {
    pub min: i64,
    pub max: i64,
    pub avg: f64,
}

/// Reported min/max/avg for a bitrate aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BitrateSummary {
    pub min: u64,
    pub max: u64,
    pub avg: f64,
}
