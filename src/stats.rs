//! Convergence tracking and per-period statistics.

use crate::time::Timestamp;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const DEFAULT_CONVERGENCE_MIN_PERIOD: f64 = 60.0;
pub const DEFAULT_CONVERGENCE_MAX_OFFSET: f64 = 1000.0;
pub const SW_TIMESTAMPING_CONVERGENCE_MAX_OFFSET: f64 = 100_000.0;
pub const LOW_PRECISION_CONVERGENCE_MAX_OFFSET: f64 = 10.0e6;

/// How tightly the active comparison can measure an offset. Picks the
/// default convergence threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimestampingPrecision {
    Hardware,
    Software,
    Low,
}

impl TimestampingPrecision {
    pub fn convergence_max_offset(self) -> f64 {
        match self {
            TimestampingPrecision::Hardware => DEFAULT_CONVERGENCE_MAX_OFFSET,
            TimestampingPrecision::Software => SW_TIMESTAMPING_CONVERGENCE_MAX_OFFSET,
            TimestampingPrecision::Low => LOW_PRECISION_CONVERGENCE_MAX_OFFSET,
        }
    }

    /// Classify a clock pair by the diff methods in use on each side.
    pub fn from_diff_methods(master: &str, slave: &str) -> Self {
        if master == "read-time" || slave == "read-time" {
            TimestampingPrecision::Software
        } else {
            TimestampingPrecision::Hardware
        }
    }
}

/// Number of closed periods kept in the history.
pub const STATS_HISTORY_LEN: usize = 24;

// ============================================================================
// CONVERGENCE
// ============================================================================

/// Declares a clock synchronized once the offset has stayed within
/// `max_offset` ns for at least `min_period` seconds without a break.
#[derive(Debug, Clone)]
pub struct ConvergenceTracker {
    min_period: f64,
    max_offset: f64,
    start: f64,
    num_samples: u64,
}

impl Default for ConvergenceTracker {
    fn default() -> Self {
        ConvergenceTracker::new(DEFAULT_CONVERGENCE_MIN_PERIOD, DEFAULT_CONVERGENCE_MAX_OFFSET)
    }
}

impl ConvergenceTracker {
    pub fn new(min_period: f64, max_offset: f64) -> Self {
        ConvergenceTracker {
            min_period,
            max_offset,
            start: 0.0,
            num_samples: 0,
        }
    }

    pub fn set_max_offset(&mut self, max_offset: f64) {
        self.max_offset = max_offset;
    }

    pub fn max_offset(&self) -> f64 {
        self.max_offset
    }

    pub fn reset(&mut self) {
        self.start = 0.0;
        self.num_samples = 0;
    }

    /// Feed an offset (ns) observed at `time` (seconds). Returns true when
    /// the clock counts as converged.
    pub fn update(&mut self, time: f64, offset: f64) -> bool {
        if offset.abs() > self.max_offset {
            self.reset();
            return false;
        }

        if self.num_samples > 0 && time < self.start {
            warn!("convergence: time went backwards ({:.3} < {:.3}), restarting", time, self.start);
            self.num_samples = 0;
        }

        if self.num_samples == 0 {
            self.start = time;
        }
        self.num_samples += 1;

        time >= self.start + self.min_period
    }
}

// ============================================================================
// RANGE STATISTICS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub count: u64,
    #[serde(skip)]
    total: f64,
}

impl RangeStats {
    pub fn update(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.total += value;
        self.mean = self.total / self.count as f64;
    }
}

/// Statistics for one clock over one period.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodStats {
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
    pub offset_ns: RangeStats,
    pub freq_adj_ppb: RangeStats,
    pub synchronized: u64,
    pub samples: u64,
    pub near_epoch: u64,
    pub sync_failures: u64,
}

/// Current period plus a bounded history of closed periods.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClockStats {
    pub current: PeriodStats,
    pub history: VecDeque<PeriodStats>,
}

impl ClockStats {
    pub fn record_offset(&mut self, offset: f64, freq_adj: f64, synchronized: bool) {
        self.current.offset_ns.update(offset);
        self.current.freq_adj_ppb.update(freq_adj);
        self.current.samples += 1;
        if synchronized {
            self.current.synchronized += 1;
        }
    }

    pub fn record_near_epoch(&mut self) {
        self.current.near_epoch += 1;
    }

    pub fn record_sync_failure(&mut self) {
        self.current.sync_failures += 1;
    }

    /// Close the current period at `time` and return it.
    pub fn end_period(&mut self, time: &Timestamp) -> PeriodStats {
        let mut closed = std::mem::take(&mut self.current);
        closed.end = Some(*time);
        self.current.start = Some(*time);

        if self.history.len() == STATS_HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(closed.clone());
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convergence_requires_min_period() {
        let mut conv = ConvergenceTracker::new(60.0, 1000.0);
        assert!(!conv.update(100.0, 10.0));
        assert!(!conv.update(159.0, -999.0));
        assert!(conv.update(160.0, 0.0));
        assert!(conv.update(200.0, 500.0));
    }

    #[test]
    fn test_convergence_excursion_restarts() {
        let mut conv = ConvergenceTracker::new(60.0, 1000.0);
        conv.update(0.0, 0.0);
        assert!(conv.update(70.0, 0.0));
        assert!(!conv.update(71.0, 1500.0));
        assert!(!conv.update(72.0, 0.0));
        assert!(!conv.update(131.0, 0.0));
        assert!(conv.update(132.0, 0.0));
    }

    #[test]
    fn test_convergence_time_backwards_restarts() {
        let mut conv = ConvergenceTracker::new(10.0, 1000.0);
        conv.update(100.0, 0.0);
        assert!(!conv.update(50.0, 0.0));
        assert!(conv.update(60.0, 0.0));
    }

    #[test]
    fn test_precision_from_diff_methods() {
        let p = TimestampingPrecision::from_diff_methods("system", "sys-offset-precise");
        assert_eq!(p, TimestampingPrecision::Hardware);
        assert_eq!(p.convergence_max_offset(), 1000.0);

        let p = TimestampingPrecision::from_diff_methods("read-time", "pps");
        assert_eq!(p, TimestampingPrecision::Software);
        assert_eq!(p.convergence_max_offset(), 100_000.0);

        assert_eq!(TimestampingPrecision::Low.convergence_max_offset(), 10.0e6);
    }

    #[test]
    fn test_range_stats() {
        let mut r = RangeStats::default();
        for v in [5.0, -3.0, 10.0] {
            r.update(v);
        }
        assert_eq!(r.min, -3.0);
        assert_eq!(r.max, 10.0);
        assert_eq!(r.mean, 4.0);
        assert_eq!(r.count, 3);
    }

    #[test]
    fn test_end_period_rolls_history() {
        let mut stats = ClockStats::default();
        stats.record_offset(100.0, -5.0, false);
        stats.record_offset(50.0, -6.0, true);
        stats.record_sync_failure();

        let closed = stats.end_period(&Timestamp::from_secs(3600));
        assert_eq!(closed.samples, 2);
        assert_eq!(closed.synchronized, 1);
        assert_eq!(closed.sync_failures, 1);
        assert_eq!(closed.offset_ns.mean, 75.0);
        assert_eq!(stats.current.samples, 0);
        assert_eq!(stats.current.start, Some(Timestamp::from_secs(3600)));

        for i in 0..(STATS_HISTORY_LEN + 5) {
            stats.end_period(&Timestamp::from_secs(i as i64));
        }
        assert_eq!(stats.history.len(), STATS_HISTORY_LEN);
    }

    #[test]
    fn test_stats_serialize() {
        let mut stats = ClockStats::default();
        stats.record_offset(12.0, 3.0, true);
        let json = serde_json::to_string(&stats).expect("serialize failed");
        assert!(json.contains("\"offset_ns\""));
        assert!(!json.contains("total"));
    }
}
