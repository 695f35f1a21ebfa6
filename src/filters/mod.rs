//! Sample filters used by the clock servo.
//!
//! - [`fir::FirFilter`]: moving average over the last N offsets
//! - [`pid::PidFilter`]: control law turning offsets into a frequency correction
//! - [`peirce::PeirceFilter`]: outlier rejection using Peirce's criterion
//! - [`smallest::SmallestFilter`]: ageing-aware minimum path delay selection

pub mod fir;
pub mod peirce;
pub mod pid;
pub mod smallest;

pub use fir::FirFilter;
pub use peirce::PeirceFilter;
pub use pid::PidFilter;
pub use smallest::{PathDelaySample, SmallestFilter};

/// Outcome of feeding a sample to an outlier filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Outlier,
}

impl Verdict {
    pub fn is_outlier(&self) -> bool {
        matches!(self, Verdict::Outlier)
    }
}

/// Running sum with Neumaier compensation.
///
/// Long-lived accumulators (PID integral, Peirce sums) see millions of small
/// additions and removals; the compensation term keeps the rounding error
/// from growing with the number of updates.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompensatedSum {
    sum: f64,
    compensation: f64,
}

impl CompensatedSum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        let t = self.sum + value;
        if self.sum.abs() >= value.abs() {
            self.compensation += (self.sum - t) + value;
        } else {
            self.compensation += (value - t) + self.sum;
        }
        self.sum = t;
    }

    pub fn value(&self) -> f64 {
        self.sum + self.compensation
    }

    pub fn set(&mut self, value: f64) {
        self.sum = value;
        self.compensation = 0.0;
    }

    pub fn reset(&mut self) {
        self.set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compensated_sum_cancels_rounding() {
        let mut sum = CompensatedSum::new();
        sum.add(1.0e16);
        for _ in 0..1000 {
            sum.add(1.0);
        }
        sum.add(-1.0e16);
        assert_eq!(sum.value(), 1000.0);
    }

    #[test]
    fn test_compensated_sum_set_and_reset() {
        let mut sum = CompensatedSum::new();
        sum.add(0.1);
        sum.set(5.0);
        assert_eq!(sum.value(), 5.0);
        sum.reset();
        assert_eq!(sum.value(), 0.0);
    }
}
