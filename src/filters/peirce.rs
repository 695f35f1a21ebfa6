//! Outlier rejection using Peirce's criterion.
//!
//! A sample is an outlier when its distance from the running mean exceeds
//! `R * stddev` plus the drift the servo itself introduced over the window,
//! where `R` is the tabulated Peirce ratio for the number of held samples.
//! Outliers are still stored, pulled towards the mean by the configured
//! weighting, so the window keeps tracking a genuine change in conditions.

use super::{CompensatedSum, Verdict};
use crate::time::Timestamp;
use log::trace;

pub const PEIRCE_MIN_SAMPLES: usize = 5;
pub const PEIRCE_MAX_SAMPLES: usize = 60;

/// The cumulative drift is rebuilt from the stored per-slot values every
/// `max_samples * RECALC_PERIOD` updates.
const RECALC_PERIOD: u64 = 10;

/// Peirce's ratio for one doubtful observation, indexed by sample count - 1.
static PEIRCE_CRITERION: [f64; PEIRCE_MAX_SAMPLES] = [
    0.000000, 1.000000, 1.216262, 1.382943, 1.509276, 1.609828, 1.692841, 1.763236, 1.824156, 1.877719,
    1.925417, 1.968339, 2.007300, 2.042929, 2.075718, 2.106060, 2.134273, 2.160620, 2.185316, 2.208544,
    2.230458, 2.251190, 2.270853, 2.289546, 2.307353, 2.324351, 2.340604, 2.356171, 2.371105, 2.385452,
    2.399253, 2.412545, 2.425364, 2.437739, 2.449698, 2.461267, 2.472468, 2.483323, 2.493852, 2.504072,
    2.514000, 2.523651, 2.533039, 2.542178, 2.551079, 2.559753, 2.568212, 2.576465, 2.584522, 2.592390,
    2.600079, 2.607595, 2.614946, 2.622138, 2.629178, 2.636072, 2.642825, 2.649442, 2.655929, 2.662291,
];

#[derive(Debug, Clone)]
pub struct PeirceFilter {
    max_samples: usize,
    outlier_weighting: f64,
    samples: Vec<f64>,
    timestamps: Vec<Timestamp>,
    drift: Vec<f64>,
    write_idx: usize,
    num_samples: usize,
    sum: CompensatedSum,
    sum_sq: CompensatedSum,
    cumulative_drift: CompensatedSum,
    update_count: u64,
}

impl PeirceFilter {
    /// `max_samples` is clamped to `[5, 60]`, `outlier_weighting` to `[0, 1]`.
    pub fn new(max_samples: usize, outlier_weighting: f64) -> Self {
        let max_samples = max_samples.clamp(PEIRCE_MIN_SAMPLES, PEIRCE_MAX_SAMPLES);
        PeirceFilter {
            max_samples,
            outlier_weighting: outlier_weighting.clamp(0.0, 1.0),
            samples: vec![0.0; max_samples],
            timestamps: vec![Timestamp::ZERO; max_samples],
            drift: vec![0.0; max_samples],
            write_idx: 0,
            num_samples: 0,
            sum: CompensatedSum::new(),
            sum_sq: CompensatedSum::new(),
            cumulative_drift: CompensatedSum::new(),
            update_count: 0,
        }
    }

    pub fn max_samples(&self) -> usize {
        self.max_samples
    }

    pub fn len(&self) -> usize {
        self.num_samples
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }

    pub fn mean(&self) -> f64 {
        if self.num_samples == 0 {
            return 0.0;
        }
        self.sum.value() / self.num_samples as f64
    }

    pub fn std_dev(&self) -> f64 {
        if self.num_samples == 0 {
            return 0.0;
        }
        let n = self.num_samples as f64;
        let mean = self.sum.value() / n;
        (self.sum_sq.value() / n - mean * mean).max(0.0).sqrt()
    }

    pub fn cumulative_drift(&self) -> f64 {
        self.cumulative_drift.value()
    }

    /// Feed a sample (ns) taken at `time` while the servo was applying
    /// `freq_adjust_ppb` to the clock.
    pub fn update(&mut self, sample: f64, freq_adjust_ppb: f64, time: &Timestamp) -> Verdict {
        let full = self.num_samples == self.max_samples;

        // ppb * seconds = ns
        let drift = if self.num_samples == 0 {
            0.0
        } else {
            let prev = self.timestamps[(self.write_idx + self.max_samples - 1) % self.max_samples];
            freq_adjust_ppb * (*time - prev).to_secs_f64()
        };

        if full {
            self.cumulative_drift.add(-self.drift[self.write_idx].abs());
        }
        self.cumulative_drift.add(drift.abs());

        let mut verdict = Verdict::Accepted;
        let mut value = sample;
        if self.num_samples >= PEIRCE_MIN_SAMPLES {
            let mean = self.mean();
            let criterion = PEIRCE_CRITERION[self.num_samples - 1];
            let deviation = sample - mean;
            let limit = criterion * self.std_dev() + self.cumulative_drift.value();
            if deviation.abs() > limit {
                verdict = Verdict::Outlier;
                value = mean + deviation * self.outlier_weighting;
                trace!(
                    "peirce: outlier {:.3} (mean {:.3}, limit {:.3}), stored as {:.3}",
                    sample,
                    mean,
                    limit,
                    value
                );
            }
        }

        if full {
            let old = self.samples[self.write_idx];
            self.sum.add(-old);
            self.sum_sq.add(-old * old);
        }
        self.samples[self.write_idx] = value;
        self.timestamps[self.write_idx] = *time;
        self.drift[self.write_idx] = drift;
        self.sum.add(value);
        self.sum_sq.add(value * value);

        let held = if full { self.max_samples } else { self.num_samples + 1 };
        self.update_count += 1;
        if self.update_count % (self.max_samples as u64 * RECALC_PERIOD) == 0 {
            let exact: f64 = self.drift[..held].iter().map(|d| d.abs()).sum();
            self.cumulative_drift.set(exact);
        }

        self.write_idx = (self.write_idx + 1) % self.max_samples;
        self.num_samples = held;

        verdict
    }

    pub fn reset(&mut self) {
        self.write_idx = 0;
        self.num_samples = 0;
        self.sum.reset();
        self.sum_sq.reset();
        self.cumulative_drift.reset();
        self.update_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_alternating(filter: &mut PeirceFilter, count: usize, mean: f64, sigma: f64) {
        for i in 0..count {
            let v = if i % 2 == 0 { mean + sigma } else { mean - sigma };
            let verdict = filter.update(v, 0.0, &Timestamp::from_secs(i as i64));
            assert_eq!(verdict, Verdict::Accepted, "warm-up sample {} flagged", i);
        }
    }

    /// Standard normal deviate (Box-Muller).
    fn gaussian() -> f64 {
        let u1: f64 = rand::random::<f64>().max(f64::MIN_POSITIVE);
        let u2: f64 = rand::random();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    #[test]
    fn test_gaussian_noise_mostly_accepted() {
        const MEAN: f64 = 250.0;
        const SIGMA: f64 = 40.0;
        let mut filter = PeirceFilter::new(30, 1.0);

        let mut flagged = 0;
        for i in 0..600 {
            let v = MEAN + SIGMA * gaussian();
            if filter.update(v, 0.0, &Timestamp::from_secs(i)).is_outlier() {
                flagged += 1;
            }
        }
        assert!(flagged < 60, "{} of 600 normal samples flagged", flagged);
        assert!((filter.std_dev() - SIGMA).abs() < SIGMA * 0.6);

        // Anything within one sigma of the true mean must pass
        for i in 600..700 {
            let z = gaussian();
            let verdict = filter.update(MEAN + SIGMA * z, 0.0, &Timestamp::from_secs(i));
            if z.abs() < 1.0 {
                assert_eq!(verdict, Verdict::Accepted, "z = {:.3} flagged", z);
            }
        }

        let verdict = filter.update(MEAN + 10.0 * SIGMA, 0.0, &Timestamp::from_secs(700));
        assert_eq!(verdict, Verdict::Outlier);
    }

    #[test]
    fn test_table_is_monotonic() {
        for w in PEIRCE_CRITERION.windows(2) {
            assert!(w[1] > w[0]);
        }
        assert_eq!(PEIRCE_CRITERION[59], 2.662291);
    }

    #[test]
    fn test_no_verdict_before_five_samples() {
        let mut filter = PeirceFilter::new(10, 0.0);
        let wild = [0.0, 1.0e9, -1.0e9, 5.0, 3.0e12];
        for (i, v) in wild.iter().enumerate() {
            assert_eq!(filter.update(*v, 0.0, &Timestamp::from_secs(i as i64)), Verdict::Accepted);
        }
        assert_eq!(filter.len(), 5);
    }

    #[test]
    fn test_ten_sigma_sample_is_outlier() {
        let mut filter = PeirceFilter::new(30, 0.0);
        feed_alternating(&mut filter, 20, 100.0, 10.0);
        assert!((filter.std_dev() - 10.0).abs() < 1e-9);

        let verdict = filter.update(200.0, 0.0, &Timestamp::from_secs(20));
        assert_eq!(verdict, Verdict::Outlier);

        // Weighting zero stores the mean in place of the outlier
        assert!((filter.mean() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_normal_sample_accepted() {
        let mut filter = PeirceFilter::new(30, 0.5);
        feed_alternating(&mut filter, 20, 100.0, 10.0);
        assert_eq!(filter.update(115.0, 0.0, &Timestamp::from_secs(20)), Verdict::Accepted);
    }

    #[test]
    fn test_drift_widens_acceptance() {
        let mut filter = PeirceFilter::new(30, 0.0);
        feed_alternating(&mut filter, 20, 100.0, 10.0);

        // 100ppb applied over one second adds 100ns of tolerated drift
        let verdict = filter.update(200.0, 100.0, &Timestamp::from_secs(20));
        assert_eq!(verdict, Verdict::Accepted);
        assert!((filter.cumulative_drift() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_cumulative_drift_evicts_old_slots() {
        let mut filter = PeirceFilter::new(5, 1.0);
        for i in 0..5 {
            filter.update(0.0, 10.0, &Timestamp::from_secs(i));
        }
        // First slot carries no drift, the other four 10ns each
        assert!((filter.cumulative_drift() - 40.0).abs() < 1e-9);

        filter.update(0.0, 0.0, &Timestamp::from_secs(5));
        assert!((filter.cumulative_drift() - 40.0).abs() < 1e-9);
        filter.update(0.0, 0.0, &Timestamp::from_secs(6));
        assert!((filter.cumulative_drift() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_periodic_recalculation_matches_running_total() {
        let mut filter = PeirceFilter::new(5, 1.0);
        for i in 0..(5 * RECALC_PERIOD as i64 + 3) {
            filter.update((i % 3) as f64, 7.0, &Timestamp::from_secs(i));
        }
        assert!((filter.cumulative_drift() - 35.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset() {
        let mut filter = PeirceFilter::new(8, 0.2);
        feed_alternating(&mut filter, 8, 0.0, 1.0);
        filter.reset();
        assert!(filter.is_empty());
        assert_eq!(filter.mean(), 0.0);
        assert_eq!(filter.cumulative_drift(), 0.0);
    }
}
