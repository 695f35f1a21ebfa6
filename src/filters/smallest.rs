use crate::time::Timestamp;
use log::warn;

pub const SMALLEST_MIN_SAMPLES: usize = 1;
pub const SMALLEST_MAX_SAMPLES: usize = 25;
pub const SMALLEST_MIN_TIMEOUT: f64 = 10.0;
pub const SMALLEST_MAX_TIMEOUT: f64 = 20.0;

/// One complete path delay measurement.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PathDelaySample {
    /// Mean one-way path delay (ns).
    pub path_delay: f64,
    /// Master-to-slave leg (ns).
    pub master_to_slave: f64,
    /// Slave-to-master leg (ns).
    pub slave_to_master: f64,
    /// Monotonic time the measurement completed.
    pub mono_time: Timestamp,
}

/// Keeps the last N path delay measurements and selects the one with the
/// smallest delay, penalising older samples by `ageing` ns per second.
#[derive(Debug, Clone)]
pub struct SmallestFilter {
    max_samples: usize,
    ageing: f64,
    timeout: f64,
    samples: Vec<PathDelaySample>,
    write_idx: usize,
}

impl SmallestFilter {
    pub fn new(max_samples: usize, ageing: f64, timeout: f64) -> Self {
        let max_samples = max_samples.clamp(SMALLEST_MIN_SAMPLES, SMALLEST_MAX_SAMPLES);
        SmallestFilter {
            max_samples,
            ageing,
            timeout: timeout.clamp(SMALLEST_MIN_TIMEOUT, SMALLEST_MAX_TIMEOUT),
            samples: Vec::with_capacity(max_samples),
            write_idx: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn timeout(&self) -> f64 {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: f64) {
        self.timeout = timeout.clamp(SMALLEST_MIN_TIMEOUT, SMALLEST_MAX_TIMEOUT);
    }

    /// Store a sample and return the best candidate, falling back to the
    /// sample itself when nothing else qualifies.
    pub fn update(&mut self, sample: PathDelaySample) -> PathDelaySample {
        if self.samples.len() < self.max_samples {
            self.samples.push(sample);
        } else {
            self.samples[self.write_idx] = sample;
        }
        self.write_idx = (self.write_idx + 1) % self.max_samples;

        self.best_at(&sample.mono_time).unwrap_or(sample)
    }

    /// Select the best held candidate as seen at monotonic time `now`
    /// without inserting anything.
    pub fn best_at(&self, now: &Timestamp) -> Option<PathDelaySample> {
        let mut best: Option<(f64, &PathDelaySample)> = None;

        for candidate in &self.samples {
            let age = (*now - candidate.mono_time).to_secs_f64();
            if age < 0.0 {
                warn!(
                    "smallest: sample from the future ({:.3}s), monotonic clock went backwards",
                    -age
                );
                continue;
            }
            if age > self.timeout || candidate.path_delay < 0.0 {
                continue;
            }

            let aged = candidate.path_delay + self.ageing * age;
            if best.map_or(true, |(b, _)| aged < b) {
                best = Some((aged, candidate));
            }
        }

        best.map(|(_, s)| *s)
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.write_idx = 0;
    }
}
