//! Moving-average (FIR) filter over the most recent offsets.

pub const FIR_MIN_STIFFNESS: usize = 1;
pub const FIR_MAX_STIFFNESS: usize = 128;

#[derive(Debug, Clone)]
pub struct FirFilter {
    samples: [f64; FIR_MAX_STIFFNESS],
    stiffness: usize,
    count: usize,
    write_idx: usize,
}

impl FirFilter {
    /// Stiffness is clamped to `[1, 128]`.
    pub fn new(stiffness: usize) -> Self {
        FirFilter {
            samples: [0.0; FIR_MAX_STIFFNESS],
            stiffness: stiffness.clamp(FIR_MIN_STIFFNESS, FIR_MAX_STIFFNESS),
            count: 0,
            write_idx: 0,
        }
    }

    pub fn stiffness(&self) -> usize {
        self.stiffness
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Insert a delta and return the mean of every held sample.
    pub fn update(&mut self, delta: f64) -> f64 {
        self.samples[self.write_idx] = delta;
        self.write_idx = (self.write_idx + 1) % self.stiffness;
        if self.count < self.stiffness {
            self.count += 1;
        }

        let total: f64 = self.samples[..self.count].iter().sum();
        total / self.count as f64
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.write_idx = 0;
    }
}
