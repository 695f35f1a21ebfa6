use super::CompensatedSum;
use crate::time::Timestamp;
use log::debug;

/// Weight of each new interval in the running average is `1 / 16`.
pub const PID_INTERVAL_FILTER_STIFFNESS: f64 = 16.0;

pub const PID_DEFAULT_KP: f64 = 0.4;
pub const PID_DEFAULT_KI: f64 = 0.03;
pub const PID_DEFAULT_KD: f64 = 0.0;

/// Proportional-integral-derivative controller.
///
/// Input is the filtered offset in nanoseconds (slave - master), output is
/// the frequency correction in ppb that drives it towards zero. The
/// derivative term is carried for telemetry but currently always zero.
#[derive(Debug, Clone)]
pub struct PidFilter {
    kp: f64,
    ki: f64,
    kd: f64,
    configured_interval: f64,
    average_interval: f64,
    p: f64,
    i: CompensatedSum,
    d: f64,
    i_max: f64,
    freq_adjust: f64,
    last_update: Option<Timestamp>,
}

impl PidFilter {
    /// `interval` is the nominal update interval in seconds.
    pub fn new(kp: f64, ki: f64, kd: f64, interval: f64) -> Self {
        PidFilter {
            kp,
            ki,
            kd,
            configured_interval: interval,
            average_interval: interval,
            p: 0.0,
            i: CompensatedSum::new(),
            d: 0.0,
            i_max: 0.0,
            freq_adjust: 0.0,
            last_update: None,
        }
    }

    /// Feed a new offset. When `time` is given and a previous update exists,
    /// the real elapsed interval (bounded to half/double the running average)
    /// weights the integral; otherwise the configured interval is used.
    pub fn update(&mut self, delta: f64, time: Option<&Timestamp>) -> f64 {
        let interval = match (time, self.last_update) {
            (Some(now), Some(last)) => {
                let elapsed = (*now - last).to_secs_f64();
                let bounded = elapsed.clamp(0.5 * self.average_interval, 2.0 * self.average_interval);
                self.average_interval = ((PID_INTERVAL_FILTER_STIFFNESS - 1.0) * self.average_interval + bounded)
                    / PID_INTERVAL_FILTER_STIFFNESS;
                bounded
            }
            _ => self.configured_interval,
        };
        if let Some(now) = time {
            self.last_update = Some(*now);
        }

        self.p = self.kp * delta;
        self.freq_adjust = -self.p - self.i.value() - self.d;

        self.i.add(self.ki * interval * delta);
        if self.i_max > 0.0 {
            let i = self.i.value();
            if i > self.i_max {
                self.i.set(self.i_max);
            } else if i < -self.i_max {
                self.i.set(-self.i_max);
            }
        }

        debug!(
            "pid: delta={:.3} interval={:.3} p={:.3} i={:.3} out={:.3}ppb",
            delta,
            interval,
            self.p,
            self.i.value(),
            self.freq_adjust
        );

        self.freq_adjust
    }

    /// Change gains live. `None` leaves a gain as it is.
    pub fn adjust(&mut self, kp: Option<f64>, ki: Option<f64>, kd: Option<f64>, reset: bool) {
        if let Some(kp) = kp {
            self.kp = kp;
        }
        if let Some(ki) = ki {
            self.ki = ki;
        }
        if let Some(kd) = kd {
            self.kd = kd;
        }
        if reset {
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.p = 0.0;
        self.i.reset();
        self.d = 0.0;
        self.freq_adjust = 0.0;
        self.last_update = None;
        self.average_interval = self.configured_interval;
    }

    /// A limit of zero disables the integral clamp.
    pub fn set_i_max(&mut self, i_max: f64) {
        self.i_max = i_max.max(0.0);
    }

    pub fn kp(&self) -> f64 {
        self.kp
    }

    pub fn ki(&self) -> f64 {
        self.ki
    }

    pub fn kd(&self) -> f64 {
        self.kd
    }

    pub fn p_term(&self) -> f64 {
        self.p
    }

    pub fn i_term(&self) -> f64 {
        self.i.value()
    }

    pub fn d_term(&self) -> f64 {
        self.d
    }

    pub fn average_interval(&self) -> f64 {
        self.average_interval
    }
}
