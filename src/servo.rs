//! Clock servo.
//!
//! A servo disciplines one slave clock to one master clock. Each call to
//! [`Servo::synchronize`] runs one cycle:
//!
//! 1. Compare slave and master (offset = slave - master)
//! 2. Guard against implausible near-epoch readings on either clock
//! 3. Step the slave if policy allows and the offset is at least the threshold
//! 4. Otherwise optionally reject outliers, then smooth (FIR), run the PID and
//!    slew the slave's frequency
//! 5. Track convergence and sustained failures

use crate::clock::{is_near_epoch, ClockError, ClockHandle, ClockRegistry};
use crate::config::{ClockControl, ConvergenceConfig, EpochGuard, SystemConfig};
use crate::filters::{FirFilter, PathDelaySample, PeirceFilter, PidFilter, SmallestFilter};
use crate::stats::{ClockStats, ConvergenceTracker, TimestampingPrecision};
use crate::status::{Alarms, ServoStats};
use crate::time::Timestamp;
use log::{debug, info, trace, warn};
use std::fmt::Write;
use std::sync::Arc;
use thiserror::Error;

/// Failures lasting this long raise the sustained-failure alarm (seconds).
const SUSTAINED_SYNC_FAILURE_PERIOD: f64 = 30.0;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("servo has no clocks")]
    NoClocks,
    #[error("synchronization deferred to the next cycle")]
    Retry,
    #[error(transparent)]
    Clock(#[from] ClockError),
}

impl SyncError {
    /// No comparison method is left; nothing further can be done.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Clock(ClockError::Unsupported))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Slewed,
    Stepped,
    OutlierRejected,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FailureState {
    Ok,
    Failed { since: Timestamp },
    Alarmed,
}

pub struct Servo {
    name: String,
    registry: Arc<ClockRegistry>,
    master: Option<ClockHandle>,
    slave: Option<ClockHandle>,

    clock_control: ClockControl,
    epoch_guard: EpochGuard,
    step_threshold_ns: f64,
    use_saved_freq_correction: bool,

    fir: FirFilter,
    pid: PidFilter,
    outlier_filter: Option<PeirceFilter>,
    path_delay_filter: SmallestFilter,

    freq_correction: f64,
    freq_adjust: f64,
    max_freq_adj: f64,
    offset_ns: f64,

    active: bool,
    synchronized: bool,
    stepped_after_lrc_locked: bool,
    alarms: Alarms,
    convergence_config: ConvergenceConfig,
    convergence: ConvergenceTracker,
    failure: FailureState,
    stats: ClockStats,
}

impl Servo {
    pub fn new(name: &str, registry: Arc<ClockRegistry>, config: &SystemConfig) -> Self {
        let f = &config.filters;
        let outlier_filter = f
            .outlier_filter_enabled
            .then(|| PeirceFilter::new(f.outlier_filter_size, f.outlier_filter_weighting));

        Servo {
            name: name.to_string(),
            registry,
            master: None,
            slave: None,
            clock_control: config.servo.clock_control,
            epoch_guard: config.servo.epoch_guard,
            step_threshold_ns: config.servo.step_threshold * 1.0e9,
            use_saved_freq_correction: config.persistence.use_saved_freq_correction,
            fir: FirFilter::new(config.fir_stiffness()),
            pid: PidFilter::new(config.servo.kp, config.servo.ki, config.servo.kd, config.sync_interval_secs()),
            outlier_filter,
            path_delay_filter: SmallestFilter::new(
                f.path_delay_filter_size,
                f.path_delay_filter_ageing,
                f.path_delay_filter_timeout,
            ),
            freq_correction: 0.0,
            freq_adjust: 0.0,
            max_freq_adj: 0.0,
            offset_ns: 0.0,
            active: false,
            synchronized: false,
            stepped_after_lrc_locked: false,
            alarms: Alarms::empty(),
            convergence_config: config.convergence.clone(),
            convergence: ConvergenceTracker::new(
                config.convergence.min_period,
                config.convergence.max_offset_for(TimestampingPrecision::Hardware),
            ),
            failure: FailureState::Ok,
            stats: ClockStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn master(&self) -> Option<&ClockHandle> {
        self.master.as_ref()
    }

    pub fn slave(&self) -> Option<&ClockHandle> {
        self.slave.as_ref()
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    pub fn alarms(&self) -> Alarms {
        self.alarms
    }

    pub fn freq_adjust(&self) -> f64 {
        self.freq_adjust
    }

    pub fn stats(&self) -> &ClockStats {
        &self.stats
    }

    /// Bind the servo to a master/slave pair. The slave's saved frequency
    /// correction is applied straight away.
    pub fn set_clocks(&mut self, master: &ClockHandle, slave: &ClockHandle) {
        if self.master.as_ref() == Some(master) && self.slave.as_ref() == Some(slave) {
            return;
        }
        info!("{}: {} -> {}", self.name, master.name(), slave.name());
        self.master = Some(master.clone());
        self.slave = Some(slave.clone());

        self.max_freq_adj = slave.max_freq_adj_ppb();
        self.pid.set_i_max(self.max_freq_adj);
        self.load_freq_correction(slave);
        self.apply_freq_correction(slave);
        self.refresh_convergence_bound(master, slave);
        self.reset();
    }

    /// Follow the precision of the diff methods in use; a PHC can fall back
    /// to a coarser method at any time.
    fn refresh_convergence_bound(&mut self, master: &ClockHandle, slave: &ClockHandle) {
        let precision = TimestampingPrecision::from_diff_methods(
            self.registry.diff_method_name(master),
            self.registry.diff_method_name(slave),
        );
        let max_offset = self.convergence_config.max_offset_for(precision);
        if max_offset != self.convergence.max_offset() {
            info!(
                "{}: convergence threshold {}ns ({:?} timestamping)",
                self.name, max_offset, precision
            );
            self.convergence.set_max_offset(max_offset);
        }
    }

    pub fn convergence_threshold(&self) -> f64 {
        self.convergence.max_offset()
    }

    fn load_freq_correction(&mut self, slave: &ClockHandle) {
        self.freq_correction = if self.use_saved_freq_correction {
            self.registry.load_freq_correction(slave)
        } else {
            0.0
        };
    }

    fn apply_freq_correction(&mut self, slave: &ClockHandle) {
        match self.registry.adjust_frequency(slave, self.freq_correction) {
            Ok(()) => self.alarms.clear(Alarms::CLOCK_CTRL_FAILURE),
            Err(e) => {
                self.alarms.set(Alarms::CLOCK_CTRL_FAILURE);
                warn!("{}: failed to set frequency of {}: {}", self.name, slave.name(), e);
            }
        }
    }

    /// Clear filter history and fall back to the frequency correction.
    pub fn reset(&mut self) {
        self.fir.reset();
        self.pid.reset();
        if let Some(filter) = self.outlier_filter.as_mut() {
            filter.reset();
        }
        self.path_delay_filter.reset();
        self.freq_adjust = self.freq_correction;
        self.offset_ns = 0.0;
    }

    /// Step the slave by `-diff` and restart the filters.
    pub fn step_clock(&mut self, diff: &Timestamp) -> Result<(), SyncError> {
        let slave = self.slave.clone().ok_or(SyncError::NoClocks)?;

        if let Err(e) = self.registry.adjust_time(&slave, &-*diff) {
            self.alarms.set(Alarms::CLOCK_CTRL_FAILURE);
            warn!("{}: failed to step {}: {}", self.name, slave.name(), e);
            return Err(e.into());
        }
        self.alarms.clear(Alarms::CLOCK_CTRL_FAILURE);

        // Integral history no longer applies after a phase jump
        self.load_freq_correction(&slave);
        self.apply_freq_correction(&slave);
        self.reset();
        Ok(())
    }

    /// Live PID reconfiguration; `None` keeps a gain unchanged.
    pub fn adjust_pid(&mut self, kp: Option<f64>, ki: Option<f64>, kd: Option<f64>, reset: bool) {
        self.pid.adjust(kp, ki, kd, reset);
        info!(
            "{}: pid gains kp={} ki={} kd={}{}",
            self.name,
            self.pid.kp(),
            self.pid.ki(),
            self.pid.kd(),
            if reset { " (reset)" } else { "" }
        );
    }

    /// Run a path delay measurement through the smallest-delay filter.
    pub fn select_path_delay(&mut self, sample: PathDelaySample) -> PathDelaySample {
        self.path_delay_filter.update(sample)
    }

    pub fn get_offset_from_master(&self) -> Timestamp {
        Timestamp::from_nanos_f64(self.offset_ns)
    }

    pub fn synchronize(&mut self, time: &Timestamp) -> Result<SyncOutcome, SyncError> {
        let result = self.do_synchronize(time);
        if result.is_err() {
            self.stats.record_sync_failure();
        }
        self.track_failures(result.is_ok(), time);
        result
    }

    fn track_failures(&mut self, ok: bool, time: &Timestamp) {
        match (self.failure, ok) {
            (FailureState::Ok, false) => self.failure = FailureState::Failed { since: *time },
            (FailureState::Failed { since }, false) => {
                if (*time - since).to_secs_f64() >= SUSTAINED_SYNC_FAILURE_PERIOD {
                    warn!(
                        "{}: synchronization failing for over {}s",
                        self.name, SUSTAINED_SYNC_FAILURE_PERIOD
                    );
                    self.failure = FailureState::Alarmed;
                    self.alarms.set(Alarms::SUSTAINED_SYNC_FAILURE);
                    self.synchronized = false;
                    self.offset_ns = 0.0;
                    self.stats.record_offset(0.0, self.freq_adjust, false);
                }
            }
            (FailureState::Failed { .. }, true) => self.failure = FailureState::Ok,
            (FailureState::Alarmed, true) => {
                info!("{}: synchronization recovered", self.name);
                self.failure = FailureState::Ok;
                self.alarms.clear(Alarms::SUSTAINED_SYNC_FAILURE);
            }
            (FailureState::Ok, true) | (FailureState::Alarmed, false) => {}
        }
    }

    fn do_synchronize(&mut self, time: &Timestamp) -> Result<SyncOutcome, SyncError> {
        let (master, slave) = match (&self.master, &self.slave) {
            (Some(m), Some(s)) => (m.clone(), s.clone()),
            _ => return Err(SyncError::NoClocks),
        };

        let diff = self.registry.compare(&slave, &master)?;
        self.refresh_convergence_bound(&master, &slave);
        self.check_epoch(&master, &slave, &diff)?;

        let diff_ns = diff.to_nanos_f64();
        let master_locked = self.registry.been_locked(&master);

        let may_step = match self.clock_control {
            ClockControl::SlewAndStep => true,
            ClockControl::StepAtStartup => !self.active,
            ClockControl::StepOnFirstLock => !self.active || (!self.stepped_after_lrc_locked && master_locked),
            ClockControl::StepForward => diff_ns < 0.0,
            ClockControl::NoStep => false,
        };
        if may_step && diff_ns.abs() >= self.step_threshold_ns {
            let stepped = self.step_clock(&diff);
            self.active = true;
            if master_locked {
                self.stepped_after_lrc_locked = true;
            }
            return stepped.map(|_| SyncOutcome::Stepped);
        }

        if let Some(filter) = self.outlier_filter.as_mut() {
            let applied = self.freq_adjust - self.freq_correction;
            if filter.update(diff_ns, applied, time).is_outlier() {
                debug!("{}: offset {:.0}ns rejected as outlier", self.name, diff_ns);
                return Ok(SyncOutcome::OutlierRejected);
            }
        }

        let mean = self.fir.update(diff_ns);
        self.offset_ns = mean;

        let freq_adj = (self.freq_correction + self.pid.update(mean, Some(time))).clamp(-self.max_freq_adj, self.max_freq_adj);
        self.freq_adjust = freq_adj;

        let adjusted = self.registry.adjust_frequency(&slave, freq_adj);
        match &adjusted {
            Ok(()) => self.alarms.clear(Alarms::CLOCK_CTRL_FAILURE),
            Err(e) => {
                self.alarms.set(Alarms::CLOCK_CTRL_FAILURE);
                warn!("{}: failed to adjust {}: {}", self.name, slave.name(), e);
            }
        }

        self.synchronized = self.convergence.update(time.sec() as f64, mean);
        self.stats.record_offset(mean, freq_adj, self.synchronized);
        if self.synchronized {
            self.registry.set_been_locked(&slave, true);
        }

        self.active = true;
        if master_locked {
            self.stepped_after_lrc_locked = true;
        }

        trace!(
            "{}: {} offset {:.3} ({:.3}) freq-adj {:.3} in-sync {} p {:.3} i {:.3}",
            self.name,
            slave.name(),
            mean,
            diff_ns,
            freq_adj,
            self.synchronized,
            self.pid.p_term(),
            self.pid.i_term()
        );

        adjusted?;
        Ok(SyncOutcome::Slewed)
    }

    fn check_epoch(&mut self, master: &ClockHandle, slave: &ClockHandle, diff: &Timestamp) -> Result<(), SyncError> {
        let master_time = self.registry.get_time(master)?;
        if is_near_epoch(&master_time) {
            self.raise_near_epoch(master, &master_time);
            return match self.epoch_guard {
                EpochGuard::AlarmOnly => Ok(()),
                EpochGuard::PreventSync => {
                    self.offset_ns = diff.to_nanos_f64();
                    Err(SyncError::Retry)
                }
                EpochGuard::CorrectClock => {
                    self.registry.correct_new(master)?;
                    Err(SyncError::Retry)
                }
            };
        }

        let slave_time = self.registry.get_time(slave)?;
        if is_near_epoch(&slave_time) {
            self.raise_near_epoch(slave, &slave_time);
            if self.epoch_guard == EpochGuard::CorrectClock {
                self.registry.correct_new(slave)?;
                return Err(SyncError::Retry);
            }
            return Ok(());
        }

        if self.alarms.contains(Alarms::CLOCK_NEAR_EPOCH) {
            info!("{}: clock times plausible again", self.name);
            self.alarms.clear(Alarms::CLOCK_NEAR_EPOCH);
        }
        Ok(())
    }

    fn raise_near_epoch(&mut self, clock: &ClockHandle, time: &Timestamp) {
        if !self.alarms.contains(Alarms::CLOCK_NEAR_EPOCH) {
            warn!("{}: clock {} reads {}, near the epoch", self.name, clock.name(), time);
            self.alarms.set(Alarms::CLOCK_NEAR_EPOCH);
        }
        self.stats.record_near_epoch();
        self.active = true;
    }

    pub fn get_stats(&self) -> ServoStats {
        ServoStats {
            servo: self.name.clone(),
            master: self.master.as_ref().map(|c| c.name().to_string()).unwrap_or_default(),
            slave: self.slave.as_ref().map(|c| c.name().to_string()).unwrap_or_default(),
            offset_ns: self.offset_ns,
            freq_adj_ppb: self.freq_adjust,
            in_sync: self.synchronized,
            alarms: self.alarms,
            p_term: self.pid.p_term(),
            i_term: self.pid.i_term(),
            diff_method: self.diff_methods(),
        }
    }

    fn diff_methods(&self) -> String {
        let method = |c: &Option<ClockHandle>| c.as_ref().map_or("none", |c| self.registry.diff_method_name(c));
        format!("{}/{}", method(&self.slave), method(&self.master))
    }

    /// Human-readable snapshot of the servo.
    pub fn state_text(&self) -> String {
        let name = |c: &Option<ClockHandle>| c.as_ref().map_or("none".to_string(), |c| c.name().to_string());
        let mut out = String::new();
        let _ = writeln!(out, "clock-name: {}", name(&self.slave));
        let _ = writeln!(out, "state: local-slave");
        let _ = writeln!(out, "alarms: {}", self.alarms);
        let _ = writeln!(out, "reference-clock-name: {}", name(&self.master));
        let _ = writeln!(out, "offset-from-reference: {:.3}", self.offset_ns);
        let _ = writeln!(out, "freq-adjustment-ppb: {:.3}", self.freq_adjust);
        let _ = writeln!(out, "in-sync: {}", self.synchronized as u8);
        let _ = writeln!(out, "p-term: {:.3}", self.pid.p_term());
        let _ = writeln!(out, "i-term: {:.3}", self.pid.i_term());
        let _ = writeln!(out, "diff-method: {}", self.diff_methods());
        out
    }

    /// Write the state snapshot and, once synchronized, the frequency
    /// correction for the slave.
    pub fn save_state(&self) -> Result<(), ClockError> {
        let Some(slave) = &self.slave else {
            return Ok(());
        };
        if let Some(store) = self.registry.store() {
            store.write_state(slave.file_name(), &self.state_text())?;
        }
        if self.synchronized {
            self.registry.save_freq_correction(slave, self.freq_adjust)?;
        }
        Ok(())
    }

    /// Close the current statistics period.
    pub fn stats_end_period(&mut self, time: &Timestamp) {
        let closed = self.stats.end_period(time);
        debug!(
            "{}: period closed, {} samples, offset mean {:.3}ns",
            self.name, closed.samples, closed.offset_ns.mean
        );
        if let (Some(store), Some(slave)) = (self.registry.store(), &self.slave) {
            if let Err(e) = store.write_stats(slave.file_name(), &self.stats) {
                warn!("{}: failed to write statistics: {:#}", self.name, e);
            }
        }
    }
}
