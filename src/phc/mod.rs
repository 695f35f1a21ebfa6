//! PTP hardware clock comparison.
//!
//! A PHC can be compared with the system clock in several ways, from
//! hardware cross-timestamping down to bracketing a plain clock read between
//! two system clock reads. [`Phc`] tries the configured methods in order at
//! start-up and picks the first that works. If the chosen method later turns
//! out to be unsupported, it moves on to the next untried one; it never goes
//! back to an earlier method, with one exception: PPS, when the first pulses
//! simply had not arrived yet.
//!
//! ## PPS states
//! ```text
//! not-tried --try--> init --pulse--> good
//!                       |
//!                       +--no pulse--> not-ready --2.2s--> (retry PPS)
//!                                          |
//!                                          +--still no pulse--> bad
//! ```

#[cfg(target_os = "linux")]
pub mod linux;

use crate::clock::{ClockError, LeapSecond};
use crate::time::Timestamp;
use crate::traits::{ClockBackend, PhcDevice};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Samples taken by the windowed comparison methods.
pub const COMPARE_SAMPLES: u32 = 4;

/// Minimum spacing between PPS polls (seconds).
const PPS_MIN_INTERVAL: f64 = 0.9;
/// Delay before retrying PPS after no pulses were seen (seconds).
const PPS_RETRY_TIME: f64 = 2.2;

const HALF_SECOND_NS: u32 = 500_000_000;

// ============================================================================
// DEVICE DATA
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhcCaps {
    pub max_adj_ppb: i32,
    pub pps: bool,
    pub cross_timestamping: bool,
}

/// Result of a hardware cross-timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PreciseOffset {
    pub device: Timestamp,
    pub sys_realtime: Timestamp,
}

/// A device read bracketed by two system clock reads.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OffsetSample {
    pub sys_before: Timestamp,
    pub device: Timestamp,
    pub sys_after: Timestamp,
}

/// Assert edge of the PHC's PPS output as seen on the system clock.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PpsEvent {
    pub sequence: u32,
    pub assert: Timestamp,
}

// ============================================================================
// METHODS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiffMethod {
    SysOffsetPrecise,
    Pps,
    SysOffsetExt,
    SysOffset,
    ReadTime,
}

impl DiffMethod {
    pub const DEFAULT_ORDER: [DiffMethod; 5] = [
        DiffMethod::SysOffsetPrecise,
        DiffMethod::Pps,
        DiffMethod::SysOffsetExt,
        DiffMethod::SysOffset,
        DiffMethod::ReadTime,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DiffMethod::SysOffsetPrecise => "sys-offset-precise",
            DiffMethod::Pps => "pps",
            DiffMethod::SysOffsetExt => "sys-offset-ext",
            DiffMethod::SysOffset => "sys-offset",
            DiffMethod::ReadTime => "read-time",
        }
    }

    /// Parse an ordered list of method names, rejecting unknown and
    /// repeated entries.
    pub fn parse_order<S: AsRef<str>>(names: &[S]) -> Result<Vec<DiffMethod>, String> {
        if names.len() > Self::DEFAULT_ORDER.len() {
            return Err(format!("too many diff methods ({})", names.len()));
        }
        let mut order = Vec::with_capacity(names.len());
        for name in names {
            let method: DiffMethod = name.as_ref().parse()?;
            if order.contains(&method) {
                return Err(format!("diff method {} listed twice", method));
            }
            order.push(method);
        }
        Ok(order)
    }
}

impl fmt::Display for DiffMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DiffMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::DEFAULT_ORDER
            .iter()
            .copied()
            .find(|m| m.name() == s)
            .ok_or_else(|| format!("unknown diff method: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PpsState {
    NotTried,
    Init,
    NotReady,
    Good,
    Bad,
}

/// Pick the sample with the narrowest positive window and return
/// `device - midpoint(sys_before, sys_after)`.
pub fn smallest_window_diff(samples: &[OffsetSample]) -> Result<Timestamp, ClockError> {
    let mut best: Option<(Timestamp, &OffsetSample)> = None;
    for s in samples {
        let window = s.sys_after - s.sys_before;
        if window <= Timestamp::ZERO {
            continue;
        }
        if best.map_or(true, |(w, _)| window < w) {
            best = Some((window, s));
        }
    }

    let (window, s) = best.ok_or(ClockError::Retry)?;
    let half = Timestamp::from_nanos_f64(window.to_nanos_f64() / 2.0);
    Ok(s.device - s.sys_before - half)
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct Phc<D: PhcDevice> {
    device: D,
    name: String,
    caps: PhcCaps,
    order: Vec<DiffMethod>,
    /// Index into `order` of the last method tried.
    cursor: Option<usize>,
    selected: Option<DiffMethod>,
    pps_state: PpsState,
    pps_prev: PpsEvent,
    pps_prev_mono: Option<Timestamp>,
    diff_prev: Timestamp,
    stepped_since_sample: bool,
}

impl<D: PhcDevice> Phc<D> {
    pub fn new(device: D, name: &str, order: &[DiffMethod]) -> Result<Self, ClockError> {
        let caps = device.caps()?;
        debug!(
            "{}: max adjustment {}ppb, pps {}, cross timestamping {}",
            name, caps.max_adj_ppb, caps.pps, caps.cross_timestamping
        );
        Ok(Phc {
            device,
            name: name.to_string(),
            caps,
            order: order.to_vec(),
            cursor: None,
            selected: None,
            pps_state: PpsState::NotTried,
            pps_prev: PpsEvent::default(),
            pps_prev_mono: None,
            diff_prev: Timestamp::ZERO,
            stepped_since_sample: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn caps(&self) -> &PhcCaps {
        &self.caps
    }

    pub fn selected_method(&self) -> Option<DiffMethod> {
        self.selected
    }

    pub fn pps_state(&self) -> PpsState {
        self.pps_state
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Select the first working method from the top of the order.
    pub fn start(&mut self) -> Result<DiffMethod, ClockError> {
        self.cursor = None;
        self.fallback()
    }

    /// Advance to the next untried method that works on this device.
    fn fallback(&mut self) -> Result<DiffMethod, ClockError> {
        let first = self.cursor.map_or(0, |c| c + 1);
        for idx in first..self.order.len() {
            self.cursor = Some(idx);
            let method = self.order[idx];
            if self.try_method(method) {
                info!("{}: using diff method {}", self.name, method);
                self.selected = Some(method);
                return Ok(method);
            }
            debug!("{}: diff method {} not available", self.name, method);
        }

        self.selected = None;
        error!("{}: no usable diff method left", self.name);
        Err(ClockError::Unsupported)
    }

    fn try_method(&mut self, method: DiffMethod) -> bool {
        match method {
            DiffMethod::SysOffsetPrecise => self.caps.cross_timestamping,
            DiffMethod::Pps => {
                if !self.caps.pps || self.pps_state == PpsState::Bad {
                    return false;
                }
                match self.device.configure_pps() {
                    Ok(()) => {
                        self.pps_state = PpsState::Init;
                        true
                    }
                    Err(e) => {
                        debug!("{}: pps unavailable: {}", self.name, e);
                        self.pps_state = PpsState::Bad;
                        false
                    }
                }
            }
            DiffMethod::SysOffsetExt => self.device.sys_offset_extended(1).is_ok(),
            DiffMethod::SysOffset => self.device.sys_offset_supported(),
            DiffMethod::ReadTime => true,
        }
    }

    /// Offset of the PHC from the system clock (phc - system).
    pub fn compare_to_sys(&mut self) -> Result<Timestamp, ClockError> {
        if self.pps_state == PpsState::NotReady {
            self.maybe_retry_pps()?;
        }

        loop {
            let method = self.selected.ok_or(ClockError::Unsupported)?;
            match self.compare_with(method) {
                Err(ClockError::Unsupported) => {
                    warn!("{}: diff method {} failed, falling back", self.name, method);
                    self.fallback()?;
                }
                other => return other,
            }
        }
    }

    fn maybe_retry_pps(&mut self) -> Result<(), ClockError> {
        let Some(since) = self.pps_prev_mono else {
            return Ok(());
        };
        let now = self.device.read_monotonic()?;
        if (now - since).to_secs_f64() < PPS_RETRY_TIME {
            return Ok(());
        }
        if let Some(idx) = self.order.iter().position(|m| *m == DiffMethod::Pps) {
            info!("{}: retrying pps", self.name);
            self.cursor = Some(idx);
            self.selected = Some(DiffMethod::Pps);
        }
        Ok(())
    }

    fn compare_with(&mut self, method: DiffMethod) -> Result<Timestamp, ClockError> {
        match method {
            DiffMethod::SysOffsetPrecise => {
                let p = self.device.sys_offset_precise()?;
                Ok(p.device - p.sys_realtime)
            }
            DiffMethod::Pps => self.compare_pps(),
            DiffMethod::SysOffsetExt => {
                let samples = self.device.sys_offset_extended(COMPARE_SAMPLES)?;
                smallest_window_diff(&samples)
            }
            DiffMethod::SysOffset => {
                let samples = self.device.sys_offset(COMPARE_SAMPLES)?;
                smallest_window_diff(&samples)
            }
            DiffMethod::ReadTime => self.compare_read_time(),
        }
    }

    fn compare_read_time(&mut self) -> Result<Timestamp, ClockError> {
        let mut samples = [OffsetSample::default(); COMPARE_SAMPLES as usize];
        for s in samples.iter_mut() {
            s.sys_before = self.device.read_system_time()?;
            s.device = self.device.read_time()?;
            s.sys_after = self.device.read_system_time()?;
        }
        smallest_window_diff(&samples)
    }

    fn cached_pps_diff(&self) -> Result<Timestamp, ClockError> {
        if self.stepped_since_sample {
            Err(ClockError::Retry)
        } else {
            Ok(self.diff_prev)
        }
    }

    fn compare_pps(&mut self) -> Result<Timestamp, ClockError> {
        let now = self.device.read_monotonic()?;
        if let Some(prev) = self.pps_prev_mono {
            if (now - prev).to_secs_f64() < PPS_MIN_INTERVAL {
                return self.cached_pps_diff();
            }
        }

        let event = self.device.fetch_pps()?;
        if event.sequence == self.pps_prev.sequence {
            if !event.assert.is_zero() {
                return self.cached_pps_diff();
            }
            if self.pps_state == PpsState::Init {
                info!("{}: no pps pulses yet, using another method for now", self.name);
                self.pps_state = PpsState::NotReady;
                self.pps_prev_mono = Some(now);
            } else {
                warn!("{}: no pps pulses, giving up on pps", self.name);
                self.pps_state = PpsState::Bad;
            }
            return Err(ClockError::Unsupported);
        }

        if self.pps_state != PpsState::Good {
            info!("{}: pps pulses arriving", self.name);
        }
        self.pps_state = PpsState::Good;

        // Whole seconds from a coarse comparison, sub-second part from the
        // pulse, which marks the PHC's top of second.
        let approx = self.compare_read_time()?;
        let mut sec = approx.sec() + (approx.nsec() >= HALF_SECOND_NS) as i64;
        let nsec = 1_000_000_000 - event.assert.nsec() as i64;
        if nsec >= HALF_SECOND_NS as i64 {
            sec -= 1;
        }
        let diff = Timestamp::new(sec, nsec);

        self.pps_prev = event;
        self.pps_prev_mono = Some(now);
        self.diff_prev = diff;
        self.stepped_since_sample = false;
        Ok(diff)
    }
}

impl<D: PhcDevice> ClockBackend for Phc<D> {
    fn get_time(&self) -> Result<Timestamp, ClockError> {
        self.device.read_time()
    }

    fn compare_to_system(&mut self) -> Result<Timestamp, ClockError> {
        self.compare_to_sys()
    }

    fn adjust_time(&mut self, offset: &Timestamp) -> Result<(), ClockError> {
        self.device.adjust_time(offset)
    }

    fn adjust_frequency(&mut self, ppb: f64) -> Result<(), ClockError> {
        self.device.adjust_frequency(ppb)
    }

    fn max_freq_adj_ppb(&self) -> f64 {
        self.caps.max_adj_ppb as f64
    }

    fn diff_method_name(&self) -> &'static str {
        self.selected.map_or("none", |m| m.name())
    }

    fn record_step(&mut self) {
        self.stepped_since_sample = true;
    }

    fn schedule_leap_second(&mut self, _leap: LeapSecond) -> Result<(), ClockError> {
        Err(ClockError::Unsupported)
    }
}
