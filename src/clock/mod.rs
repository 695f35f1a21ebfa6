//! Clock registry.
//!
//! Every clock the daemon knows about (the system clock and each PHC) is
//! registered here. All hardware-touching operations go through one lock so
//! that servos running against shared clocks never interleave a compare with
//! another servo's step. Immutable facts (name, maximum adjustment) live in
//! the [`ClockHandle`] and are readable without taking the lock.

#[cfg(target_os = "linux")]
pub mod linux;

use crate::persist::StateStore;
use crate::time::Timestamp;
use crate::traits::ClockBackend;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[cfg(target_os = "linux")]
pub use linux::SystemClock;

/// Consecutive good comparisons needed before a failure is only traced.
const CLOCK_BAD_COMPARE_WARN_THRESHOLD: u32 = 16;

/// Anything below this (1e16 ns, about 115 days) was never set properly.
const NEAR_EPOCH_SECS: i64 = 10_000_000;
/// Upper bound of the time representable by the hardware.
const HW_MAX_SECS: i64 = 0xFFFC_0000;

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("operation not supported")]
    Unsupported,
    #[error("try again")]
    Retry,
    #[error("no such device: {0}")]
    NoDevice(String),
    #[error("clock has been deleted")]
    Deleted,
    #[error("value out of range: {0}")]
    OutOfRange(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClockError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, ClockError::Unsupported)
    }
}

#[cfg(unix)]
impl From<nix::errno::Errno> for ClockError {
    fn from(e: nix::errno::Errno) -> Self {
        use nix::errno::Errno;
        match e {
            Errno::EOPNOTSUPP | Errno::ENOTTY | Errno::ENOSYS => ClockError::Unsupported,
            Errno::EAGAIN | Errno::EINTR => ClockError::Retry,
            Errno::ENODEV | Errno::ENOENT => ClockError::NoDevice(e.desc().to_string()),
            other => ClockError::Io(std::io::Error::from_raw_os_error(other as i32)),
        }
    }
}

/// True when a reading is implausible: close to the Unix epoch or beyond
/// what the hardware can represent.
pub fn is_near_epoch(time: &Timestamp) -> bool {
    time.sec() < NEAR_EPOCH_SECS || time.sec() > HW_MAX_SECS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockKind {
    System,
    Phc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeapSecond {
    None,
    /// 23:59:60 is inserted.
    Insert,
    /// 23:59:59 is skipped.
    Delete,
}

#[derive(Debug, Clone, Copy)]
pub struct ClockOptions {
    pub discipline: bool,
    pub read_only: bool,
}

impl Default for ClockOptions {
    fn default() -> Self {
        ClockOptions {
            discipline: true,
            read_only: false,
        }
    }
}

#[derive(Debug)]
struct ClockInfo {
    index: usize,
    name: String,
    file_name: String,
    kind: ClockKind,
    max_freq_adj_ppb: f64,
}

/// Cheap, cloneable reference to a registered clock.
#[derive(Clone)]
pub struct ClockHandle(Arc<ClockInfo>);

impl ClockHandle {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Name used for files in the state directory.
    pub fn file_name(&self) -> &str {
        &self.0.file_name
    }

    pub fn kind(&self) -> ClockKind {
        self.0.kind
    }

    pub fn is_system(&self) -> bool {
        self.0.kind == ClockKind::System
    }

    pub fn max_freq_adj_ppb(&self) -> f64 {
        self.0.max_freq_adj_ppb
    }
}

impl PartialEq for ClockHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.index == other.0.index
    }
}

impl Eq for ClockHandle {}

impl fmt::Debug for ClockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClockHandle({})", self.0.name)
    }
}

struct ClockEntry {
    handle: ClockHandle,
    backend: Box<dyn ClockBackend>,
    deleted: bool,
    discipline: bool,
    read_only: bool,
    blocked_count: u32,
    been_locked: bool,
    good_compare_count: u32,
}

impl ClockEntry {
    fn is_writable(&self) -> bool {
        self.discipline && !self.read_only && self.blocked_count < 1
    }
}

pub struct ClockRegistry {
    clocks: Mutex<Vec<ClockEntry>>,
    store: Option<StateStore>,
}

impl ClockRegistry {
    pub fn new(store: Option<StateStore>) -> Self {
        ClockRegistry {
            clocks: Mutex::new(Vec::new()),
            store,
        }
    }

    pub fn store(&self) -> Option<&StateStore> {
        self.store.as_ref()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ClockEntry>> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.clocks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn entry<'a>(clocks: &'a mut [ClockEntry], h: &ClockHandle) -> Result<&'a mut ClockEntry, ClockError> {
        match clocks.get_mut(h.0.index) {
            Some(e) if !e.deleted => Ok(e),
            _ => Err(ClockError::Deleted),
        }
    }

    pub fn register(&self, name: &str, kind: ClockKind, backend: Box<dyn ClockBackend>, options: ClockOptions) -> ClockHandle {
        let mut clocks = self.lock();
        let file_name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        let handle = ClockHandle(Arc::new(ClockInfo {
            index: clocks.len(),
            name: name.to_string(),
            file_name,
            kind,
            max_freq_adj_ppb: backend.max_freq_adj_ppb(),
        }));
        info!(
            "clock {}: registered, max adjustment {:.0}ppb, diff method {}",
            name,
            handle.max_freq_adj_ppb(),
            backend.diff_method_name()
        );
        clocks.push(ClockEntry {
            handle: handle.clone(),
            backend,
            deleted: false,
            discipline: options.discipline,
            read_only: options.read_only,
            blocked_count: 0,
            been_locked: false,
            good_compare_count: 0,
        });
        handle
    }

    pub fn remove(&self, h: &ClockHandle) {
        if let Ok(entry) = Self::entry(&mut self.lock(), h) {
            entry.deleted = true;
            info!("clock {}: deleted", h.name());
        }
    }

    /// Read a clock to see whether its device is still there. A clock whose
    /// device has gone is removed from the registry.
    pub fn check_present(&self, h: &ClockHandle) -> bool {
        match self.get_time(h) {
            Ok(_) => true,
            Err(ClockError::NoDevice(e)) => {
                warn!("clock {}: device has gone ({})", h.name(), e);
                self.remove(h);
                false
            }
            Err(ClockError::Deleted) => false,
            Err(_) => true,
        }
    }

    /// Apply per-clock options by name. Unknown names are an error.
    pub fn configure(&self, read_only: &[String], undisciplined: &[String]) -> Result<(), ClockError> {
        for name in read_only {
            let h = self.find(name).ok_or_else(|| ClockError::NoDevice(name.clone()))?;
            info!("clock {}: read-only", name);
            self.set_read_only(&h, true);
        }
        for name in undisciplined {
            let h = self.find(name).ok_or_else(|| ClockError::NoDevice(name.clone()))?;
            info!("clock {}: not disciplined", name);
            self.set_discipline(&h, false);
        }
        Ok(())
    }

    pub fn clocks(&self) -> Vec<ClockHandle> {
        self.lock().iter().filter(|e| !e.deleted).map(|e| e.handle.clone()).collect()
    }

    pub fn find(&self, name: &str) -> Option<ClockHandle> {
        self.clocks().into_iter().find(|h| h.name() == name)
    }

    pub fn system_clock(&self) -> Option<ClockHandle> {
        self.clocks().into_iter().find(|h| h.is_system())
    }

    pub fn get_time(&self, h: &ClockHandle) -> Result<Timestamp, ClockError> {
        let mut clocks = self.lock();
        Self::entry(&mut clocks, h)?.backend.get_time()
    }

    /// Offset of `c1` from `c2` (c1 - c2).
    pub fn compare(&self, c1: &ClockHandle, c2: &ClockHandle) -> Result<Timestamp, ClockError> {
        let result = {
            let mut clocks = self.lock();
            if Self::entry(&mut clocks, c1).is_err() || Self::entry(&mut clocks, c2).is_err() {
                return Err(ClockError::Deleted);
            }
            Self::compare_to_system(&mut clocks, c1)
                .and_then(|d1| Self::compare_to_system(&mut clocks, c2).map(|d2| d1 - d2))
        };

        if let Err(ClockError::Unsupported) = result {
            error!(
                "no usable method left to compare {} and {}, clock correction is impossible",
                c1.name(),
                c2.name()
            );
        }
        result
    }

    fn compare_to_system(clocks: &mut [ClockEntry], h: &ClockHandle) -> Result<Timestamp, ClockError> {
        let entry = Self::entry(clocks, h)?;
        if h.is_system() {
            return Ok(Timestamp::ZERO);
        }
        match entry.backend.compare_to_system() {
            Ok(diff) => {
                entry.good_compare_count = entry.good_compare_count.saturating_add(1);
                Ok(diff)
            }
            Err(e) => {
                if entry.good_compare_count < CLOCK_BAD_COMPARE_WARN_THRESHOLD {
                    warn!("failed to compare clock {} and system clock: {}", h.name(), e);
                } else {
                    debug!("failed to compare clock {} and system clock: {}", h.name(), e);
                }
                entry.good_compare_count = 0;
                Err(e)
            }
        }
    }

    /// Step a clock. Every PHC is told a step happened so that cached
    /// comparisons against the stepped clock are discarded.
    pub fn adjust_time(&self, h: &ClockHandle, offset: &Timestamp) -> Result<(), ClockError> {
        let mut clocks = self.lock();
        let entry = Self::entry(&mut clocks, h)?;
        if !entry.is_writable() {
            debug!("clock {}: not writable, ignoring step of {}", h.name(), offset);
            return Ok(());
        }

        info!("clock {}: stepping by {}", h.name(), offset);
        entry.backend.adjust_time(offset)?;

        for e in clocks.iter_mut().filter(|e| !e.deleted && e.handle.kind() == ClockKind::Phc) {
            e.backend.record_step();
        }
        Ok(())
    }

    /// Apply a frequency adjustment, saturated to the clock's limit.
    pub fn adjust_frequency(&self, h: &ClockHandle, ppb: f64) -> Result<(), ClockError> {
        let mut clocks = self.lock();
        let entry = Self::entry(&mut clocks, h)?;
        if !entry.is_writable() {
            return Ok(());
        }
        let max = h.max_freq_adj_ppb();
        entry.backend.adjust_frequency(ppb.clamp(-max, max))
    }

    /// Step `to` onto the time of `from`.
    pub fn set_time(&self, to: &ClockHandle, from: &ClockHandle) -> Result<(), ClockError> {
        let diff = self.compare(to, from)?;
        self.adjust_time(to, &-diff)
    }

    /// Bring a NIC clock that still reads close to the epoch onto system time.
    pub fn correct_new(&self, h: &ClockHandle) -> Result<(), ClockError> {
        if h.is_system() {
            return Ok(());
        }
        let now = self.get_time(h)?;
        if !is_near_epoch(&now) {
            return Ok(());
        }

        let diff = {
            let mut clocks = self.lock();
            Self::entry(&mut clocks, h)?.backend.compare_to_system()?
        };
        info!("clock {}: time {} is not plausible, setting from system clock", h.name(), now);
        self.adjust_time(h, &-diff)
    }

    pub fn is_writable(&self, h: &ClockHandle) -> bool {
        Self::entry(&mut self.lock(), h).map_or(false, |e| e.is_writable())
    }

    pub fn set_read_only(&self, h: &ClockHandle, read_only: bool) {
        if let Ok(e) = Self::entry(&mut self.lock(), h) {
            e.read_only = read_only;
        }
    }

    pub fn set_discipline(&self, h: &ClockHandle, discipline: bool) {
        if let Ok(e) = Self::entry(&mut self.lock(), h) {
            e.discipline = discipline;
        }
    }

    /// Blocking nests: a clock blocked twice needs two unblocks.
    pub fn set_blocked(&self, h: &ClockHandle, blocked: bool) {
        if let Ok(e) = Self::entry(&mut self.lock(), h) {
            if blocked {
                e.blocked_count += 1;
            } else {
                e.blocked_count = e.blocked_count.saturating_sub(1);
            }
        }
    }

    pub fn been_locked(&self, h: &ClockHandle) -> bool {
        Self::entry(&mut self.lock(), h).map_or(false, |e| e.been_locked)
    }

    pub fn set_been_locked(&self, h: &ClockHandle, locked: bool) {
        if let Ok(e) = Self::entry(&mut self.lock(), h) {
            e.been_locked = locked;
        }
    }

    pub fn diff_method_name(&self, h: &ClockHandle) -> &'static str {
        Self::entry(&mut self.lock(), h).map_or("none", |e| e.backend.diff_method_name())
    }

    /// Saved frequency correction for a clock, 0 if none or out of range.
    /// An out-of-range record is deleted.
    pub fn load_freq_correction(&self, h: &ClockHandle) -> f64 {
        let Some(store) = &self.store else {
            return 0.0;
        };
        match store.load_freq_correction(h.file_name()) {
            Ok(Some(ppb)) if ppb.abs() <= h.max_freq_adj_ppb() => {
                info!("clock {}: restored frequency correction {:.3}ppb", h.name(), ppb);
                ppb
            }
            Ok(Some(ppb)) => {
                warn!(
                    "clock {}: saved frequency correction {:.3}ppb out of range, discarding",
                    h.name(),
                    ppb
                );
                if let Err(e) = store.delete_freq_correction(h.file_name()) {
                    warn!("clock {}: failed to delete frequency correction: {}", h.name(), e);
                }
                0.0
            }
            Ok(None) => 0.0,
            Err(e) => {
                warn!("clock {}: failed to read frequency correction: {}", h.name(), e);
                0.0
            }
        }
    }

    pub fn save_freq_correction(&self, h: &ClockHandle, ppb: f64) -> Result<(), ClockError> {
        if ppb.abs() > h.max_freq_adj_ppb() {
            return Err(ClockError::OutOfRange(format!("{:.3}ppb", ppb)));
        }
        match &self.store {
            Some(store) => Ok(store.save_freq_correction(h.file_name(), ppb)?),
            None => Ok(()),
        }
    }

    /// Arm the kernel to apply a leap second at the end of the UTC day.
    pub fn schedule_leap_second(&self, leap: LeapSecond) -> Result<(), ClockError> {
        let mut clocks = self.lock();
        let entry = clocks
            .iter_mut()
            .find(|e| !e.deleted && e.handle.is_system())
            .ok_or_else(|| ClockError::NoDevice("system clock".to_string()))?;
        if !entry.is_writable() {
            return Ok(());
        }
        info!("scheduling leap second: {:?}", leap);
        entry.backend.schedule_leap_second(leap)
    }

    /// Apply a leap second to every writable PHC right now.
    pub fn leap_second_now(&self, leap: LeapSecond) -> Result<(), ClockError> {
        let step = match leap {
            LeapSecond::None => return Ok(()),
            LeapSecond::Insert => Timestamp::from_secs(-1),
            LeapSecond::Delete => Timestamp::from_secs(1),
        };

        let phcs: Vec<ClockHandle> = self.clocks().into_iter().filter(|h| h.kind() == ClockKind::Phc).collect();
        let mut result = Ok(());
        for h in phcs.iter().filter(|h| self.is_writable(h)) {
            if let Err(e) = self.adjust_time(h, &step) {
                error!("clock {}: failed to apply leap second: {}", h.name(), e);
                result = Err(e);
            }
        }
        result
    }
}
