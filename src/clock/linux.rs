use super::{ClockError, LeapSecond};
use crate::time::Timestamp;
use crate::traits::ClockBackend;
use libc::{self, adjtimex, timex, ADJ_FREQUENCY, ADJ_NANO, ADJ_SETOFFSET, ADJ_STATUS, STA_DEL, STA_INS};
use log::{debug, info};
use std::mem;

/// Kernel frequency adjustment limit (500 ppm).
const SYSTEM_MAX_FREQ_ADJ_PPB: f64 = 500_000.0;

/// `timex.freq` is ppm with a 16-bit fractional part.
pub(crate) fn ppb_to_timex_freq(ppb: f64) -> libc::c_long {
    (ppb * 65536.0 / 1000.0) as libc::c_long
}

pub(crate) fn timex_freq_to_ppb(freq: libc::c_long) -> f64 {
    freq as f64 * 1000.0 / 65536.0
}

/// Fill `tx.time` for ADJ_SETOFFSET | ADJ_NANO. The kernel wants a
/// non-negative sub-second part, which a normalised Timestamp already is.
pub(crate) fn set_offset_timex(tx: &mut timex, offset: &Timestamp) {
    tx.modes = ADJ_SETOFFSET | ADJ_NANO;
    tx.time.tv_sec = offset.sec() as libc::time_t;
    tx.time.tv_usec = offset.nsec() as libc::suseconds_t;
}

pub(crate) fn clock_gettime(clock: libc::clockid_t) -> Result<Timestamp, ClockError> {
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    let ret = unsafe { libc::clock_gettime(clock, &mut ts) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(Timestamp::new(ts.tv_sec as i64, ts.tv_nsec as i64))
}

/// The CLOCK_REALTIME clock, disciplined through adjtimex.
pub struct SystemClock {
    initial_freq_ppb: f64,
}

impl SystemClock {
    pub fn new() -> Result<Self, ClockError> {
        let mut tx: timex = unsafe { mem::zeroed() };
        tx.modes = 0; // Query mode

        let ret = unsafe { adjtimex(&mut tx) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        let initial_freq_ppb = timex_freq_to_ppb(tx.freq);
        debug!("system clock: kernel frequency adjustment {:.3}ppb", initial_freq_ppb);
        Ok(SystemClock { initial_freq_ppb })
    }

    /// Frequency adjustment the kernel had before we touched it.
    pub fn initial_freq_ppb(&self) -> f64 {
        self.initial_freq_ppb
    }
}

impl ClockBackend for SystemClock {
    fn get_time(&self) -> Result<Timestamp, ClockError> {
        clock_gettime(libc::CLOCK_REALTIME)
    }

    fn compare_to_system(&mut self) -> Result<Timestamp, ClockError> {
        Ok(Timestamp::ZERO)
    }

    fn adjust_time(&mut self, offset: &Timestamp) -> Result<(), ClockError> {
        let mut tx: timex = unsafe { mem::zeroed() };
        set_offset_timex(&mut tx, offset);

        let ret = unsafe { adjtimex(&mut tx) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn adjust_frequency(&mut self, ppb: f64) -> Result<(), ClockError> {
        let mut tx: timex = unsafe { mem::zeroed() };
        tx.modes = ADJ_FREQUENCY;
        tx.freq = ppb_to_timex_freq(ppb);

        let ret = unsafe { adjtimex(&mut tx) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn max_freq_adj_ppb(&self) -> f64 {
        SYSTEM_MAX_FREQ_ADJ_PPB
    }

    fn diff_method_name(&self) -> &'static str {
        "system"
    }

    fn record_step(&mut self) {}

    fn schedule_leap_second(&mut self, leap: LeapSecond) -> Result<(), ClockError> {
        let mut tx: timex = unsafe { mem::zeroed() };
        if unsafe { adjtimex(&mut tx) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        tx.modes = ADJ_STATUS;
        tx.status &= !(STA_INS | STA_DEL);
        match leap {
            LeapSecond::Insert => tx.status |= STA_INS,
            LeapSecond::Delete => tx.status |= STA_DEL,
            LeapSecond::None => {}
        }

        if unsafe { adjtimex(&mut tx) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        info!("system clock: leap second flags now {:?}", leap);
        Ok(())
    }
}
