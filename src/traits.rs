use crate::clock::{ClockError, LeapSecond};
use crate::phc::{OffsetSample, PhcCaps, PpsEvent, PreciseOffset};
use crate::time::Timestamp;

/// A clock that can be read, compared against the system clock and
/// disciplined. Implemented by the system clock and by PHC devices.
#[cfg_attr(test, mockall::automock)]
pub trait ClockBackend: Send {
    fn get_time(&self) -> Result<Timestamp, ClockError>;

    /// Offset of this clock from the system clock (this - system).
    fn compare_to_system(&mut self) -> Result<Timestamp, ClockError>;

    /// Step the clock by `offset`.
    fn adjust_time(&mut self, offset: &Timestamp) -> Result<(), ClockError>;

    /// Set the frequency adjustment in parts per billion.
    fn adjust_frequency(&mut self, ppb: f64) -> Result<(), ClockError>;

    fn max_freq_adj_ppb(&self) -> f64;

    /// Name of the comparison method currently in use.
    fn diff_method_name(&self) -> &'static str;

    /// Notify the clock that it, or a clock it is compared with, was stepped.
    fn record_step(&mut self);

    fn schedule_leap_second(&mut self, leap: LeapSecond) -> Result<(), ClockError>;
}

/// Raw access to a PTP hardware clock and its PPS companion device.
#[cfg_attr(test, mockall::automock)]
pub trait PhcDevice: Send {
    fn caps(&self) -> Result<PhcCaps, ClockError>;

    fn sys_offset_precise(&mut self) -> Result<PreciseOffset, ClockError>;

    fn sys_offset_extended(&mut self, samples: u32) -> Result<Vec<OffsetSample>, ClockError>;

    fn sys_offset(&mut self, samples: u32) -> Result<Vec<OffsetSample>, ClockError>;

    /// Whether the basic PTP_SYS_OFFSET call is implemented by the driver.
    fn sys_offset_supported(&mut self) -> bool;

    /// Enable PPS output and open the matching PPS device.
    fn configure_pps(&mut self) -> Result<(), ClockError>;

    /// Latest PPS event, which may be the same one as last time.
    fn fetch_pps(&mut self) -> Result<PpsEvent, ClockError>;

    fn read_time(&self) -> Result<Timestamp, ClockError>;

    fn read_system_time(&self) -> Result<Timestamp, ClockError>;

    fn read_monotonic(&self) -> Result<Timestamp, ClockError>;

    fn adjust_time(&mut self, offset: &Timestamp) -> Result<(), ClockError>;

    fn adjust_frequency(&mut self, ppb: f64) -> Result<(), ClockError>;
}
