//! PHC access through `/dev/ptpN` and its PPS companion `/dev/ppsM`.

use super::{OffsetSample, PhcCaps, PpsEvent, PreciseOffset};
use crate::clock::linux::{clock_gettime, ppb_to_timex_freq, set_offset_timex};
use crate::clock::ClockError;
use crate::time::Timestamp;
use crate::traits::PhcDevice;
use libc::{self, timex, ADJ_FREQUENCY};
use log::debug;
use nix::errno::Errno;
use nix::{ioctl_read, ioctl_readwrite, ioctl_write_int, request_code_readwrite, request_code_write};
use std::fs::{self, File, OpenOptions};
use std::mem;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

const PTP_CLK_MAGIC: u8 = b'=';
const PTP_MAX_SAMPLES: usize = 25;
const PPS_MAGIC: u8 = b'p';
const PPS_FETCH_CMD: u8 = 0xa4;
const PPS_TIME_INVALID: u32 = 1;

const SYSFS_PPS_PATH: &str = "/sys/class/pps";

// Kernel ABI structures, see include/uapi/linux/ptp_clock.h and pps.h

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PtpClockTime {
    pub sec: i64,
    pub nsec: u32,
    pub reserved: u32,
}

impl From<PtpClockTime> for Timestamp {
    fn from(t: PtpClockTime) -> Self {
        Timestamp::new(t.sec, t.nsec as i64)
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PtpClockCaps {
    pub max_adj: i32,
    pub n_alarm: i32,
    pub n_ext_ts: i32,
    pub n_per_out: i32,
    pub pps: i32,
    pub n_pins: i32,
    pub cross_timestamping: i32,
    pub adjust_phase: i32,
    pub max_phase_adj: i32,
    pub rsv: [i32; 11],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PtpSysOffset {
    pub n_samples: u32,
    pub rsv: [u32; 3],
    pub ts: [PtpClockTime; 2 * PTP_MAX_SAMPLES + 1],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PtpSysOffsetPrecise {
    pub device: PtpClockTime,
    pub sys_realtime: PtpClockTime,
    pub sys_monoraw: PtpClockTime,
    pub rsv: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PtpSysOffsetExtended {
    pub n_samples: u32,
    pub rsv: [u32; 3],
    pub ts: [[PtpClockTime; 3]; PTP_MAX_SAMPLES],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PpsKTime {
    pub sec: i64,
    pub nsec: i32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PpsKInfo {
    pub assert_sequence: u32,
    pub clear_sequence: u32,
    pub assert_tu: PpsKTime,
    pub clear_tu: PpsKTime,
    pub current_mode: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PpsFData {
    pub info: PpsKInfo,
    pub timeout: PpsKTime,
}

ioctl_read!(ptp_clock_getcaps, PTP_CLK_MAGIC, 1, PtpClockCaps);
ioctl_write_int!(ptp_enable_pps, PTP_CLK_MAGIC, 4);
ioctl_readwrite!(ptp_sys_offset_precise, PTP_CLK_MAGIC, 8, PtpSysOffsetPrecise);
ioctl_readwrite!(ptp_sys_offset_extended, PTP_CLK_MAGIC, 9, PtpSysOffsetExtended);

/// PTP_SYS_OFFSET is declared write-only although the kernel fills it in.
fn ptp_sys_offset_request() -> libc::c_ulong {
    request_code_write!(PTP_CLK_MAGIC, 5, mem::size_of::<PtpSysOffset>()) as libc::c_ulong
}

/// PPS_FETCH is declared with a pointer as its size argument.
fn pps_fetch_request() -> libc::c_ulong {
    request_code_readwrite!(PPS_MAGIC, PPS_FETCH_CMD, mem::size_of::<*mut PpsFData>()) as libc::c_ulong
}

/// Dynamic POSIX clock id for an open PHC character device.
pub fn fd_to_clockid(fd: libc::c_int) -> libc::clockid_t {
    ((!fd) << 3) | 3
}

/// Split the interleaved system/device/system readings of PTP_SYS_OFFSET.
pub fn parse_sys_offset(ts: &[PtpClockTime], n_samples: usize) -> Vec<OffsetSample> {
    (0..n_samples)
        .filter(|i| 2 * i + 2 < ts.len())
        .map(|i| OffsetSample {
            sys_before: ts[2 * i].into(),
            device: ts[2 * i + 1].into(),
            sys_after: ts[2 * i + 2].into(),
        })
        .collect()
}

pub struct LinuxPhc {
    index: u32,
    file: File,
    clock_id: libc::clockid_t,
    pps: Option<File>,
}

impl LinuxPhc {
    pub fn open(index: u32) -> Result<Self, ClockError> {
        let path = format!("/dev/ptp{}", index);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ClockError::NoDevice(path.clone()),
                _ => ClockError::Io(e),
            })?;
        let clock_id = fd_to_clockid(file.as_raw_fd());
        debug!("opened {} as clock id {}", path, clock_id);
        Ok(LinuxPhc {
            index,
            file,
            clock_id,
            pps: None,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Find `/dev/ppsM` whose sysfs name is `ptpN`.
    fn find_pps_device(&self) -> Result<PathBuf, ClockError> {
        let wanted = format!("ptp{}", self.index);
        for entry in fs::read_dir(SYSFS_PPS_PATH)? {
            let entry = entry?;
            let name = fs::read_to_string(entry.path().join("name")).unwrap_or_default();
            if name.trim() == wanted {
                return Ok(Path::new("/dev").join(entry.file_name()));
            }
        }
        Err(ClockError::NoDevice(format!("pps device for {}", wanted)))
    }
}

impl PhcDevice for LinuxPhc {
    fn caps(&self) -> Result<PhcCaps, ClockError> {
        let mut caps = PtpClockCaps::default();
        unsafe { ptp_clock_getcaps(self.file.as_raw_fd(), &mut caps) }?;
        Ok(PhcCaps {
            max_adj_ppb: caps.max_adj,
            pps: caps.pps != 0,
            cross_timestamping: caps.cross_timestamping != 0,
        })
    }

    fn sys_offset_precise(&mut self) -> Result<PreciseOffset, ClockError> {
        let mut data = PtpSysOffsetPrecise::default();
        unsafe { ptp_sys_offset_precise(self.file.as_raw_fd(), &mut data) }?;
        Ok(PreciseOffset {
            device: data.device.into(),
            sys_realtime: data.sys_realtime.into(),
        })
    }

    fn sys_offset_extended(&mut self, samples: u32) -> Result<Vec<OffsetSample>, ClockError> {
        let n = (samples as usize).min(PTP_MAX_SAMPLES);
        let mut data = PtpSysOffsetExtended {
            n_samples: n as u32,
            rsv: [0; 3],
            ts: [[PtpClockTime::default(); 3]; PTP_MAX_SAMPLES],
        };
        unsafe { ptp_sys_offset_extended(self.file.as_raw_fd(), &mut data) }?;
        Ok(data.ts[..n]
            .iter()
            .map(|t| OffsetSample {
                sys_before: t[0].into(),
                device: t[1].into(),
                sys_after: t[2].into(),
            })
            .collect())
    }

    fn sys_offset(&mut self, samples: u32) -> Result<Vec<OffsetSample>, ClockError> {
        let n = (samples as usize).min(PTP_MAX_SAMPLES);
        let mut data = PtpSysOffset {
            n_samples: n as u32,
            rsv: [0; 3],
            ts: [PtpClockTime::default(); 2 * PTP_MAX_SAMPLES + 1],
        };
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), ptp_sys_offset_request() as _, &mut data) };
        Errno::result(ret)?;
        Ok(parse_sys_offset(&data.ts, n))
    }

    fn sys_offset_supported(&mut self) -> bool {
        // With a null argument a supporting driver fails the copy from user
        // space; anything else means the call is not implemented.
        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                ptp_sys_offset_request() as _,
                std::ptr::null_mut::<PtpSysOffset>(),
            )
        };
        ret < 0 && Errno::last() == Errno::EFAULT
    }

    fn configure_pps(&mut self) -> Result<(), ClockError> {
        unsafe { ptp_enable_pps(self.file.as_raw_fd(), 1) }?;
        let path = self.find_pps_device()?;
        let pps = File::open(&path)?;
        debug!("ptp{}: pps events from {}", self.index, path.display());
        self.pps = Some(pps);
        Ok(())
    }

    fn fetch_pps(&mut self) -> Result<PpsEvent, ClockError> {
        let pps = self.pps.as_ref().ok_or(ClockError::Unsupported)?;
        let mut data = PpsFData::default();
        // Zero timeout: return the latest event immediately.
        data.timeout.flags = !PPS_TIME_INVALID;
        let ret = unsafe { libc::ioctl(pps.as_raw_fd(), pps_fetch_request() as _, &mut data) };
        Errno::result(ret)?;
        Ok(PpsEvent {
            sequence: data.info.assert_sequence,
            assert: Timestamp::new(data.info.assert_tu.sec, data.info.assert_tu.nsec as i64),
        })
    }

    fn read_time(&self) -> Result<Timestamp, ClockError> {
        clock_gettime(self.clock_id)
    }

    fn read_system_time(&self) -> Result<Timestamp, ClockError> {
        clock_gettime(libc::CLOCK_REALTIME)
    }

    fn read_monotonic(&self) -> Result<Timestamp, ClockError> {
        clock_gettime(libc::CLOCK_MONOTONIC)
    }

    fn adjust_time(&mut self, offset: &Timestamp) -> Result<(), ClockError> {
        let mut tx: timex = unsafe { mem::zeroed() };
        set_offset_timex(&mut tx, offset);
        let ret = unsafe { libc::clock_adjtime(self.clock_id, &mut tx) };
        Errno::result(ret)?;
        Ok(())
    }

    fn adjust_frequency(&mut self, ppb: f64) -> Result<(), ClockError> {
        let mut tx: timex = unsafe { mem::zeroed() };
        tx.modes = ADJ_FREQUENCY;
        tx.freq = ppb_to_timex_freq(ppb);
        let ret = unsafe { libc::clock_adjtime(self.clock_id, &mut tx) };
        Errno::result(ret)?;
        Ok(())
    }
}

impl Drop for LinuxPhc {
    fn drop(&mut self) {
        if self.pps.is_some() {
            let _ = unsafe { ptp_enable_pps(self.file.as_raw_fd(), 0) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abi_sizes() {
        assert_eq!(mem::size_of::<PtpClockTime>(), 16);
        assert_eq!(mem::size_of::<PtpClockCaps>(), 80);
        assert_eq!(mem::size_of::<PtpSysOffset>(), 16 + 51 * 16);
        assert_eq!(mem::size_of::<PtpSysOffsetPrecise>(), 64);
        assert_eq!(mem::size_of::<PtpSysOffsetExtended>(), 16 + 25 * 3 * 16);
    }

    #[test]
    fn test_clockid_from_fd() {
        assert_eq!(fd_to_clockid(3), -29);
        assert_eq!(fd_to_clockid(0), -5);
    }

    #[test]
    fn test_parse_sys_offset_interleaving() {
        let t = |sec: i64| PtpClockTime { sec, nsec: 0, reserved: 0 };
        let ts = [t(10), t(100), t(11), t(101), t(12)];
        let samples = parse_sys_offset(&ts, 2);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].sys_before, Timestamp::from_secs(10));
        assert_eq!(samples[0].device, Timestamp::from_secs(100));
        assert_eq!(samples[0].sys_after, Timestamp::from_secs(11));
        assert_eq!(samples[1].sys_before, Timestamp::from_secs(11));
        assert_eq!(samples[1].sys_after, Timestamp::from_secs(12));
    }

    #[test]
    fn test_missing_device() {
        assert!(matches!(LinuxPhc::open(9999), Err(ClockError::NoDevice(_))));
    }
}
