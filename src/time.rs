//! Fixed-point timestamps.
//!
//! A [`Timestamp`] holds whole seconds, nanoseconds and a 32-bit binary
//! fraction of a nanosecond. The nanosecond field is always kept in
//! `[0, 1e9)`; negative values are expressed through the seconds field, so
//! `-0.25s` is stored as `sec = -1, nsec = 750_000_000`.
//!
//! Seconds arithmetic wraps, which makes add/subtract an exact group
//! operation: `(a + b) - b == a` holds for every representable value.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Neg, Sub};

pub const NSEC_PER_SEC: u32 = 1_000_000_000;
const NSEC_PER_SEC_F64: f64 = 1.0e9;
const FRAC_SCALE: f64 = 4_294_967_296.0;

/// Seconds are signed so that offsets between clocks, which are negative as
/// often as not, share the type with absolute times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "RawTimestamp")]
pub struct Timestamp {
    sec: i64,
    nsec: u32,
    nsec_frac: u32,
}

/// Wire form accepted by `Deserialize`; normalised on the way in.
#[derive(Deserialize)]
struct RawTimestamp {
    sec: i64,
    nsec: i64,
    #[serde(default)]
    nsec_frac: u32,
}

impl From<RawTimestamp> for Timestamp {
    fn from(raw: RawTimestamp) -> Self {
        Timestamp::new(raw.sec, raw.nsec) + Timestamp { sec: 0, nsec: 0, nsec_frac: raw.nsec_frac }
    }
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { sec: 0, nsec: 0, nsec_frac: 0 };

    /// Build a timestamp from possibly unnormalised parts.
    pub fn new(sec: i64, nsec: i64) -> Self {
        let carry = nsec.div_euclid(NSEC_PER_SEC as i64);
        Timestamp {
            sec: sec.wrapping_add(carry),
            nsec: nsec.rem_euclid(NSEC_PER_SEC as i64) as u32,
            nsec_frac: 0,
        }
    }

    pub fn sec(&self) -> i64 {
        self.sec
    }

    /// Always in `[0, 1e9)`.
    pub fn nsec(&self) -> u32 {
        self.nsec
    }

    pub fn nsec_frac(&self) -> u32 {
        self.nsec_frac
    }

    pub fn from_secs(sec: i64) -> Self {
        Timestamp { sec, nsec: 0, nsec_frac: 0 }
    }

    pub fn from_nanos(ns: i64) -> Self {
        Timestamp::new(0, ns)
    }

    /// Convert floating-point nanoseconds, flooring to the containing second.
    pub fn from_nanos_f64(ns: f64) -> Self {
        let sec = (ns / NSEC_PER_SEC_F64).floor();
        let rem = ns - sec * NSEC_PER_SEC_F64;
        let whole = rem.floor();
        let frac = ((rem - whole) * FRAC_SCALE).floor();

        let mut ts = Timestamp {
            sec: sec as i64,
            nsec: 0,
            nsec_frac: frac.clamp(0.0, FRAC_SCALE - 1.0) as u32,
        };
        // Rounding of large values can leave `whole` just outside [0, 1e9).
        let whole = whole as i64;
        ts = ts + Timestamp::new(0, whole);
        ts
    }

    pub fn from_secs_f64(s: f64) -> Self {
        Timestamp::from_nanos_f64(s * NSEC_PER_SEC_F64)
    }

    pub fn to_nanos_f64(&self) -> f64 {
        self.sec as f64 * NSEC_PER_SEC_F64 + self.nsec as f64 + self.nsec_frac as f64 / FRAC_SCALE
    }

    pub fn to_secs_f64(&self) -> f64 {
        self.to_nanos_f64() / NSEC_PER_SEC_F64
    }

    pub fn is_zero(&self) -> bool {
        *self == Timestamp::ZERO
    }

    /// Three-way comparison returning -1, 0 or 1.
    pub fn compare(a: &Timestamp, b: &Timestamp) -> i32 {
        match a.cmp(b) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }

    pub fn abs(&self) -> Timestamp {
        if self.sec < 0 {
            -*self
        } else {
            *self
        }
    }
}

impl Add for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Timestamp) -> Timestamp {
        let frac = self.nsec_frac as u64 + rhs.nsec_frac as u64;
        let mut nsec = self.nsec + rhs.nsec + (frac >> 32) as u32;
        let mut sec = self.sec.wrapping_add(rhs.sec);
        if nsec >= NSEC_PER_SEC {
            nsec -= NSEC_PER_SEC;
            sec = sec.wrapping_add(1);
        }
        Timestamp { sec, nsec, nsec_frac: frac as u32 }
    }
}

impl Sub for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Timestamp) -> Timestamp {
        let (nsec_frac, borrow) = self.nsec_frac.overflowing_sub(rhs.nsec_frac);
        let mut nsec = self.nsec as i64 - rhs.nsec as i64 - borrow as i64;
        let mut sec = self.sec.wrapping_sub(rhs.sec);
        if nsec < 0 {
            nsec += NSEC_PER_SEC as i64;
            sec = sec.wrapping_sub(1);
        }
        Timestamp { sec, nsec: nsec as u32, nsec_frac }
    }
}

impl Neg for Timestamp {
    type Output = Timestamp;

    fn neg(self) -> Timestamp {
        Timestamp::ZERO - self
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sec < 0 {
            let pos = -*self;
            write!(f, "-{}.{:09}", pos.sec, pos.nsec)
        } else {
            write!(f, "{}.{:09}", self.sec, self.nsec)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_normalises_nanoseconds() {
        let t = Timestamp::new(5, 2_500_000_000);
        assert_eq!(t, Timestamp { sec: 7, nsec: 500_000_000, nsec_frac: 0 });

        let t = Timestamp::new(5, -250_000_000);
        assert_eq!(t, Timestamp { sec: 4, nsec: 750_000_000, nsec_frac: 0 });
    }

    #[test]
    fn test_add_carries() {
        let a = Timestamp { sec: 1, nsec: 999_999_999, nsec_frac: 0x8000_0000 };
        let b = Timestamp { sec: 0, nsec: 0, nsec_frac: 0x8000_0000 };
        assert_eq!(a + b, Timestamp { sec: 2, nsec: 0, nsec_frac: 0 });
    }

    #[test]
    fn test_subtract_borrows() {
        let a = Timestamp::new(10, 100);
        let b = Timestamp::new(3, 200);
        let d = a - b;
        assert_eq!(d, Timestamp::new(6, 999_999_900));
        assert_eq!((b - a).to_nanos_f64(), -6_999_999_900.0);
    }

    #[test]
    fn test_round_trip_is_exact() {
        let values = [
            Timestamp::ZERO,
            Timestamp::new(-3, 1),
            Timestamp { sec: i64::MAX, nsec: 999_999_999, nsec_frac: u32::MAX },
            Timestamp { sec: i64::MIN, nsec: 0, nsec_frac: 1 },
            Timestamp { sec: 1_700_000_000, nsec: 123_456_789, nsec_frac: 0xdead_beef },
        ];
        for a in values {
            for b in values {
                assert_eq!((a + b) - b, a, "a={:?} b={:?}", a, b);
            }
        }
    }

    #[test]
    fn test_negate_and_compare() {
        let a = Timestamp::new(2, 0);
        assert_eq!(-a, Timestamp::new(-2, 0));
        assert_eq!(-Timestamp::new(0, 1), Timestamp::new(-1, 999_999_999));
        assert_eq!(Timestamp::compare(&a, &-a), 1);
        assert_eq!(Timestamp::compare(&-a, &a), -1);
        assert_eq!(Timestamp::compare(&a, &a), 0);
        assert!(Timestamp::new(-1, 999_999_999) < Timestamp::ZERO);
    }

    #[test]
    fn test_float_conversions_floor() {
        let t = Timestamp::from_nanos_f64(-1.5);
        assert_eq!(t.sec, -1);
        assert_eq!(t.nsec, 999_999_998);
        assert_eq!(t.nsec_frac, 0x8000_0000);
        assert!((t.to_nanos_f64() + 1.5).abs() < 1e-6);

        let t = Timestamp::from_secs_f64(2.25);
        assert_eq!(t, Timestamp::new(2, 250_000_000));
        assert!((t.to_secs_f64() - 2.25).abs() < 1e-12);
    }

    #[test]
    fn test_deserialize_normalises() {
        let t: Timestamp = serde_json::from_str(r#"{"sec": 5, "nsec": 2500000000}"#).unwrap();
        assert_eq!(t, Timestamp::new(7, 500_000_000));
        assert_eq!(t.nsec(), 500_000_000);

        let t: Timestamp = serde_json::from_str(r#"{"sec": 0, "nsec": -1, "nsec_frac": 7}"#).unwrap();
        assert_eq!(t.sec(), -1);
        assert_eq!(t.nsec(), 999_999_999);
        assert_eq!(t.nsec_frac(), 7);

        let json = serde_json::to_string(&Timestamp::new(-1, 750_000_000)).unwrap();
        assert_eq!(serde_json::from_str::<Timestamp>(&json).unwrap(), Timestamp::new(-1, 750_000_000));
    }

    #[test]
    fn test_display_signed() {
        assert_eq!(Timestamp::new(-1, 750_000_000).to_string(), "-0.250000000");
        assert_eq!(Timestamp::new(3, 5).to_string(), "3.000000005");
    }
}
