use serde::{Deserialize, Serialize};
use std::fmt;

/// Alarm bitset raised by a servo.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Alarms(u32);

impl Alarms {
    pub const CLOCK_CTRL_FAILURE: Alarms = Alarms(1 << 12);
    pub const CLOCK_NEAR_EPOCH: Alarms = Alarms(1 << 13);
    pub const SUSTAINED_SYNC_FAILURE: Alarms = Alarms(1 << 16);

    const NAMES: [(Alarms, &'static str); 3] = [
        (Alarms::CLOCK_CTRL_FAILURE, "clock-ctrl-failure"),
        (Alarms::CLOCK_NEAR_EPOCH, "clock-near-epoch"),
        (Alarms::SUSTAINED_SYNC_FAILURE, "sustained-sync-failure"),
    ];

    pub fn empty() -> Self {
        Alarms(0)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: Alarms) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: Alarms) {
        self.0 |= other.0;
    }

    pub fn clear(&mut self, other: Alarms) {
        self.0 &= !other.0;
    }

    pub fn names(&self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(a, _)| self.contains(*a))
            .map(|(_, n)| *n)
            .collect()
    }
}

impl fmt::Display for Alarms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.names();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join(","))
        }
    }
}

/// Snapshot of one servo, published for monitoring.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ServoStats {
    pub servo: String,
    pub master: String,
    pub slave: String,
    /// Filtered offset from master (ns)
    pub offset_ns: f64,
    /// Frequency adjustment currently applied (ppb)
    pub freq_adj_ppb: f64,
    pub in_sync: bool,
    pub alarms: Alarms,
    pub p_term: f64,
    pub i_term: f64,
    pub diff_method: String,
}

/// Status file written by the daemon.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct DaemonStatus {
    /// Unix timestamp of last status update
    pub updated_ts: u64,
    pub servos: Vec<ServoStats>,
}
