//! Leap second handling.
//!
//! A leap second is applied at the end of the UTC day it is announced for.
//! The kernel applies it to the system clock; PHCs are stepped by one
//! second when it happens. For a guard interval either side of the event
//! every clock is blocked so that no servo acts on a comparison taken
//! across the discontinuity.

use crate::clock::{ClockHandle, ClockRegistry, LeapSecond};
use crate::config::ClockControl;
use chrono::{DateTime, Duration, TimeZone, Utc};
use log::{info, warn};

const SECS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeapState {
    Scheduled,
    GuardBefore,
    GuardAfter,
    Done,
}

pub struct LeapSecondPlan {
    leap: LeapSecond,
    at: DateTime<Utc>,
    guard: Duration,
    kernel_armed: bool,
    step_phcs: bool,
    blocked: Vec<ClockHandle>,
    state: LeapState,
}

impl LeapSecondPlan {
    /// Plan `leap` for the end of the UTC day containing `now`. Returns
    /// `None` when there is nothing to do.
    pub fn schedule(
        registry: &ClockRegistry,
        leap: LeapSecond,
        control: ClockControl,
        guard_secs: f64,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        if leap == LeapSecond::None {
            return None;
        }

        let secs = now.timestamp();
        let mut at = secs - secs.rem_euclid(SECS_PER_DAY) + SECS_PER_DAY;
        // 23:59:59 is the second that goes missing
        if leap == LeapSecond::Delete {
            at -= 1;
        }
        let at = Utc.timestamp_opt(at, 0).single()?;

        // Stepping PHCs for an inserted second moves them backwards.
        let (arm_kernel, step_phcs) = match control {
            ClockControl::SlewAndStep => (true, true),
            ClockControl::StepForward => (leap == LeapSecond::Insert, leap == LeapSecond::Delete),
            _ => (false, false),
        };

        let mut kernel_armed = false;
        if arm_kernel {
            match registry.schedule_leap_second(leap) {
                Ok(()) => kernel_armed = true,
                Err(e) => warn!("failed to schedule leap second with the kernel: {}", e),
            }
        }

        info!("leap second {:?} scheduled for {}", leap, at.to_rfc3339());
        Some(LeapSecondPlan {
            leap,
            at,
            guard: Duration::milliseconds((guard_secs * 1000.0) as i64),
            kernel_armed,
            step_phcs,
            blocked: Vec::new(),
            state: LeapState::Scheduled,
        })
    }

    pub fn state(&self) -> LeapState {
        self.state
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    /// Advance the plan to `now`. Returns the new state when it changed.
    pub fn poll(&mut self, registry: &ClockRegistry, now: DateTime<Utc>) -> Option<LeapState> {
        let before = self.state;

        if self.state == LeapState::Scheduled && now >= self.at - self.guard {
            info!("leap second {:?} imminent, suspending clock adjustments", self.leap);
            self.block(registry);
            self.state = LeapState::GuardBefore;
        }

        if self.state == LeapState::GuardBefore && now >= self.at {
            if self.step_phcs {
                info!("leap second now: stepping PHCs");
                // Blocked clocks are not writable
                self.unblock(registry);
                if let Err(e) = registry.leap_second_now(self.leap) {
                    warn!("leap second not applied to every PHC: {}", e);
                }
                self.block(registry);
            } else {
                info!("leap second now: clocks will be slewed");
            }
            self.state = LeapState::GuardAfter;
        }

        if self.state == LeapState::GuardAfter && now >= self.at + self.guard {
            info!("leap second complete, resuming clock adjustments");
            self.unblock(registry);
            self.state = LeapState::Done;
        }

        (self.state != before).then_some(self.state)
    }

    /// Abandon the plan, disarming the kernel if the event is still ahead.
    pub fn cancel(&mut self, registry: &ClockRegistry) {
        self.unblock(registry);
        if self.kernel_armed && matches!(self.state, LeapState::Scheduled | LeapState::GuardBefore) {
            if let Err(e) = registry.schedule_leap_second(LeapSecond::None) {
                warn!("failed to cancel leap second: {}", e);
            }
        }
        if self.state != LeapState::Done {
            info!("leap second {:?} cancelled", self.leap);
        }
        self.kernel_armed = false;
        self.state = LeapState::Done;
    }

    fn block(&mut self, registry: &ClockRegistry) {
        self.blocked = registry.clocks();
        for h in &self.blocked {
            registry.set_blocked(h, true);
        }
    }

    fn unblock(&mut self, registry: &ClockRegistry) {
        for h in self.blocked.drain(..) {
            registry.set_blocked(&h, false);
        }
    }
}
