//! Heartbeat scheduler (C4), spec §4.4: randomized-interval timers whose
//! cadence depends on role. Timers are timestamp-based (`next_fire_at`),
//! never counter-based, so restarting a role's schedule immediately
//! resets every timer.

use rand::Rng;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct Timer {
    base: Duration,
    jitter: Duration,
    next_fire_at: Instant,
}

impl Timer {
    pub fn new(base: Duration, jitter: Duration) -> Self {
        let mut timer = Timer {
            base,
            jitter,
            next_fire_at: Instant::now(),
        };
        timer.reset();
        timer
    }

    /// Resamples the next deadline from `base + U[0, jitter)`.
    pub fn reset(&mut self) {
        let extra = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..self.jitter.as_millis() as u64))
        };
        self.next_fire_at = Instant::now() + self.base + extra;
    }

    pub fn due(&self) -> bool {
        Instant::now() >= self.next_fire_at
    }

    /// How long until this timer next fires, `Duration::ZERO` if already
    /// due. Used by the ingest loop to sleep exactly until the next tick
    /// while standby, instead of busy-polling.
    pub fn remaining(&self) -> Duration {
        self.next_fire_at.saturating_duration_since(Instant::now())
    }

    /// Checks and, if due, resamples the next deadline, returning true
    /// exactly once per firing.
    pub fn fire_if_due(&mut self) -> bool {
        if self.due() {
            self.reset();
            true
        } else {
            false
        }
    }
}

/// Per-role set of timers, one row per entry in spec §4.4's table.
pub struct HeartbeatSchedule {
    pub device_heartbeat: Timer,
    pub active_heartbeat: Timer,
    pub standby_check: Timer,
    pub stale_sweep: Timer,
}

impl HeartbeatSchedule {
    pub fn for_leader() -> Self {
        HeartbeatSchedule {
            device_heartbeat: Timer::new(Duration::from_secs(30), Duration::from_secs(10)),
            active_heartbeat: Timer::new(Duration::from_secs(30), Duration::from_secs(10)),
            standby_check: Timer::new(Duration::from_secs(30), Duration::from_secs(10)),
            stale_sweep: Timer::new(Duration::from_secs(24 * 60 * 60), Duration::ZERO),
        }
    }

    pub fn for_standby() -> Self {
        HeartbeatSchedule {
            device_heartbeat: Timer::new(Duration::from_secs(5 * 60), Duration::from_secs(60)),
            active_heartbeat: Timer::new(Duration::from_secs(30), Duration::from_secs(10)),
            standby_check: Timer::new(Duration::from_secs(30), Duration::from_secs(10)),
            stale_sweep: Timer::new(Duration::from_secs(24 * 60 * 60), Duration::ZERO),
        }
    }

    pub fn for_role(role: crate::election::Role) -> Self {
        match role {
            crate::election::Role::Leader => HeartbeatSchedule::for_leader(),
            crate::election::Role::Standby => HeartbeatSchedule::for_standby(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_base_zero_jitter_timer_is_immediately_due() {
        let timer = Timer::new(Duration::ZERO, Duration::ZERO);
        assert!(timer.due());
    }

    #[test]
    fn future_timer_is_not_due() {
        let timer = Timer::new(Duration::from_secs(60), Duration::from_secs(10));
        assert!(!timer.due());
    }

    #[test]
    fn fire_if_due_resets_after_firing() {
        let mut timer = Timer::new(Duration::ZERO, Duration::ZERO);
        assert!(timer.fire_if_due());
        assert!(!timer.due());
    }

    #[test]
    fn zero_jitter_does_not_panic_on_reset() {
        let mut timer = Timer::new(Duration::from_secs(1), Duration::ZERO);
        timer.reset();
        assert!(!timer.due());
    }

    #[test]
    fn leader_schedule_has_frequent_device_heartbeat() {
        let schedule = HeartbeatSchedule::for_leader();
        assert!(!schedule.device_heartbeat.due());
    }
}
