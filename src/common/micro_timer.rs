//! Microsecond interval timer.
//!
//! Nothing in here reads the clock.  Callers pass `now` in (usually from
//! [`crate::common::get_micro_time`]) so the protocol state machines can be
//! tested with a fake clock.

pub struct MicroTimer {
    last_time: u128,
    interval: u128,
}

impl MicroTimer {
    pub fn new(now: u128, interval: u128) -> MicroTimer {
        MicroTimer {
            last_time: now,
            interval: interval,
        }
    }
    /// build a timer from a period in whole seconds
    pub fn from_secs(now: u128, secs: u64) -> MicroTimer {
        MicroTimer::new(now, secs as u128 * 1_000_000)
    }
    pub fn set_interval(&mut self, interval: u128) -> () {
        self.interval = interval;
    }
    pub fn get_interval(&self) -> u128 {
        self.interval
    }
    pub fn expired(&self, now: u128) -> bool {
        (self.last_time + self.interval) < now
    }
    pub fn reset(&mut self, now: u128) {
        self.last_time = now;
    }
    /// move the start forward by some amount (keeps a periodic timer from drifting)
    pub fn advance(&mut self, amount: u128) {
        self.last_time += amount;
    }
    pub fn since(&self, now: u128) -> u128 {
        now.saturating_sub(self.last_time)
    }
}
