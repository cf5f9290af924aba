//! A hashed timing wheel driven by an external tick.
//!
//! The stack has no clock of its own: the host calls
//! [`advance_time`](../am/struct.AmEntity.html#method.advance_time) on each
//! entity, which consumes ticks on the entity's wheel one at a time and runs
//! the handlers of whatever expired, synchronously and in slot order.
//!
//! The wheel hashes each armed timer into `now + duration mod slots`. A
//! duration longer than one revolution parks the timer in the farthest slot
//! with the excess kept in a `remainder` field, re-inserting it every time
//! the wheel comes around. Slot count is rounded up to a power of two and
//! clamped to `[64, 32768]`.
//!
//! Timers are identified by a caller-chosen token type. Starting a token
//! that is already running is a no-op (with a warning); stopping a stopped
//! token is a no-op.

use alloc::vec::Vec;
use core::fmt::Debug;
use core::mem;

/// Smallest allowed slot count.
pub const MIN_SLOTS: usize = 64;
/// Largest allowed slot count.
pub const MAX_SLOTS: usize = 32768;

struct Entry<T> {
    token: T,
    /// Ticks still to serve after the wheel reaches this entry's slot.
    remainder: u32,
    periodic: bool,
    duration: u32,
}

/// A timing wheel whose timers are identified by tokens of type `T`.
pub struct TimerWheel<T: Copy + PartialEq + Debug> {
    slots: Vec<Vec<Entry<T>>>,
    mask: usize,
    cur: usize,
    /// Which slot each running token currently sits in.
    running: Vec<(T, usize)>,
}

impl<T: Copy + PartialEq + Debug> TimerWheel<T> {
    /// Creates a wheel with at least `slots` slots.
    pub fn new(slots: usize) -> Self {
        let mut n = MIN_SLOTS;
        while n < slots && n < MAX_SLOTS {
            n <<= 1;
        }
        TimerWheel {
            slots: (0..n).map(|_| Vec::new()).collect(),
            mask: n - 1,
            cur: 0,
            running: Vec::new(),
        }
    }

    /// Arms a one-shot timer for `token`, expiring after `duration` ticks.
    ///
    /// If `token` is already running this logs a warning and changes nothing.
    pub fn start(&mut self, token: T, duration: u32) {
        if self.is_running(token) {
            warn!("timer {:?} already running, start ignored", token);
            return;
        }
        self.place(token, duration.max(1), false, duration);
    }

    /// Arms a timer that re-arms itself with `period` after every expiry.
    pub fn start_periodic(&mut self, token: T, period: u32) {
        if self.is_running(token) {
            warn!("timer {:?} already running, start ignored", token);
            return;
        }
        self.place(token, period.max(1), true, period);
    }

    /// Disarms `token`. Idempotent.
    pub fn stop(&mut self, token: T) {
        if let Some(i) = self.running.iter().position(|&(t, _)| t == token) {
            let (_, slot) = self.running.swap_remove(i);
            self.slots[slot].retain(|e| e.token != token);
        }
    }

    /// Whether `token` is currently armed.
    pub fn is_running(&self, token: T) -> bool {
        self.running.iter().any(|&(t, _)| t == token)
    }

    fn place(&mut self, token: T, duration: u32, periodic: bool, period: u32) {
        let nslots = self.slots.len();
        let (slot, remainder) = if duration as usize >= nslots {
            // Park as far away as possible; serve the rest next revolution.
            ((self.cur + nslots - 1) & self.mask, duration - nslots as u32 + 1)
        } else {
            ((self.cur + duration as usize) & self.mask, 0)
        };
        self.slots[slot].push(Entry {
            token,
            remainder,
            periodic,
            duration: period,
        });
        self.running.push((token, slot));
    }

    fn unregister(&mut self, token: T) {
        if let Some(i) = self.running.iter().position(|&(t, _)| t == token) {
            self.running.swap_remove(i);
        }
    }

    /// Advances the wheel by one tick and returns the tokens that expired.
    ///
    /// Periodic timers are re-armed before this returns.
    pub fn tick(&mut self) -> Vec<T> {
        self.cur = (self.cur + 1) & self.mask;
        let mut expired = Vec::new();
        if self.slots[self.cur].is_empty() {
            return expired;
        }
        let entries = mem::take(&mut self.slots[self.cur]);
        for entry in entries {
            self.unregister(entry.token);
            if entry.remainder > 0 {
                self.place(entry.token, entry.remainder, entry.periodic, entry.duration);
            } else {
                trace!("timer {:?} expired", entry.token);
                expired.push(entry.token);
                if entry.periodic {
                    self.place(entry.token, entry.duration.max(1), true, entry.duration);
                }
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expire_in(wheel: &mut TimerWheel<u8>, max: u32) -> Option<(u8, u32)> {
        for t in 1..=max {
            let expired = wheel.tick();
            if let Some(&token) = expired.first() {
                return Some((token, t));
            }
        }
        None
    }

    #[test]
    fn one_shot() {
        let mut wheel = TimerWheel::new(64);
        wheel.start(1, 10);
        assert!(wheel.is_running(1));
        assert_eq!(expire_in(&mut wheel, 100), Some((1, 10)));
        assert!(!wheel.is_running(1));
        assert_eq!(expire_in(&mut wheel, 200), None);
    }

    #[test]
    fn cancel_and_double_start() {
        let mut wheel = TimerWheel::new(64);
        wheel.start(1, 10);
        wheel.start(1, 3); // ignored: already running
        wheel.stop(1);
        wheel.stop(1); // idempotent
        assert!(!wheel.is_running(1));
        assert_eq!(expire_in(&mut wheel, 100), None);
    }

    #[test]
    fn longer_than_one_revolution() {
        let mut wheel = TimerWheel::new(64);
        wheel.start(7, 1000);
        assert_eq!(expire_in(&mut wheel, 2000), Some((7, 1000)));
    }

    #[test]
    fn periodic_rearms() {
        let mut wheel = TimerWheel::new(64);
        wheel.start_periodic(3, 5);
        assert_eq!(expire_in(&mut wheel, 100), Some((3, 5)));
        assert!(wheel.is_running(3));
        assert_eq!(expire_in(&mut wheel, 100), Some((3, 5)));
        wheel.stop(3);
        assert_eq!(expire_in(&mut wheel, 100), None);
    }

    #[test]
    fn several_timers_in_order() {
        let mut wheel = TimerWheel::new(64);
        wheel.start(1, 4);
        wheel.start(2, 2);
        wheel.start(3, 4);
        assert_eq!(expire_in(&mut wheel, 10), Some((2, 2)));
        let expired = wheel.tick();
        assert!(expired.is_empty());
        let expired = wheel.tick();
        assert_eq!(expired, [1, 3]);
    }
}
