// VTS poll events and wake lock
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    io,
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

use log::debug;
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

use crate::protocol::{EVENT_NONE, EVENT_READY};

/// Event bitmask reported to the voice HAL.
///
/// Interrupt handlers post bits, the control surface reads and clears them.
/// Readiness is signalled both through a condition variable and through an
/// eventfd that external pollers can add to their epoll set.
pub struct PollEvents {
    bits: Mutex<u32>,
    cond: Condvar,
    notify: EventFd,
}

impl PollEvents {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            bits: Mutex::new(EVENT_NONE),
            cond: Condvar::new(),
            notify: EventFd::new(EFD_NONBLOCK)?,
        })
    }

    pub fn post(&self, bits: u32) {
        let mut current = self.bits.lock().unwrap();
        *current |= bits;
        debug!("poll event posted: {bits:#x}, now {:#x}", *current);
        if let Err(e) = self.notify.write(1) {
            debug!("poll eventfd write failed: {e}");
        }
        self.cond.notify_all();
    }

    pub fn peek(&self) -> u32 {
        *self.bits.lock().unwrap()
    }

    /// Read the pending events and clear them.
    pub fn take(&self) -> u32 {
        let mut current = self.bits.lock().unwrap();
        std::mem::replace(&mut *current, EVENT_NONE)
    }

    pub fn clear(&self, bits: u32) {
        *self.bits.lock().unwrap() &= !bits;
    }

    pub fn reset(&self) {
        *self.bits.lock().unwrap() = EVENT_NONE;
    }

    /// Wait until `EVENT_READY` is posted. Like poll(), consumes the ready
    /// bit and returns the remaining event mask.
    pub fn wait_ready(&self, timeout: Duration) -> Option<u32> {
        let guard = self.bits.lock().unwrap();
        let (mut bits, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |bits| *bits & EVENT_READY == 0)
            .unwrap();

        if *bits & EVENT_READY == 0 {
            return None;
        }
        *bits &= !EVENT_READY;
        // Drain the eventfd counter; EAGAIN just means it was already read.
        let _ = self.notify.read();
        Some(*bits)
    }

    pub fn eventfd(&self) -> &EventFd {
        &self.notify
    }
}

/// Keeps the host awake for a bounded window after a trigger.
#[derive(Debug, Default)]
pub struct WakeLock {
    until: Mutex<Option<Instant>>,
}

impl WakeLock {
    pub fn acquire(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut until = self.until.lock().unwrap();
        if until.map_or(true, |t| t < deadline) {
            *until = Some(deadline);
        }
    }

    pub fn release(&self) {
        *self.until.lock().unwrap() = None;
    }

    pub fn is_held(&self) -> bool {
        self.until
            .lock()
            .unwrap()
            .is_some_and(|t| Instant::now() < t)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;
    use crate::protocol::{EVENT_RECOVERY, EVENT_TRIGGERED};

    #[test]
    fn test_post_and_take() {
        let events = PollEvents::new().unwrap();
        events.post(EVENT_TRIGGERED | EVENT_READY);
        events.post(EVENT_RECOVERY);
        assert_eq!(events.peek(), EVENT_TRIGGERED | EVENT_READY | EVENT_RECOVERY);
        assert_eq!(events.eventfd().read().unwrap(), 2);

        assert_eq!(events.take(), EVENT_TRIGGERED | EVENT_READY | EVENT_RECOVERY);
        assert_eq!(events.peek(), EVENT_NONE);
    }

    #[test]
    fn test_wait_ready_consumes_ready_bit() {
        let events = Arc::new(PollEvents::new().unwrap());
        let poster = events.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            poster.post((EVENT_TRIGGERED | EVENT_READY) + 1);
        });

        let bits = events.wait_ready(Duration::from_secs(2)).unwrap();
        handle.join().unwrap();
        assert_eq!(bits, EVENT_TRIGGERED + 1);
        assert_eq!(events.peek(), EVENT_TRIGGERED + 1);
    }

    #[test]
    fn test_wait_ready_times_out() {
        let events = PollEvents::new().unwrap();
        let start = Instant::now();
        assert_eq!(events.wait_ready(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wake_lock() {
        let lock = WakeLock::default();
        assert!(!lock.is_held());
        lock.acquire(Duration::from_secs(5));
        assert!(lock.is_held());
        lock.release();
        assert!(!lock.is_held());

        lock.acquire(Duration::from_millis(1));
        thread::sleep(Duration::from_millis(5));
        assert!(!lock.is_held());
    }
}
