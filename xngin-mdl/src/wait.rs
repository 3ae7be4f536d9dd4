use parking_lot::{Condvar, Mutex};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Empty,
    Granted,
    Killed,
    Timeout,
}

/// WaitSlot is where a context sleeps while waiting for a lock.
///
/// The status transits from `Empty` exactly once. Whoever sets it first
/// wins: lock manager granting the request, the kill signal, or the
/// waiter itself on timeout.
#[derive(Debug)]
pub struct WaitSlot {
    status: Mutex<WaitStatus>,
    cv: Condvar,
}

impl Default for WaitSlot {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl WaitSlot {
    #[inline]
    pub fn new() -> Self {
        WaitSlot {
            status: Mutex::new(WaitStatus::Empty),
            cv: Condvar::new(),
        }
    }

    #[inline]
    pub fn reset(&self) {
        *self.status.lock() = WaitStatus::Empty;
    }

    #[inline]
    pub fn status(&self) -> WaitStatus {
        *self.status.lock()
    }

    /// Set the status if nobody else did, and wake up the waiter.
    /// Returns false if status was already set.
    #[inline]
    pub fn try_set(&self, status: WaitStatus) -> bool {
        debug_assert!(status != WaitStatus::Empty);
        let mut g = self.status.lock();
        if *g != WaitStatus::Empty {
            return false;
        }
        *g = status;
        self.cv.notify_one();
        true
    }

    /// Block until status is set or deadline is reached.
    /// None deadline means waiting forever.
    #[inline]
    pub fn wait(&self, deadline: Option<Instant>) -> WaitStatus {
        let mut g = self.status.lock();
        loop {
            if *g != WaitStatus::Empty {
                return *g;
            }
            match deadline {
                Some(deadline) => {
                    if self.cv.wait_until(&mut g, deadline).timed_out() {
                        if *g == WaitStatus::Empty {
                            *g = WaitStatus::Timeout;
                        }
                        return *g;
                    }
                }
                None => self.cv.wait(&mut g),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_slot_timeout() {
        let slot = WaitSlot::new();
        let status = slot.wait(Some(Instant::now() + Duration::from_millis(10)));
        assert_eq!(status, WaitStatus::Timeout);
        // status is set only once
        assert!(!slot.try_set(WaitStatus::Granted));
        slot.reset();
        assert!(slot.try_set(WaitStatus::Granted));
        assert_eq!(slot.wait(None), WaitStatus::Granted);
    }

    #[test]
    fn test_wait_slot_wakeup() {
        let slot = Arc::new(WaitSlot::new());
        let handle = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.wait(None))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(slot.try_set(WaitStatus::Killed));
        assert_eq!(handle.join().unwrap(), WaitStatus::Killed);
    }
}
