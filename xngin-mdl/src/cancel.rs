use crate::wait::{WaitSlot, WaitStatus};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// KillSignal is a cooperative cancellation handle of one session.
///
/// Any thread can kill the session. The session observes it either by
/// polling `is_killed()` between steps, or by being woken up from the
/// lock wait it is currently blocked in.
#[derive(Debug, Clone)]
pub struct KillSignal {
    inner: Arc<Inner>,
}

impl Default for KillSignal {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl KillSignal {
    #[inline]
    pub fn new() -> Self {
        KillSignal {
            inner: Arc::new(Inner::new()),
        }
    }

    #[inline]
    pub fn kill(&self) {
        self.inner.kill()
    }

    #[inline]
    pub fn is_killed(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Clear the kill flag, e.g. after the killed statement is aborted.
    #[inline]
    pub fn reset(&self) {
        self.inner.flag.store(false, Ordering::Release);
    }

    /// Register the slot the session is about to sleep on.
    /// Returns false if the session is already killed.
    #[inline]
    pub(crate) fn enter_wait(&self, slot: &Arc<WaitSlot>) -> bool {
        let mut g = self.inner.slot.lock();
        if self.is_killed() {
            return false;
        }
        *g = Some(Arc::clone(slot));
        true
    }

    #[inline]
    pub(crate) fn exit_wait(&self) {
        self.inner.slot.lock().take();
    }
}

#[derive(Debug)]
struct Inner {
    flag: AtomicBool,
    slot: Mutex<Option<Arc<WaitSlot>>>,
}

impl Inner {
    #[inline]
    fn new() -> Self {
        Inner {
            flag: AtomicBool::new(false),
            slot: Mutex::new(None),
        }
    }

    #[inline]
    fn kill(&self) {
        let g = self.slot.lock();
        if self
            .flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if let Some(slot) = g.as_ref() {
                slot.try_set(WaitStatus::Killed);
            }
        }
    }
}
