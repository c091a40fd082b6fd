//! `StateMutex`: an ordinary mutex that additionally participates in the
//! deletion-queue protocol (§4.1, §5 of the design doc). Holding one bumps a
//! thread-local counter; when the counter drops back to zero on unlock, the
//! thread drains any objects queued for deferred destruction.
//!
//! Plain leaf-level locks (the shadow mutex, the trigger-pipe flag) use
//! `std::sync::Mutex` directly and do not participate in this protocol.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::tls;

pub struct StateMutex<T> {
    inner: Mutex<T>,
}

pub struct StateMutexGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
}

impl<T> StateMutex<T> {
    pub fn new(value: T) -> StateMutex<T> {
        StateMutex {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> StateMutexGuard<'_, T> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        tls::state_mutex_enter();
        StateMutexGuard { guard: Some(guard) }
    }
}

impl<'a, T> Deref for StateMutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<'a, T> DerefMut for StateMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<'a, T> Drop for StateMutexGuard<'a, T> {
    fn drop(&mut self) {
        // Drop the underlying lock before draining the deletion queue: a
        // destructor run from the drain may itself want to lock a
        // `StateMutex`, including this one.
        self.guard.take();
        tls::state_mutex_leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls;

    #[test]
    fn counter_tracks_nesting() {
        let m = StateMutex::new(0);
        assert!(!tls::state_mutex_held());
        {
            let _g1 = m.lock();
            assert!(tls::state_mutex_held());
            {
                let m2 = StateMutex::new(1);
                let _g2 = m2.lock();
                assert!(tls::state_mutex_held());
            }
            assert!(tls::state_mutex_held());
        }
        assert!(!tls::state_mutex_held());
    }
}
