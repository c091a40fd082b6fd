//! `Cb<R>`: a callback paired with an optional weak guard (§4.2). Calling a
//! gated `Cb` upgrades the guard, invokes the callback while the guard is
//! held alive, then releases it — the callback never runs after its guard
//! object has started destruction.
//!
//! Dispatch loops that invoke many `Cb`s gated on the *same* guard in a row
//! (for example, [`crate::poll_group::PollGroup`] delivering a pollable's
//! readiness to several registered callbacks) can avoid repeating the
//! upgrade/downgrade dance for each one: [`tls::last_promoted_guard`] records
//! the address of a guard a caller has already verified alive this tick, and
//! `Cb::call` consults it before doing its own upgrade.

use std::sync::{Mutex, MutexGuard};

use crate::deferred::{Registration, TaskId};
use crate::obj::{GuardRef, Shared, WeakRef};
use crate::tls;

/// A callback, optionally gated on an object's liveness.
pub struct Cb<R = ()> {
    cb: Box<dyn FnMut() -> R + Send>,
    guard: Option<Box<dyn GuardRef>>,
}

impl<R> Cb<R> {
    /// A callback that always fires.
    pub fn new(cb: impl FnMut() -> R + Send + 'static) -> Cb<R> {
        Cb {
            cb: Box::new(cb),
            guard: None,
        }
    }

    /// A callback that fires only while `guard` is alive.
    pub fn guarded<G>(cb: impl FnMut() -> R + Send + 'static, guard: &Shared<G>) -> Cb<R>
    where
        G: Send + Sync + 'static,
    {
        Cb {
            cb: Box::new(cb),
            guard: Some(WeakRef::into_dyn_guard(Shared::downgrade(guard))),
        }
    }

    /// Invokes the callback if its guard (if any) is still alive. Returns
    /// `None` if the guard has already been destroyed.
    pub fn call(&mut self) -> Option<R> {
        let guard_ref = match &self.guard {
            None => return Some((self.cb)()),
            Some(g) => g,
        };

        if tls::last_promoted_guard() == guard_ref.addr() {
            // A caller further up the stack already holds this exact guard
            // alive and vouched for it via `set_last_promoted_guard`; skip
            // the redundant upgrade.
            return Some((self.cb)());
        }

        let strong = guard_ref.upgrade()?;
        let prev = tls::set_last_promoted_guard(guard_ref.addr());
        let result = (self.cb)();
        tls::set_last_promoted_guard(prev);
        drop(strong);
        Some(result)
    }

    pub fn is_gated(&self) -> bool {
        self.guard.is_some()
    }

    /// Calls this callback with `guard` released for the duration of the
    /// call and re-acquired afterward — the mutex-held-during-callback
    /// counterpart to the informer/sender/poll-loop take-drop-call-putback
    /// pattern, for callers that hold their own `MutexGuard` rather than
    /// storing the `Cb` behind one. `guard` is consumed (and thus released)
    /// before the call; the returned guard is a fresh lock of `mutex`.
    pub fn call_mutex<'a, T>(&mut self, guard: MutexGuard<'a, T>, mutex: &'a Mutex<T>) -> (Option<R>, MutexGuard<'a, T>) {
        drop(guard);
        let result = self.call();
        (result, mutex.lock().unwrap())
    }
}

impl Cb<()> {
    /// Registers this callback as a one-shot task on `registration` and
    /// schedules it to run on the next `DeferredProcessor::process()` call,
    /// rather than invoking it inline. Returns the task id, which stays
    /// valid for `registration.revoke_task` until it fires.
    pub fn call_deferred(mut self, registration: &Registration) -> TaskId {
        let id = registration.add_task(
            move || {
                self.call();
                false
            },
            false,
        );
        registration.schedule_task(id);
        id
    }
}

/// Marks `guard` as already verified alive for the duration of `body`, so
/// any `Cb` gated on it called from within `body` skips its own upgrade.
/// Callers must independently guarantee `guard` stays alive for the call.
pub fn with_promoted_guard<G, F, R>(guard: &Shared<G>, body: F) -> R
where
    G: Send + Sync + 'static,
    F: FnOnce() -> R,
{
    let prev = tls::set_last_promoted_guard(Shared::addr(guard));
    let result = body();
    tls::set_last_promoted_guard(prev);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn ungated_cb_always_fires() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let mut cb = Cb::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(cb.call().is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn gated_cb_stops_firing_after_guard_dies() {
        let guard = Shared::new(());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let mut cb = Cb::guarded(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            &guard,
        );
        assert!(cb.call().is_some());
        drop(guard);
        assert!(cb.call().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn promoted_guard_elides_upgrade_but_still_requires_liveness() {
        let guard = Shared::new(());
        let mut cb = Cb::guarded(|| 7, &guard);
        let result = with_promoted_guard(&guard, || cb.call());
        assert_eq!(result, Some(7));
    }

    #[test]
    fn call_mutex_releases_and_reacquires_the_guard() {
        let mutex = Arc::new(Mutex::new(vec![1, 2, 3]));
        let reentered = Arc::new(AtomicUsize::new(0));
        let r = reentered.clone();
        let check_mutex = mutex.clone();
        let mut cb = Cb::new(move || {
            // Proves the guard was actually released: a fresh lock from
            // inside the callback would deadlock otherwise.
            assert_eq!(check_mutex.try_lock().unwrap().len(), 3);
            r.fetch_add(1, Ordering::SeqCst);
        });

        let guard = mutex.lock().unwrap();
        let (result, guard) = cb.call_mutex(guard, &mutex);
        assert!(result.is_some());
        assert_eq!(reentered.load(Ordering::SeqCst), 1);
        assert_eq!(guard.len(), 3);
    }

    #[test]
    fn call_deferred_runs_on_the_next_process_call() {
        let dp = crate::deferred::DeferredProcessor::new();
        let reg = dp.new_registration();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let cb = Cb::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        cb.call_deferred(&reg);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        dp.process();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
