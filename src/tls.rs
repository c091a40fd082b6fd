//! Per-thread state shared by the object-lifetime, callback, and poll-loop
//! subsystems: the deletion queue, the `StateMutex` recursion counter, the
//! last-promoted-guard slot used by [`crate::cb::Cb`], and a monotonic time
//! cache refreshed once per poll iteration.

use std::cell::{Cell, RefCell};
use std::time::{Duration, Instant};

/// Something a thread-local deletion queue can finish later, once no
/// `StateMutex` is held anywhere on this thread's call stack. Implemented by
/// the type-erased control-block handle in `obj.rs`.
pub trait DeferredDrop {
    fn finish(self: Box<Self>);
}

struct ThreadState {
    state_mutex_counter: Cell<usize>,
    draining: Cell<bool>,
    deletion_queue: RefCell<Vec<Box<dyn DeferredDrop>>>,
    last_promoted_guard: Cell<usize>,
    time_cache: Cell<Option<(Instant, Duration)>>,
}

impl ThreadState {
    fn new() -> ThreadState {
        ThreadState {
            state_mutex_counter: Cell::new(0),
            draining: Cell::new(false),
            deletion_queue: RefCell::new(Vec::new()),
            last_promoted_guard: Cell::new(0),
            time_cache: Cell::new(None),
        }
    }
}

thread_local! {
    static STATE: ThreadState = ThreadState::new();
}

/// True while any `StateMutex` is locked on this thread.
pub fn state_mutex_held() -> bool {
    STATE.with(|s| s.state_mutex_counter.get() > 0)
}

/// Called by `StateMutexGuard::new`.
pub(crate) fn state_mutex_enter() {
    STATE.with(|s| s.state_mutex_counter.set(s.state_mutex_counter.get() + 1));
}

/// Called by `StateMutexGuard::drop`. Drains the deletion queue once the
/// counter returns to zero.
pub(crate) fn state_mutex_leave() {
    let should_drain = STATE.with(|s| {
        let n = s.state_mutex_counter.get() - 1;
        s.state_mutex_counter.set(n);
        n == 0 && !s.deletion_queue.borrow().is_empty()
    });
    if should_drain {
        drain_deletion_queue();
    }
}

/// Appends an object to the current thread's deletion queue. Called from
/// `Shared::do_delete` when a `StateMutex` is held and the destructor cannot
/// run synchronously without risking lock-order inversions inside it.
pub fn deletion_queue_append(obj: Box<dyn DeferredDrop>) {
    STATE.with(|s| s.deletion_queue.borrow_mut().push(obj));
}

/// Drains the deletion queue, running destructors with no `StateMutex` held.
/// Guarded against re-entrant drains (a destructor that itself locks and
/// unlocks a `StateMutex` with an empty queue must not recurse here).
pub fn drain_deletion_queue() {
    STATE.with(|s| {
        if s.draining.get() {
            return;
        }
        s.draining.set(true);
        loop {
            let batch: Vec<_> = s.deletion_queue.borrow_mut().drain(..).collect();
            if batch.is_empty() {
                break;
            }
            for obj in batch {
                obj.finish();
            }
        }
        s.draining.set(false);
    });
}

/// The thread-local "last promoted guard" address, used by [`crate::cb::Cb`]
/// to elide redundant refcount churn when chained callbacks share a guard.
pub fn last_promoted_guard() -> usize {
    STATE.with(|s| s.last_promoted_guard.get())
}

/// Sets the last-promoted-guard slot, returning the previous value so the
/// caller can restore it after the callback returns.
pub fn set_last_promoted_guard(addr: usize) -> usize {
    STATE.with(|s| {
        let prev = s.last_promoted_guard.get();
        s.last_promoted_guard.set(addr);
        prev
    })
}

/// Refreshes the thread-local time cache. Called once at the top of every
/// `PollGroup::poll` iteration.
pub fn refresh_time_cache() {
    STATE.with(|s| {
        let now = Instant::now();
        let base = s.time_cache.get().map(|(i, _)| i).unwrap_or(now);
        s.time_cache.set(Some((base, now.duration_since(base))));
    });
}

/// Monotonic time since the first call to [`refresh_time_cache`] on this
/// thread, as of the last refresh. Cheap: no syscall, just a `Cell` read.
pub fn cached_monotonic() -> Duration {
    STATE.with(|s| match s.time_cache.get() {
        Some((_, d)) => d,
        None => {
            drop(s);
            refresh_time_cache();
            STATE.with(|s| s.time_cache.get().unwrap().1)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe(std::rc::Rc<std::cell::Cell<bool>>);
    impl DeferredDrop for Probe {
        fn finish(self: Box<Self>) {
            self.0.set(true);
        }
    }

    #[test]
    fn deletion_queue_drains_on_counter_zero() {
        let ran = std::rc::Rc::new(std::cell::Cell::new(false));
        state_mutex_enter();
        deletion_queue_append(Box::new(Probe(ran.clone())));
        assert!(!ran.get());
        state_mutex_leave();
        assert!(ran.get());
    }

    #[test]
    fn last_promoted_guard_roundtrip() {
        let prev = set_last_promoted_guard(42);
        assert_eq!(last_promoted_guard(), 42);
        set_last_promoted_guard(prev);
    }
}
