//! The event loop (§4.3): an epoll-backed, level-triggered-plus-hangup
//! readiness multiplexer with a self-pipe trigger for cross-thread wakeups.
//!
//! One `PollGroup` is owned by each worker thread context. Pollables
//! register an events callback; `poll()` runs one bounded iteration:
//! refresh the time cache, compute a timeout, wait, dispatch, drain the
//! deferred-deletion queue, run the `DeferredProcessor`, drain the trigger.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slab::Slab;

use crate::deferred::{DeferredProcessor, Registration};
use crate::epoll::{Epoll, EpollOpt, Event, Events, Ready, Source, Token};
use crate::error::Result;
use crate::sys::EventFd;
use crate::timers::Timers;
use crate::tls;

/// What a pollable sees on each readiness delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvents {
    pub input: bool,
    pub output: bool,
    pub error: bool,
    pub hup: bool,
}

impl PollEvents {
    fn from_event(event: Event) -> PollEvents {
        let kind = event.kind();
        PollEvents {
            input: kind.is_input(),
            output: kind.is_output(),
            error: kind.is_error(),
            hup: kind.is_hup(),
        }
    }
}

/// Feedback a pollable's events callback can request: re-arm interest
/// lazily instead of eagerly watching both directions at all times.
pub struct Feedback<'a> {
    group: &'a PollGroup,
    key: PollableKey,
}

impl<'a> Feedback<'a> {
    pub fn set_interest(&self, interest: Ready) -> Result<()> {
        self.group.set_interest(self.key, interest)
    }
}

pub type EventsCallback = dyn FnMut(PollEvents, &Feedback<'_>) + Send;

/// Observes the poll loop's iteration boundaries (§4.3). Installed once via
/// [`PollGroup::set_frontend`]. `poll_iteration_end`'s return value is ORed
/// into the "run another iteration with a zero timeout" flag alongside the
/// deferred processor's own signal, so a frontend that still has work left
/// (e.g. a connection it wants to re-offer input to) can force an immediate
/// re-poll instead of waiting out the full timeout.
pub trait Frontend: Send {
    fn poll_iteration_begin(&mut self) {}

    fn poll_iteration_end(&mut self) -> bool {
        false
    }
}

struct PollableEntry {
    fd: RawFd,
    cb: Box<EventsCallback>,
    valid: bool,
    interest: Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollableKey(usize);

struct Inner {
    pollables: Slab<PollableEntry>,
    deletion_queue: Vec<usize>,
}

pub struct PollGroup {
    epoll: Epoll,
    trigger_fd: EventFd,
    triggered: AtomicBool,
    inner: Mutex<Inner>,
    deferred: DeferredProcessor,
    got_deferred_tasks: AtomicBool,
    events_capacity: usize,
    bound_thread: AtomicUsize,
    frontend: Mutex<Option<Box<dyn Frontend>>>,
    timers: Mutex<Option<Arc<Mutex<Timers>>>>,
}

const TRIGGER_TOKEN: Token = Token(usize::MAX);

fn current_thread_id() -> usize {
    // Used only to compare "same thread as last bind", not as a stable
    // identifier across the process; pointer value of a thread-local is
    // good enough and avoids pulling in an extra dependency.
    thread_local! { static MARK: u8 = 0; }
    MARK.with(|m| m as *const u8 as usize)
}

impl PollGroup {
    pub fn new(events_capacity: usize) -> Result<PollGroup> {
        let epoll = Epoll::new()?;
        let trigger_fd = EventFd::new()?;
        epoll.add(&trigger_fd.as_raw_fd(), TRIGGER_TOKEN, Ready::input(), EpollOpt::edge())?;

        Ok(PollGroup {
            epoll,
            trigger_fd,
            triggered: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                pollables: Slab::new(),
                deletion_queue: Vec::new(),
            }),
            deferred: DeferredProcessor::new(),
            got_deferred_tasks: AtomicBool::new(false),
            events_capacity,
            bound_thread: AtomicUsize::new(0),
            frontend: Mutex::new(None),
            timers: Mutex::new(None),
        })
    }

    /// Installs `frontend`, replacing any previously installed one.
    pub fn set_frontend(&self, frontend: Box<dyn Frontend>) {
        *self.frontend.lock().unwrap() = Some(frontend);
    }

    /// Wires `timers` into this group's poll loop (§4.6): each iteration
    /// advances its notion of "now" from the thread's cached monotonic
    /// clock, fires due timers, and shrinks the `epoll_wait` timeout to the
    /// next timer's due time when that's sooner than the caller's timeout.
    pub fn wire_timers(&self, timers: Arc<Mutex<Timers>>) {
        *self.timers.lock().unwrap() = Some(timers);
    }

    /// Take-drop-call-putback, mirroring the dispatch loop's own pollable
    /// callback handling: `poll_iteration_begin`/`_end` never run with
    /// `self.frontend`'s lock held, so a frontend is free to call back into
    /// `PollGroup` (even `set_frontend`) without deadlocking.
    fn call_frontend_begin(&self) {
        let mut fe = self.frontend.lock().unwrap().take();
        if let Some(f) = fe.as_mut() {
            f.poll_iteration_begin();
        }
        if let Some(f) = fe {
            *self.frontend.lock().unwrap() = Some(f);
        }
    }

    /// Advances and fires this iteration's due timers (if any `Timers` is
    /// wired), returning how long until the next one is due.
    fn run_timers(&self) -> Option<u64> {
        let guard = self.timers.lock().unwrap();
        let timers = guard.as_ref()?;
        let mut timers = timers.lock().unwrap();
        timers.update_time(tls::cached_monotonic());
        timers.process_timers();
        timers.sleep_time_microseconds()
    }

    fn call_frontend_end(&self) -> bool {
        let mut fe = self.frontend.lock().unwrap().take();
        let result = if let Some(f) = fe.as_mut() { f.poll_iteration_end() } else { false };
        if let Some(f) = fe {
            *self.frontend.lock().unwrap() = Some(f);
        }
        result
    }

    /// Binds this group to the calling thread; feedback calls made from the
    /// bound thread skip the trigger-eventfd write (§4.3 thread affinity).
    pub fn bind_to_thread(&self) {
        self.bound_thread.store(current_thread_id(), Ordering::SeqCst);
    }

    pub fn deferred_processor(&self) -> &DeferredProcessor {
        &self.deferred
    }

    /// Wires the deferred processor's trigger backend to this group's
    /// eventfd, so `Registration::schedule_task` from another thread wakes
    /// a blocked `poll()` (§4.7). Requires the group to already be behind an
    /// `Arc` since the callback captures a weak reference to it.
    pub fn wire_trigger(self: &std::sync::Arc<Self>) {
        let weak = std::sync::Arc::downgrade(self);
        self.deferred.set_trigger(crate::cb::Cb::new(move || {
            if let Some(group) = weak.upgrade() {
                let _ = group.trigger();
            }
        }));
    }

    pub fn new_registration(&self) -> Registration {
        self.deferred.new_registration()
    }

    /// Registers `fd` for readiness, returning a key used to remove or
    /// re-arm it. `activate = false` holds the pollable inert; start it
    /// later with `activate_pollable`.
    pub fn add_pollable(
        &self,
        fd: RawFd,
        interest: Ready,
        cb: impl FnMut(PollEvents, &Feedback<'_>) + Send + 'static,
        activate: bool,
    ) -> Result<PollableKey> {
        let mut inner = self.inner.lock().unwrap();
        let key = PollableKey(inner.pollables.insert(PollableEntry {
            fd,
            cb: Box::new(cb),
            valid: true,
            interest,
        }));
        drop(inner);

        if activate {
            self.epoll.add(&fd, Token(key.0), interest | Ready::hup(), EpollOpt::edge())?;
        }
        Ok(key)
    }

    pub fn activate_pollable(&self, key: PollableKey) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let entry = inner
            .pollables
            .get(key.0)
            .ok_or_else(|| crate::error::Error::internal(crate::error::InternalKind::IncorrectUsage(
                "activate_pollable: unknown key".into(),
            )))?;
        let (fd, interest) = (entry.fd, entry.interest);
        drop(inner);
        self.epoll.add(&fd, Token(key.0), interest | Ready::hup(), EpollOpt::edge())
    }

    /// Logically invalidates the entry; physical release waits until the
    /// current iteration's dispatch loop finishes (§4.3).
    pub fn remove_pollable(&self, key: PollableKey) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.pollables.get_mut(key.0) {
            if entry.valid {
                entry.valid = false;
                let fd = entry.fd;
                let _ = self.epoll.delete(&fd);
                inner.deletion_queue.push(key.0);
            }
        }
    }

    fn set_interest(&self, key: PollableKey, interest: Ready) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = match inner.pollables.get_mut(key.0) {
            Some(e) if e.valid => e,
            _ => return Ok(()),
        };
        entry.interest = interest;
        let fd = entry.fd;
        drop(inner);
        self.epoll.modify(&fd, Token(key.0), interest | Ready::hup(), EpollOpt::edge())
    }

    /// Wakes a blocked `poll()` from any thread. Writes coalesce: a
    /// "triggered" flag is set first, avoiding a redundant `write` if one is
    /// already pending.
    pub fn trigger(&self) -> Result<()> {
        if !self.triggered.swap(true, Ordering::AcqRel) {
            self.trigger_fd.write(1)?;
        }
        Ok(())
    }

    fn drain_trigger(&self) {
        self.triggered.store(false, Ordering::Release);
        loop {
            match self.trigger_fd.read() {
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    fn process_deletion_queue(&self) {
        let mut inner = self.inner.lock().unwrap();
        let queue = std::mem::take(&mut inner.deletion_queue);
        for key in queue {
            inner.pollables.try_remove(key);
        }
    }

    /// Runs one bounded iteration of the loop: wait, dispatch, drain
    /// deferred deletions, run the deferred processor, drain the trigger.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<()> {
        tls::refresh_time_cache();
        self.call_frontend_begin();

        let timer_sleep_us = self.run_timers();

        let timeout = match (timeout, self.got_deferred_tasks.load(Ordering::Acquire)) {
            (_, true) => Some(Duration::from_micros(0)),
            (t, false) => t,
        };
        let timeout = match (timeout, timer_sleep_us) {
            (Some(t), Some(us)) => Some(t.min(Duration::from_micros(us))),
            (Some(t), None) => Some(t),
            (None, Some(us)) => Some(Duration::from_micros(us)),
            (None, None) => None,
        };

        let mut events = Events::with_capacity(self.events_capacity);
        loop {
            match self.epoll.wait(&mut events, timeout) {
                Ok(_) => break,
                Err(e) if matches!(e.kind(), crate::error::ErrorKind::Io(io_err) if io_err.kind() == std::io::ErrorKind::Interrupted) => {
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        let count = events.len();
        for idx in 0..count {
            let Some(event) = events.get(idx) else { continue };
            let token = usize::from(event.token());
            if token == usize::MAX {
                continue;
            }

            let pe = PollEvents::from_event(event);
            let key = PollableKey(token);

            let mut inner = self.inner.lock().unwrap();
            let valid = inner.pollables.get(key.0).map(|e| e.valid).unwrap_or(false);
            drop(inner);
            if !valid {
                continue;
            }

            // The callback is taken out for the duration of the call so no
            // lock is held while user code runs (mirrors the sender/deferred
            // take-replace pattern).
            let mut cb_slot = {
                let mut inner = self.inner.lock().unwrap();
                match inner.pollables.get_mut(key.0) {
                    Some(entry) if entry.valid => Some(std::mem::replace(&mut entry.cb, Box::new(|_, _| {}))),
                    _ => None,
                }
            };

            if let Some(mut cb) = cb_slot.take() {
                let feedback = Feedback { group: self, key };
                cb(pe, &feedback);

                let mut inner = self.inner.lock().unwrap();
                if let Some(entry) = inner.pollables.get_mut(key.0) {
                    if entry.valid {
                        entry.cb = cb;
                    }
                }
            }
        }

        self.process_deletion_queue();

        let more_deferred = self.deferred.process();
        let more_frontend = self.call_frontend_end();
        self.got_deferred_tasks.store(more_deferred || more_frontend, Ordering::Release);

        self.drain_trigger();

        Ok(())
    }
}

impl AsRawFd for PollGroup {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc;

    #[test]
    fn trigger_unblocks_a_waiting_poll() {
        let group = Arc::new(PollGroup::new(16).unwrap());
        let g2 = group.clone();
        let handle = std::thread::spawn(move || {
            g2.poll(Some(Duration::from_secs(5))).unwrap();
        });
        std::thread::sleep(Duration::from_millis(20));
        group.trigger().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn pollable_fires_on_eventfd_write() {
        let group = PollGroup::new(16).unwrap();
        let efd = EventFd::new().unwrap();
        let fired = Arc::new(StdAtomicUsize::new(0));
        let fired2 = fired.clone();

        group
            .add_pollable(
                efd.as_raw_fd(),
                Ready::input(),
                move |ev, _fb| {
                    if ev.input {
                        fired2.fetch_add(1, Ordering::SeqCst);
                    }
                },
                true,
            )
            .unwrap();

        efd.write(1).unwrap();
        group.poll(Some(Duration::from_millis(500))).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_pollable_does_not_fire_again() {
        let group = PollGroup::new(16).unwrap();
        let efd = EventFd::new().unwrap();
        let fired = Arc::new(StdAtomicUsize::new(0));
        let fired2 = fired.clone();

        let key = group
            .add_pollable(
                efd.as_raw_fd(),
                Ready::input(),
                move |_ev, _fb| {
                    fired2.fetch_add(1, Ordering::SeqCst);
                },
                true,
            )
            .unwrap();

        group.remove_pollable(key);
        efd.write(1).unwrap();
        group.poll(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
