//! Interval-keyed timer wheel (§4.6). Timers sharing an interval are grouped
//! into one [`TimerChain`]; because every timer in a chain was either
//! inserted at `now + interval` or re-inserted at `last_due + interval`, a
//! chain's due times are naturally non-decreasing in arrival order, so the
//! earliest-due timer in a chain is always at the front of its order queue.
//!
//! Two ordered indexes sit on top of the chains: one keyed by interval (to
//! find-or-create the chain a new timer belongs to), one keyed by nearest
//! due-time across all chains (to answer "what fires next" in O(log N) — the
//! leftmost entry is the global minimum).

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use slab::Slab;

use crate::cb::Cb;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Micros(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerKey {
    interval: Micros,
    slot: usize,
}

struct Entry {
    due: Micros,
    periodic: bool,
    cb: Cb,
}

struct TimerChain {
    /// Slab keys in due-time (arrival) order; the front is always the
    /// earliest entry still present in `entries`.
    order: VecDeque<usize>,
    entries: Slab<Entry>,
}

impl TimerChain {
    fn new() -> TimerChain {
        TimerChain {
            order: VecDeque::new(),
            entries: Slab::new(),
        }
    }

    /// Drops order-queue entries whose slab slot was already cancelled, then
    /// reports the due time of whatever is left at the front.
    fn earliest_due(&mut self) -> Option<Micros> {
        while let Some(&key) = self.order.front() {
            if self.entries.contains(key) {
                return Some(self.entries[key].due);
            }
            self.order.pop_front();
        }
        None
    }

    fn is_empty(&mut self) -> bool {
        self.earliest_due().is_none()
    }
}

/// A thread-owned set of timer chains, ticked once per poll iteration.
pub struct Timers {
    now: Micros,
    chains: BTreeMap<Micros, TimerChain>,
    /// due time of each chain's earliest live entry -> that chain's interval.
    by_due: BTreeMap<Micros, Micros>,
    /// Invoked when `add_timer` installs a new global-earliest due time —
    /// typically set to wake a `poll()` blocked on a now-stale (too long)
    /// timeout by calling `PollGroup::trigger()` from another thread.
    on_first_timer_added: Option<Cb>,
}

impl Timers {
    pub fn new() -> Timers {
        Timers {
            now: Micros(0),
            chains: BTreeMap::new(),
            by_due: BTreeMap::new(),
            on_first_timer_added: None,
        }
    }

    /// Wires the callback fired by `add_timer` whenever the new timer
    /// becomes the earliest-due one known to this `Timers` (§4.6).
    pub fn set_first_timer_added_callback(&mut self, cb: Cb) {
        self.on_first_timer_added = Some(cb);
    }

    /// Advances the timers' notion of "now". Called once per poll iteration
    /// from the cached monotonic clock, not from a syscall.
    pub fn update_time(&mut self, elapsed: Duration) {
        self.now = Micros(elapsed.as_micros() as u64);
    }

    fn reindex_chain(&mut self, interval: Micros, old_due: Option<Micros>) {
        if let Some(old) = old_due {
            self.by_due.remove(&old);
        }
        let mut drop_chain = false;
        if let Some(chain) = self.chains.get_mut(&interval) {
            match chain.earliest_due() {
                Some(new_due) => {
                    self.by_due.insert(new_due, interval);
                }
                None => drop_chain = true,
            }
        }
        if drop_chain {
            self.chains.remove(&interval);
        }
    }

    pub fn add_timer(&mut self, cb: Cb, interval: Duration, periodic: bool) -> TimerKey {
        let interval_us = Micros(interval.as_micros() as u64);
        let due = Micros(self.now.0 + interval_us.0);

        let prev_earliest = self.by_due.keys().next().copied();

        let chain = self.chains.entry(interval_us).or_insert_with(TimerChain::new);
        let old_due = chain.earliest_due();
        let slot = chain.entries.insert(Entry { due, periodic, cb });
        chain.order.push_back(slot);

        self.reindex_chain(interval_us, old_due);

        let new_earliest = self.by_due.keys().next().copied();
        let dropped = match (prev_earliest, new_earliest) {
            (None, Some(_)) => true,
            (Some(prev), Some(new)) => new < prev,
            _ => false,
        };
        if dropped {
            if let Some(cb) = self.on_first_timer_added.as_mut() {
                cb.call();
            }
        }

        TimerKey { interval: interval_us, slot }
    }

    pub fn delete_timer(&mut self, key: TimerKey) {
        let old_due = self.chains.get_mut(&key.interval).and_then(TimerChain::earliest_due);
        if let Some(chain) = self.chains.get_mut(&key.interval) {
            chain.entries.try_remove(key.slot);
        }
        self.reindex_chain(key.interval, old_due);
    }

    /// Microseconds until the next timer fires, or `None` if no timers are
    /// armed. Feeds directly into the poll loop's `epoll_wait` timeout.
    pub fn sleep_time_microseconds(&self) -> Option<u64> {
        self.by_due.keys().next().map(|&due| due.0.saturating_sub(self.now.0))
    }

    /// Fires every timer whose due time has passed, re-arming periodic ones
    /// at the tail of their chain (their next due time is `now + interval`,
    /// which is monotonically later than every existing entry in that
    /// chain). Returns the number of timers fired.
    pub fn process_timers(&mut self) -> usize {
        let mut fired = 0;

        loop {
            let interval = match self.by_due.iter().next() {
                Some((&due, &interval)) if due.0 <= self.now.0 => interval,
                _ => break,
            };

            let chain = self.chains.get_mut(&interval).expect("by_due entry without a chain");
            let old_due = chain.earliest_due();
            let slot = chain.order.pop_front().expect("earliest_due guarantees a front entry");
            let mut entry = chain.entries.remove(slot);
            fired += 1;

            entry.cb.call();

            if entry.periodic {
                entry.due = Micros(self.now.0 + interval.0);
                let new_slot = chain.entries.insert(entry);
                chain.order.push_back(new_slot);
            }

            self.reindex_chain(interval, old_due);
        }

        fired
    }
}

impl Default for Timers {
    fn default() -> Timers {
        Timers::new()
    }
}
