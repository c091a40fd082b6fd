//! `Informer<R>`: a multi-subscriber event fan-out list. Subscribers may
//! subscribe or unsubscribe from within a callback that is itself running as
//! part of an `inform_all` pass — a fresh subscription added mid-pass is not
//! visited until the *next* pass, and a subscription removed mid-pass is
//! skipped if its turn hasn't come up yet.
//!
//! Subscriptions gated on a guard ([`Cb::guarded`]) that has since died are
//! pruned the first time `inform_all` notices the guard failed to upgrade,
//! so a long-lived `Informer` doesn't accumulate dead entries.

use std::sync::Mutex;

use slab::Slab;

use crate::cb::Cb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionKey(usize);

pub struct Informer<R = ()> {
    subs: Mutex<Slab<Option<Cb<R>>>>,
}

impl<R> Informer<R> {
    pub fn new() -> Informer<R> {
        Informer {
            subs: Mutex::new(Slab::new()),
        }
    }

    pub fn subscribe(&self, cb: Cb<R>) -> SubscriptionKey {
        SubscriptionKey(self.subs.lock().unwrap().insert(Some(cb)))
    }

    pub fn unsubscribe(&self, key: SubscriptionKey) {
        self.subs.lock().unwrap().try_remove(key.0);
    }

    pub fn len(&self) -> usize {
        self.subs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R> Default for Informer<R> {
    fn default() -> Informer<R> {
        Informer::new()
    }
}

impl Informer<()> {
    /// Invokes every live subscriber once. Subscriptions added during this
    /// call are not visited; subscriptions removed during this call (by
    /// another thread, or by a callback unsubscribing a sibling) are simply
    /// skipped if not yet reached. The subscriber list's mutex is never held
    /// while a callback runs: each `Cb` is taken out of its slot, the lock is
    /// dropped, the callback runs, and the lock is re-acquired to put it
    /// back — so a subscriber is free to subscribe, unsubscribe, or call back
    /// into this same `Informer` without deadlocking.
    pub fn inform_all(&self) {
        let keys: Vec<usize> = self.subs.lock().unwrap().iter().map(|(k, _)| k).collect();
        for key in keys {
            let cb = {
                let mut subs = self.subs.lock().unwrap();
                match subs.get_mut(key) {
                    Some(slot) => slot.take(),
                    None => continue,
                }
            };
            let Some(mut cb) = cb else { continue };
            let fired = cb.call();

            let mut subs = self.subs.lock().unwrap();
            match subs.get_mut(key) {
                Some(slot) if fired.is_some() => *slot = Some(cb),
                Some(_) => {
                    // Guard died; prune rather than leave a permanently-dead entry.
                    subs.try_remove(key);
                }
                None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::obj::Shared;

    #[test]
    fn informs_every_subscriber() {
        let informer: Informer = Informer::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let c = calls.clone();
            informer.subscribe(Cb::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }
        informer.inform_all();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn prunes_subscriptions_whose_guard_died() {
        let informer: Informer = Informer::new();
        let guard = Shared::new(());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        informer.subscribe(Cb::guarded(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            &guard,
        ));
        assert_eq!(informer.len(), 1);
        drop(guard);
        informer.inform_all();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(informer.len(), 0);
    }

    #[test]
    fn subscriber_can_unsubscribe_itself_mid_pass() {
        let informer: Arc<Informer> = Arc::new(Informer::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let informer2 = informer.clone();
        let c = calls.clone();
        // Capture the key after creation via a RefCell-like indirection: use
        // a Cell<Option<SubscriptionKey>> populated right after subscribe.
        let key_cell: Arc<std::sync::Mutex<Option<SubscriptionKey>>> = Arc::new(std::sync::Mutex::new(None));
        let key_cell2 = key_cell.clone();
        let key = informer.subscribe(Cb::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            if let Some(k) = *key_cell2.lock().unwrap() {
                informer2.unsubscribe(k);
            }
        }));
        *key_cell.lock().unwrap() = Some(key);

        informer.inform_all();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(informer.is_empty());
    }
}
