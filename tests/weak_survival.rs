//! End-to-end scenario 3 (§8 "Weak survival"): a weak reference must never
//! observe a dangling object, and the destructor runs exactly once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use netcore_rs::{Shared, WeakRef};

struct Counted(Arc<AtomicUsize>);

impl Drop for Counted {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn weak_ref_does_not_survive_the_last_strong_drop() {
    let destructor_runs = Arc::new(AtomicUsize::new(0));
    let object = Shared::new(Counted(destructor_runs.clone()));
    let weak: WeakRef<Counted> = Shared::downgrade(&object);

    assert!(WeakRef::upgrade(&weak).is_some());
    assert_eq!(destructor_runs.load(Ordering::SeqCst), 0);

    drop(object);

    assert!(WeakRef::upgrade(&weak).is_none());
    assert_eq!(destructor_runs.load(Ordering::SeqCst), 1);
}
