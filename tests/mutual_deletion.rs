//! End-to-end scenario 4 (§8 "Mutual deletion"): `a` and `b` each subscribe
//! to the other's destruction, gated on each other's liveness. Dropping `a`
//! first must fire `cb_on_b` (its target died while its guard, `b`, was
//! still alive) and cancel `cb_on_a` (its guard, `a`, is the one dying).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use netcore_rs::Shared;

#[test]
fn mutual_deletion_cancels_the_subscription_guarded_by_the_dying_object() {
    let cb_on_b_fired = Arc::new(AtomicBool::new(false));
    let cb_on_a_fired = Arc::new(AtomicBool::new(false));

    let a = Shared::new(());
    let b = Shared::new(());

    {
        let f = cb_on_b_fired.clone();
        Shared::add_deletion_callback(&a, move || f.store(true, Ordering::SeqCst), Some(&b));
    }
    {
        let f = cb_on_a_fired.clone();
        Shared::add_deletion_callback(&b, move || f.store(true, Ordering::SeqCst), Some(&a));
    }

    drop(a);

    assert!(cb_on_b_fired.load(Ordering::SeqCst), "a died with its guard b alive: cb_on_b must fire");
    assert!(!cb_on_a_fired.load(Ordering::SeqCst), "a was cb_on_a's guard: it must be cancelled, not invoked");

    drop(b);
    assert!(!cb_on_a_fired.load(Ordering::SeqCst));
}
