//! End-to-end scenario 5 (§8 "Timer coalescing"): 1000 timers sharing a
//! 100 ms interval plus one 50 ms timer, all added at t=0, must fire in
//! strict due-time order regardless of chain size.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use netcore_rs::cb::Cb;
use netcore_rs::timers::Timers;

#[test]
fn a_fast_timer_fires_before_a_large_chain_of_slow_timers() {
    let mut timers = Timers::new();
    let fired = Arc::new(AtomicUsize::new(0));

    for _ in 0..1000 {
        let f = fired.clone();
        timers.add_timer(
            Cb::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(100),
            false,
        );
    }
    let f = fired.clone();
    timers.add_timer(
        Cb::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }),
        Duration::from_millis(50),
        false,
    );

    timers.update_time(Duration::from_millis(75));
    timers.process_timers();
    assert_eq!(fired.load(Ordering::SeqCst), 1, "only the 50ms timer is due at t=75ms");

    timers.update_time(Duration::from_millis(125));
    timers.process_timers();
    assert_eq!(fired.load(Ordering::SeqCst), 1001, "all 1000 slow timers are due by t=125ms");
}
