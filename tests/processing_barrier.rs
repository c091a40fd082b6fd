//! End-to-end scenario 6 (§8 "Processing barrier"): data enqueued by a
//! reentrant callback after the barrier was marked must wait for the next
//! drain pass, even though it shares the same sender and queue.

use std::io::{self, IoSlice};
use std::sync::Mutex;

use netcore_rs::page_pool::PagePool;
use netcore_rs::sender::{AsRawFdLike, DrainOutcome, MessageEntry, Sender, SenderConfig};

struct MemSink {
    buf: Mutex<Vec<u8>>,
}

impl AsRawFdLike for MemSink {
    fn writev(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut out = self.buf.lock().unwrap();
        let mut n = 0;
        for b in bufs {
            out.extend_from_slice(b);
            n += b.len();
        }
        Ok(n)
    }
}

#[test]
fn barrier_stops_the_pass_even_when_more_is_enqueued_mid_pass() {
    let pool = PagePool::new(Default::default());
    let sender = Sender::new(SenderConfig { soft_limit: 10_000, hard_limit: 20_000, iov_max: 1024 });

    let chunk = vec![7u8; 65536];
    for _ in 0..16 {
        sender.post_message(MessageEntry::from_bytes(&pool, &chunk));
    }
    assert_eq!(sender.pending_count(), 16);

    sender.mark_barrier();

    // Simulates a frontend callback reentrantly posting more data after the
    // barrier was marked but before this iteration's write has happened.
    for _ in 0..16 {
        sender.post_message(MessageEntry::from_bytes(&pool, &chunk));
    }
    assert_eq!(sender.pending_count(), 32);

    let sink = MemSink { buf: Mutex::new(Vec::new()) };
    let outcome = sender.drain(&sink).unwrap();

    assert_eq!(outcome, DrainOutcome::BarrierHit);
    assert_eq!(sink.buf.lock().unwrap().len(), 16 * 65536, "only the pre-barrier batch should have been written");
    assert_eq!(sender.pending_count(), 16, "the reentrant batch must wait for the next iteration");
}
