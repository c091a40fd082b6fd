//! End-to-end scenario 2 (§8 "Deferred close"): `close_after_flush()`
//! queued behind four one-byte messages must fire its closed notification
//! exactly once, only after the fourth message has actually gone out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use std::io::Read;
use std::net::TcpStream as StdTcpStream;

use netcore_rs::deferred::DeferredProcessor;
use netcore_rs::error::Error;
use netcore_rs::net::TcpListener;
use netcore_rs::page_pool::PagePool;
use netcore_rs::sender::{DrainOutcome, Frontend, MessageEntry, SendState, Sender, SenderConfig};

struct RecordingFrontend {
    state_changes: Arc<AtomicUsize>,
    closed_fires: Arc<AtomicUsize>,
    closed_was_clean: Arc<std::sync::atomic::AtomicBool>,
}

impl Frontend for RecordingFrontend {
    fn send_state_changed(&mut self, _state: SendState) {
        self.state_changes.fetch_add(1, Ordering::SeqCst);
    }

    fn closed(&mut self, exc: Option<Error>) {
        self.closed_fires.fetch_add(1, Ordering::SeqCst);
        self.closed_was_clean.store(exc.is_none(), Ordering::SeqCst);
    }
}

#[test]
fn close_after_flush_fires_exactly_once_after_the_last_message() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut stream = StdTcpStream::connect(addr).unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).unwrap();
        buf
    });

    let (stream, _) = loop {
        match listener.accept() {
            Ok(pair) => break pair,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(5)),
            Err(e) => panic!("accept failed: {e}"),
        }
    };

    let pool = PagePool::new(Default::default());
    let sender = Sender::new(SenderConfig::default());
    for b in [b'a', b'b', b'c', b'd'] {
        sender.post_message(MessageEntry::from_bytes(&pool, &[b]));
    }
    sender.close_after_flush();
    assert!(!sender.is_closed(), "closing must wait for the queue to drain");

    let closed_fires = Arc::new(AtomicUsize::new(0));
    let closed_was_clean = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let dp = DeferredProcessor::new();
    let reg = dp.new_registration();
    sender.set_frontend(
        reg,
        Box::new(RecordingFrontend {
            state_changes: Arc::new(AtomicUsize::new(0)),
            closed_fires: closed_fires.clone(),
            closed_was_clean: closed_was_clean.clone(),
        }),
    );

    assert_eq!(closed_fires.load(Ordering::SeqCst), 0, "no callback before the queue drains");

    let outcome = sender.drain(&stream).unwrap();
    assert_eq!(outcome, DrainOutcome::Drained);
    assert!(sender.is_closed());
    assert_eq!(closed_fires.load(Ordering::SeqCst), 0, "the frontend callback is deferred, not inline");

    dp.process();
    assert_eq!(closed_fires.load(Ordering::SeqCst), 1, "closed callback must fire exactly once");
    assert!(closed_was_clean.load(Ordering::SeqCst), "close_after_flush is not an abnormal close");

    dp.process();
    assert_eq!(closed_fires.load(Ordering::SeqCst), 1, "and never again after that");

    drop(stream);
    let received = client.join().unwrap();
    assert_eq!(received, b"abcd");
}
