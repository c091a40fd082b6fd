//! Server app / thread pool (§4.9, ambient — supplements the distilled
//! spec). A `ServerApp` owns `N` worker [`ThreadContext`]s, each with its
//! own [`PollGroup`], [`Timers`], [`DeferredProcessor`], and
//! [`DeferredSenderQueue`]. Inbound connections are assigned to workers
//! round-robin; least-loaded selection is a documented future extension
//! (see DESIGN.md), not built here.

use std::net::ToSocketAddrs;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::epoll::Ready;
use crate::error::Result;
use crate::net::{TcpListener, TcpStream};
use crate::page_pool::{PagePool, PagePoolConfig};
use crate::poll_group::PollGroup;
use crate::sender::{DeferredSenderQueue, SenderConfig};
use crate::timers::Timers;

#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    pub num_threads: usize,
    pub events_capacity: usize,
    pub page_pool: PagePoolConfig,
    pub sender: SenderConfig,
    /// Upper bound on one `poll()` call's blocking wait.
    pub poll_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            num_threads: 1,
            events_capacity: 1024,
            page_pool: PagePoolConfig::default(),
            sender: SenderConfig::default(),
            poll_timeout: Duration::from_millis(100),
        }
    }
}

/// Everything one worker thread owns. Shared across the thread boundary
/// only via `Arc`; the `PollGroup` itself is internally synchronized.
pub struct ThreadContext {
    pub poll_group: Arc<PollGroup>,
    pub timers: Arc<Mutex<Timers>>,
    pub page_pool: PagePool,
    pub sender_queue: Arc<DeferredSenderQueue>,
    sender_config: SenderConfig,
    shutdown: AtomicBool,
}

impl ThreadContext {
    fn new(config: &ServerConfig) -> Result<Arc<ThreadContext>> {
        let poll_group = Arc::new(PollGroup::new(config.events_capacity)?);
        poll_group.wire_trigger();

        let timers = Arc::new(Mutex::new(Timers::new()));
        poll_group.wire_timers(timers.clone());

        let weak_group = Arc::downgrade(&poll_group);
        timers.lock().unwrap().set_first_timer_added_callback(crate::cb::Cb::new(move || {
            if let Some(group) = weak_group.upgrade() {
                let _ = group.trigger();
            }
        }));

        let ctx = Arc::new(ThreadContext {
            poll_group,
            timers,
            page_pool: PagePool::new(config.page_pool),
            sender_queue: Arc::new(DeferredSenderQueue::new()),
            sender_config: config.sender,
            shutdown: AtomicBool::new(false),
        });

        Ok(ctx)
    }

    pub fn sender_config(&self) -> SenderConfig {
        self.sender_config
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.poll_group.trigger();
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Spawns the OS thread running this context's `PollGroup::poll` loop
    /// until `shutdown()` is observed.
    fn spawn(self: &Arc<Self>, poll_timeout: Duration) -> JoinHandle<()> {
        let ctx = self.clone();
        ctx.poll_group.bind_to_thread();
        std::thread::spawn(move || {
            while !ctx.is_shutdown() {
                if let Err(e) = ctx.poll_group.poll(Some(poll_timeout)) {
                    log::error!("poll group iteration failed: {e}");
                }
            }
        })
    }
}

/// Callback invoked for every freshly-accepted connection, given the
/// worker `ThreadContext` it was assigned to. Implementations register the
/// socket with `ctx.poll_group` and construct their own `Receiver`/`Sender`
/// pair.
pub type AcceptHandler = dyn Fn(TcpStream, &Arc<ThreadContext>) + Send + Sync;

pub struct ServerApp {
    threads: Vec<Arc<ThreadContext>>,
    next_thread: AtomicUsize,
    accept_poll_group: Arc<PollGroup>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    config: ServerConfig,
}

impl ServerApp {
    pub fn new(config: ServerConfig) -> Result<ServerApp> {
        let num_threads = config.num_threads.max(1);
        let mut threads = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            threads.push(ThreadContext::new(&config)?);
        }

        let accept_poll_group = Arc::new(PollGroup::new(config.events_capacity)?);
        accept_poll_group.wire_trigger();

        Ok(ServerApp {
            threads,
            next_thread: AtomicUsize::new(0),
            accept_poll_group,
            handles: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Picks the next worker round-robin (§4.9: least-loaded selection is
    /// a documented future extension, not built here).
    fn next_thread_context(&self) -> Arc<ThreadContext> {
        let idx = self.next_thread.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        self.threads[idx].clone()
    }

    pub fn thread_contexts(&self) -> &[Arc<ThreadContext>] {
        &self.threads
    }

    /// Binds `listener` on the accept thread's poll group and dispatches
    /// every accepted connection to `on_accept`, running on a worker
    /// chosen round-robin. Returns the bound local address (useful when
    /// `addr` asked for an ephemeral port).
    pub fn listen<A: ToSocketAddrs>(
        &self,
        addr: A,
        on_accept: Arc<AcceptHandler>,
    ) -> Result<std::net::SocketAddr> {
        let listener = Arc::new(TcpListener::bind(addr)?);
        let local_addr = listener.local_addr()?;
        let threads = self.threads.clone();
        let next_thread = Arc::new(AtomicUsize::new(0));

        let listener_for_cb = listener.clone();
        self.accept_poll_group.add_pollable(
            listener.as_raw_fd(),
            Ready::input(),
            move |events, _feedback| {
                if !events.input {
                    return;
                }
                loop {
                    match listener_for_cb.accept() {
                        Ok((stream, _addr)) => {
                            let idx = next_thread.fetch_add(1, Ordering::Relaxed) % threads.len();
                            on_accept(stream, &threads[idx]);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            log::warn!("accept failed: {e}");
                            break;
                        }
                    }
                }
            },
            true,
        )?;

        Ok(local_addr)
    }

    /// Starts the accept thread and every worker thread. Blocks until
    /// `shutdown()` is called from another thread (typically in response
    /// to a signal handler or test harness).
    pub fn run(self: &Arc<Self>) {
        let mut handles = self.handles.lock().unwrap();

        for ctx in &self.threads {
            handles.push(ctx.spawn(self.config.poll_timeout));
        }

        let accept_group = self.accept_poll_group.clone();
        accept_group.bind_to_thread();
        let app = self.clone();
        handles.push(std::thread::spawn(move || {
            while !app.is_accept_shutdown() {
                if let Err(e) = accept_group.poll(Some(app.config.poll_timeout)) {
                    log::error!("accept poll group iteration failed: {e}");
                }
            }
        }));
    }

    fn is_accept_shutdown(&self) -> bool {
        self.threads.iter().all(|t| t.is_shutdown())
    }

    /// Signals every worker (and the accept loop) to stop after its
    /// current iteration and joins all threads.
    pub fn shutdown(&self) {
        for ctx in &self.threads {
            ctx.shutdown();
        }
        let _ = self.accept_poll_group.trigger();

        let mut handles = self.handles.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    #[test]
    fn round_robins_across_worker_threads() {
        let config = ServerConfig { num_threads: 3, ..Default::default() };
        let app = ServerApp::new(config).unwrap();
        assert_eq!(app.thread_contexts().len(), 3);

        let first = app.next_thread_context();
        let second = app.next_thread_context();
        let third = app.next_thread_context();
        let fourth = app.next_thread_context();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&second, &third));
        assert!(Arc::ptr_eq(&first, &fourth));
    }

    #[test]
    fn accepts_a_loopback_connection_and_dispatches_to_a_worker() {
        let _ = env_logger::try_init();

        let config = ServerConfig { num_threads: 1, ..Default::default() };
        let app = Arc::new(ServerApp::new(config).unwrap());

        let dispatched = Arc::new(StdAtomicUsize::new(0));
        let d = dispatched.clone();

        let addr = app
            .listen(
                "127.0.0.1:0",
                Arc::new(move |mut stream: TcpStream, _ctx: &Arc<ThreadContext>| {
                    d.fetch_add(1, Ordering::SeqCst);
                    let _ = stream.write_all(b"ok");
                }),
            )
            .unwrap();

        app.run();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ok");

        app.shutdown();
        assert_eq!(dispatched.load(Ordering::SeqCst), 1);
    }
}
