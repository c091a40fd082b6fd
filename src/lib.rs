//! Foundation library for high-performance, multi-threaded network servers:
//! object lifetime with deletion subscriptions, an epoll event loop, timers,
//! a deferred-task processor, and a paged, backpressure-aware sender/receiver
//! pair for non-blocking TCP connections.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use netcore_rs::server::{ServerApp, ServerConfig, ThreadContext};
//! use netcore_rs::net::TcpStream;
//!
//! let app = Arc::new(ServerApp::new(ServerConfig::default()).unwrap());
//! app.listen(
//!     "127.0.0.1:0",
//!     Arc::new(|_stream: TcpStream, _ctx: &Arc<ThreadContext>| {
//!         // register the stream with ctx.poll_group, build a Receiver/Sender.
//!     }),
//! )
//! .unwrap();
//! app.run();
//! app.shutdown();
//! ```

pub mod cb;
pub mod deferred;
pub mod epoll;
pub mod error;
pub mod informer;
pub mod net;
pub mod obj;
pub mod page_pool;
pub mod poll_group;
pub mod queue;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod state_mutex;
mod sys;
pub mod timers;
mod tls;
pub mod waker;

pub use error::{Error, ErrorKind, Result};
pub use obj::{Shared, WeakRef};
pub use poll_group::PollGroup;
