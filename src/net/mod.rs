//! Non-blocking TCP wrappers (§4's `net` module): thin shims over
//! `std::net` that force `set_nonblocking(true)` at construction time and
//! implement [`crate::epoll::Source`] so they can be registered with an
//! [`crate::epoll::Epoll`] directly.

pub mod tcp;

pub use tcp::{TcpListener, TcpStream};
