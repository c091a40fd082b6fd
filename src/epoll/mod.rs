//! Thin, `Source`-generic wrapper around Linux `epoll` (§4.3's backend).
//! Higher-level polling (timeouts, deferred tasks, the trigger eventfd) lives
//! in [`crate::poll_group`]; this module only wraps the three `epoll_ctl`
//! operations and the readiness buffer.

use std::fmt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::Result;
use crate::sys;

mod epoll_opt;
mod event;
mod ready;
mod source;
mod token;

pub use epoll_opt::EpollOpt;
pub use event::{Event, Events, Iter};
pub use ready::Ready;
pub use source::Source;
pub use token::Token;

pub struct Epoll(pub(crate) sys::Epoll);

impl Epoll {
    pub fn new() -> Result<Epoll> {
        Ok(Epoll(sys::Epoll::new()?))
    }

    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> Result<usize> {
        event::wait(&self.0, events, timeout)
    }

    pub fn add<S: Source + ?Sized>(&self, source: &S, token: Token, interest: Ready, opts: EpollOpt) -> Result<()> {
        validate(interest)?;
        source.add(self, token, interest, opts)
    }

    pub fn modify<S: Source + ?Sized>(&self, source: &S, token: Token, interest: Ready, opts: EpollOpt) -> Result<()> {
        validate(interest)?;
        source.modify(self, token, interest, opts)
    }

    pub fn delete<S: Source + ?Sized>(&self, source: &S) -> Result<()> {
        source.delete(self)
    }
}

fn validate(interest: Ready) -> Result<()> {
    if !interest.is_input() && !interest.is_output() {
        return Err(crate::error::Error::internal(crate::error::InternalKind::IncorrectUsage(
            "interest must include input or output".into(),
        )));
    }
    Ok(())
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl fmt::Debug for Epoll {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Epoll(id={})", self.0.id())
    }
}

/// Guards a `Source` against being registered with more than one `Epoll`
/// instance at a time — registering an fd with two epoll instances
/// simultaneously is legal at the kernel level but never what this crate's
/// callers want, since a pollable is owned by exactly one `PollGroup`.
#[derive(Debug, Default)]
pub struct SelectorId {
    id: AtomicUsize,
}

impl SelectorId {
    pub fn new() -> SelectorId {
        SelectorId { id: AtomicUsize::new(0) }
    }

    pub fn associate(&self, epoll: &Epoll) -> Result<()> {
        let current = self.id.load(Ordering::SeqCst);
        if current != 0 && current != epoll.0.id() {
            return Err(crate::error::Error::internal(crate::error::InternalKind::IncorrectUsage(
                "pollable already registered with a different Epoll".into(),
            )));
        }
        self.id.store(epoll.0.id(), Ordering::SeqCst);
        Ok(())
    }
}

impl Clone for SelectorId {
    fn clone(&self) -> SelectorId {
        SelectorId {
            id: AtomicUsize::new(self.id.load(Ordering::SeqCst)),
        }
    }
}
