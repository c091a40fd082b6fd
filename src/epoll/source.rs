use std::os::unix::io::RawFd;

use crate::error::Result;

use super::{Epoll, EpollOpt, Ready, Token};

/// Anything that can be registered with an `Epoll` instance: a raw fd, or a
/// higher-level wrapper (`TcpStream`, `EventFd`) that forwards to one.
pub trait Source {
    fn add(&self, epoll: &Epoll, token: Token, interest: Ready, opts: EpollOpt) -> Result<()>;
    fn modify(&self, epoll: &Epoll, token: Token, interest: Ready, opts: EpollOpt) -> Result<()>;
    fn delete(&self, epoll: &Epoll) -> Result<()>;
}

impl Source for RawFd {
    fn add(&self, epoll: &Epoll, token: Token, interest: Ready, opts: EpollOpt) -> Result<()> {
        Ok(epoll.0.add(*self, token, interest, opts)?)
    }

    fn modify(&self, epoll: &Epoll, token: Token, interest: Ready, opts: EpollOpt) -> Result<()> {
        Ok(epoll.0.modify(*self, token, interest, opts)?)
    }

    fn delete(&self, epoll: &Epoll) -> Result<()> {
        Ok(epoll.0.delete(*self)?)
    }
}
