use std::time::Duration;

use crate::epoll::Token;
use crate::error::Result;
use crate::sys;

use super::ready::Ready;

/// One readiness notification: which pollable (`Token`) and what happened.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Event {
    kind: Ready,
    token: Token,
}

impl Event {
    pub fn new(kind: Ready, token: Token) -> Event {
        Event { kind, token }
    }

    pub fn kind(&self) -> Ready {
        self.kind
    }

    pub fn token(&self) -> Token {
        self.token
    }
}

/// Reusable readiness buffer filled by one `Epoll::wait` call.
pub struct Events {
    pub(crate) inner: sys::Events,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: sys::Events::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<Event> {
        self.inner.get(idx)
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter { events: self, idx: 0 }
    }
}

pub struct Iter<'a> {
    events: &'a Events,
    idx: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = Event;
    fn next(&mut self) -> Option<Event> {
        let event = self.events.get(self.idx);
        self.idx += 1;
        event
    }
}

pub(crate) fn wait(epoll: &sys::Epoll, events: &mut Events, timeout: Option<Duration>) -> Result<usize> {
    epoll.wait(&mut events.inner, timeout)?;
    Ok(events.len())
}
