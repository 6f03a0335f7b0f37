//! Readiness reactor over `mio::Poll`.
//!
//! One registration per socket with both interests; readiness is latched
//! per direction and consumed by the I/O paths, which attempt the syscall
//! first and only park on `WouldBlock` (edge-triggered discipline). Nothing
//! outside this module names a kernel mechanism; mio picks the best one for
//! the target.

use std::cell::{Cell, RefCell};
use std::io;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll as MioPoll, Token};
use slab::Slab;
use tracing::trace;

/// Token reserved for the cross-thread waker.
const WAKE: Token = Token(usize::MAX);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dir {
    Read,
    Write,
}

pub(crate) struct Reactor {
    poll: RefCell<MioPoll>,
    events: RefCell<Events>,
    entries: RefCell<Slab<Entry>>,
}

#[derive(Default)]
struct Entry {
    read_ready: Cell<bool>,
    write_ready: Cell<bool>,
    error: Cell<bool>,
    read_waker: RefCell<Option<Waker>>,
    write_waker: RefCell<Option<Waker>>,
}

impl Reactor {
    pub(crate) fn new() -> io::Result<Reactor> {
        Ok(Reactor {
            poll: RefCell::new(MioPoll::new()?),
            events: RefCell::new(Events::with_capacity(1024)),
            entries: RefCell::new(Slab::new()),
        })
    }

    /// A waker foreign threads can use to break the poll.
    pub(crate) fn make_waker(&self) -> io::Result<mio::Waker> {
        mio::Waker::new(self.poll.borrow().registry(), WAKE)
    }

    /// Register a source for both directions; returns its key.
    pub(crate) fn register(&self, source: &mut impl Source) -> io::Result<usize> {
        let key = self.entries.borrow_mut().insert(Entry::default());
        let res = self.poll.borrow().registry().register(
            source,
            Token(key),
            Interest::READABLE | Interest::WRITABLE,
        );
        if let Err(err) = res {
            self.entries.borrow_mut().remove(key);
            return Err(err);
        }
        trace!("reactor register key={}", key);
        Ok(key)
    }

    pub(crate) fn deregister(&self, source: &mut impl Source, key: usize) -> io::Result<()> {
        trace!("reactor deregister key={}", key);
        let mut entries = self.entries.borrow_mut();
        if entries.contains(key) {
            entries.remove(key);
        }
        self.poll.borrow().registry().deregister(source)
    }

    /// Latched readiness check; parks the waker when not ready.
    pub(crate) fn poll_ready(
        &self,
        key: usize,
        dir: Dir,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        let entries = self.entries.borrow();
        let Some(entry) = entries.get(key) else {
            return Poll::Ready(Err(io::ErrorKind::NotConnected.into()));
        };
        let (flag, waker) = match dir {
            Dir::Read => (&entry.read_ready, &entry.read_waker),
            Dir::Write => (&entry.write_ready, &entry.write_waker),
        };
        if flag.get() || entry.error.get() {
            return Poll::Ready(Ok(()));
        }
        *waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }

    /// Drop the latch after a `WouldBlock`, so the next wait parks until the
    /// kernel reports again.
    pub(crate) fn clear_ready(&self, key: usize, dir: Dir) {
        let entries = self.entries.borrow();
        if let Some(entry) = entries.get(key) {
            match dir {
                Dir::Read => entry.read_ready.set(false),
                Dir::Write => entry.write_ready.set(false),
            }
        }
    }

    /// One reactor turn: block up to `timeout` for kernel events, then latch
    /// readiness and wake parked tasks.
    pub(crate) fn turn(&self, timeout: Option<Duration>) -> io::Result<()> {
        let mut events = self.events.borrow_mut();
        match self.poll.borrow_mut().poll(&mut events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }
        let entries = self.entries.borrow();
        for event in events.iter() {
            let token = event.token();
            if token == WAKE {
                continue;
            }
            let Some(entry) = entries.get(token.0) else {
                continue;
            };
            if event.is_error() {
                entry.error.set(true);
            }
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                entry.read_ready.set(true);
                if let Some(waker) = entry.read_waker.borrow_mut().take() {
                    waker.wake();
                }
            }
            if event.is_writable() || event.is_write_closed() || event.is_error() {
                entry.write_ready.set(true);
                if let Some(waker) = entry.write_waker.borrow_mut().take() {
                    waker.wake();
                }
            }
        }
        Ok(())
    }
}
