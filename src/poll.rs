//! Readiness multiplexer used by the dispatch loop.
//!
//! [`Selector`] is the seam that makes the multiplexer pluggable; the default
//! [`PollSelector`] sits on a [`mio::Poll`]. Sources are handed over as raw
//! descriptors so the server keeps owning its sockets.

use std::{io, os::fd::RawFd, time::Duration};

use mio::{unix::SourceFd, Events, Interest, Poll, Registry, Token};
use parking_lot::Mutex;

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// A readiness multiplexer watching descriptors for read readiness.
///
/// `register` and `deregister` may be called from any thread while another
/// thread is blocked in `select`.
pub trait Selector: Send + Sync + 'static {
    /// Start watching `fd` for readability, reporting it as `token`.
    fn register(&self, fd: RawFd, token: Token) -> io::Result<()>;

    /// Stop watching `fd`.
    fn deregister(&self, fd: RawFd) -> io::Result<()>;

    /// Block up to `timeout` and append the tokens of ready descriptors to
    /// `ready`. Returning with nothing ready is not an error.
    fn select(&self, ready: &mut Vec<Token>, timeout: Duration) -> io::Result<()>;
}

/// [`Selector`] backed by mio (epoll, kqueue).
pub struct PollSelector {
    poller: Mutex<(Poll, Events)>,
    registry: Registry,
}

impl PollSelector {
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(DEFAULT_EVENTS_CAPACITY)
    }

    pub fn with_capacity(events_capacity: usize) -> io::Result<Self> {
        let poller = Poll::new()?;
        let registry = poller.registry().try_clone()?;
        Ok(Self {
            poller: Mutex::new((poller, Events::with_capacity(events_capacity))),
            registry,
        })
    }
}

impl Selector for PollSelector {
    fn register(&self, fd: RawFd, token: Token) -> io::Result<()> {
        self.registry
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.registry.deregister(&mut SourceFd(&fd))
    }

    fn select(&self, ready: &mut Vec<Token>, timeout: Duration) -> io::Result<()> {
        let mut guard = self.poller.lock();
        let (poller, events) = &mut *guard;
        match poller.poll(events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        ready.extend(events.iter().map(|event| event.token()));
        Ok(())
    }
}
