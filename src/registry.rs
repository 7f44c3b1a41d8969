//! Client registry and per-connection readiness state.
//!
//! ```text
//!            register            event (disarm)
//!   Idle ──────────────▶ Armed ────────────────▶ Dispatching
//!    ▲  ◀──────────────   ▲                         │   │
//!    │    unregister      │  finish (re-arm asked)  │   │
//!    │                    └─────────────────────────┘   │
//!    └──────────────────────────────────────────────────┘
//!                    finish (no re-arm)
//!
//!   any state ──close──▶ Closed
//! ```
//!
//! A connection is only in the multiplexer while `Armed`, and an event moves
//! it out before its receive dispatch runs, so at most one dispatch per
//! connection is ever in flight. A `register` made while a dispatch is still
//! running is recorded and applied when that dispatch finishes.

use std::{
    fmt,
    net::{SocketAddr, TcpStream},
    os::fd::AsRawFd,
    sync::Arc,
};

use lockfree::map::Map as LockfreeMap;
use mio::Token;
use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    poll::Selector,
};

/// Identity of a live connection.
///
/// Ids are handed out in increasing order and never reused, so a stale id can
/// never address a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn token(self) -> Token {
        Token(self.0 as usize)
    }

    pub(crate) fn from_token(token: Token) -> Self {
        ConnectionId(token.0 as u64)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    Idle,
    Armed,
    Dispatching { rearm: bool },
    Closed,
}

/// Registry record of one admitted connection.
pub(crate) struct Client {
    id: ConnectionId,
    stream: TcpStream,
    peer_addr: SocketAddr,
    readiness: Mutex<Readiness>,
    send_lock: Mutex<()>,
}

impl Client {
    pub fn new(id: ConnectionId, stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            stream,
            peer_addr,
            readiness: Mutex::new(Readiness::Idle),
            send_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn send_lock(&self) -> &Mutex<()> {
        &self.send_lock
    }

    #[cfg(test)]
    pub fn readiness(&self) -> Readiness {
        *self.readiness.lock()
    }

    /// Arm for read readiness, or schedule re-arming if a dispatch is running.
    pub fn arm(&self, selector: &dyn Selector) -> Result<()> {
        let mut state = self.readiness.lock();
        match *state {
            Readiness::Idle => {
                selector.register(self.stream.as_raw_fd(), self.id.token())?;
                *state = Readiness::Armed;
                Ok(())
            }
            Readiness::Dispatching { rearm: false } => {
                *state = Readiness::Dispatching { rearm: true };
                Ok(())
            }
            Readiness::Armed | Readiness::Dispatching { rearm: true } => {
                Err(Error::AlreadyRegistered(self.id))
            }
            Readiness::Closed => Err(Error::UnknownConnection(self.id)),
        }
    }

    pub fn disarm(&self, selector: &dyn Selector) -> Result<()> {
        let mut state = self.readiness.lock();
        match *state {
            Readiness::Armed => {
                selector.deregister(self.stream.as_raw_fd())?;
                *state = Readiness::Idle;
                Ok(())
            }
            Readiness::Dispatching { rearm: true } => {
                *state = Readiness::Dispatching { rearm: false };
                Ok(())
            }
            Readiness::Idle | Readiness::Dispatching { rearm: false } | Readiness::Closed => {
                Err(Error::NotRegistered(self.id))
            }
        }
    }

    /// Consume the one-shot registration before a dispatch. Returns `false`
    /// when the event is stale and nothing should be dispatched.
    pub fn begin_dispatch(&self, selector: &dyn Selector) -> Result<bool> {
        let mut state = self.readiness.lock();
        if *state != Readiness::Armed {
            return Ok(false);
        }
        *state = Readiness::Dispatching { rearm: false };
        selector.deregister(self.stream.as_raw_fd())?;
        Ok(true)
    }

    pub fn finish_dispatch(&self, selector: &dyn Selector) -> Result<()> {
        let mut state = self.readiness.lock();
        match *state {
            Readiness::Dispatching { rearm: true } => {
                *state = Readiness::Idle;
                selector.register(self.stream.as_raw_fd(), self.id.token())?;
                *state = Readiness::Armed;
            }
            Readiness::Dispatching { rearm: false } => *state = Readiness::Idle,
            Readiness::Idle | Readiness::Armed | Readiness::Closed => {}
        }
        Ok(())
    }

    /// Move to `Closed`, leaving the multiplexer if armed. Only the first
    /// caller gets `true`.
    pub fn close(&self, selector: &dyn Selector) -> bool {
        let mut state = self.readiness.lock();
        match *state {
            Readiness::Closed => false,
            Readiness::Armed => {
                let _ = selector.deregister(self.stream.as_raw_fd());
                *state = Readiness::Closed;
                true
            }
            _ => {
                *state = Readiness::Closed;
                true
            }
        }
    }
}

/// Live connections keyed by id.
pub(crate) struct Registry {
    clients: LockfreeMap<ConnectionId, Arc<Client>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            clients: LockfreeMap::new(),
        }
    }

    pub fn insert(&self, client: Arc<Client>) {
        self.clients.insert(client.id(), client);
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Client>> {
        self.clients.get(&id).map(|entry| entry.val().clone())
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Client>> {
        self.clients.remove(&id).map(|entry| entry.val().clone())
    }

    pub fn ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.clients.iter().map(|entry| *entry.key())
    }

    pub fn len(&self) -> usize {
        self.clients.iter().count()
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, sync::atomic::AtomicUsize, sync::atomic::Ordering, time::Duration};

    use super::*;

    /// Selector that only counts calls.
    #[derive(Default)]
    struct CountingSelector {
        registers: AtomicUsize,
        deregisters: AtomicUsize,
    }

    impl Selector for CountingSelector {
        fn register(&self, _fd: i32, _token: Token) -> std::io::Result<()> {
            self.registers.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn deregister(&self, _fd: i32) -> std::io::Result<()> {
            self.deregisters.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn select(&self, _ready: &mut Vec<Token>, _timeout: Duration) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn client(id: u64) -> (Client, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, addr) = listener.accept().unwrap();
        (Client::new(ConnectionId(id), stream, addr), peer)
    }

    #[test]
    fn test_arm_twice_is_duplicate() {
        let selector = CountingSelector::default();
        let (client, _peer) = client(1);

        client.arm(&selector).unwrap();
        assert!(matches!(
            client.arm(&selector),
            Err(Error::AlreadyRegistered(ConnectionId(1)))
        ));
        assert_eq!(selector.registers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disarm_idle_is_not_registered() {
        let selector = CountingSelector::default();
        let (client, _peer) = client(2);
        assert!(matches!(
            client.disarm(&selector),
            Err(Error::NotRegistered(ConnectionId(2)))
        ));
    }

    #[test]
    fn test_dispatch_is_one_shot() {
        let selector = CountingSelector::default();
        let (client, _peer) = client(3);

        client.arm(&selector).unwrap();
        assert!(client.begin_dispatch(&selector).unwrap());
        // a second event for the same registration is stale
        assert!(!client.begin_dispatch(&selector).unwrap());
        client.finish_dispatch(&selector).unwrap();
        assert_eq!(client.readiness(), Readiness::Idle);
        assert_eq!(selector.deregisters.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rearm_during_dispatch_is_deferred() {
        let selector = CountingSelector::default();
        let (client, _peer) = client(4);

        client.arm(&selector).unwrap();
        client.begin_dispatch(&selector).unwrap();
        client.arm(&selector).unwrap();
        assert_eq!(client.readiness(), Readiness::Dispatching { rearm: true });
        assert_eq!(selector.registers.load(Ordering::SeqCst), 1);

        client.finish_dispatch(&selector).unwrap();
        assert_eq!(client.readiness(), Readiness::Armed);
        assert_eq!(selector.registers.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_close_only_once() {
        let selector = CountingSelector::default();
        let (client, _peer) = client(5);

        client.arm(&selector).unwrap();
        assert!(client.close(&selector));
        assert!(!client.close(&selector));
        assert_eq!(selector.deregisters.load(Ordering::SeqCst), 1);
        assert!(matches!(
            client.arm(&selector),
            Err(Error::UnknownConnection(_))
        ));
        client.finish_dispatch(&selector).unwrap();
        assert_eq!(client.readiness(), Readiness::Closed);
    }

    #[test]
    fn test_registry_snapshot() {
        let registry = Registry::new();
        let (a, _pa) = client(10);
        let (b, _pb) = client(11);
        registry.insert(Arc::new(a));
        registry.insert(Arc::new(b));

        let mut ids: Vec<_> = registry.ids().collect();
        ids.sort();
        assert_eq!(ids, vec![ConnectionId(10), ConnectionId(11)]);

        assert!(registry.remove(ConnectionId(10)).is_some());
        assert!(registry.remove(ConnectionId(10)).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.get(ConnectionId(11)).is_some());
    }
}
