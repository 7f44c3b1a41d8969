//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::{
    net::TcpStream,
    sync::Once,
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use mill_server::{error::Result, ConnectionId, ServerConfig, ServerConfigBuilder, ServerHandler, TcpServer};
use tracing_subscriber::{prelude::*, EnvFilter};

pub const TIMEOUT: Duration = Duration::from_millis(50);
pub const WAIT: Duration = Duration::from_secs(3);

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    Stop(String),
    Connect(ConnectionId),
    Receive(ConnectionId, Vec<u8>),
    Disconnect(ConnectionId),
    Abnormal(ConnectionId, String),
    Warning(String),
}

/// Handler forwarding every hook to an [`Observer`].
pub struct Recorder {
    events: Sender<(Event, String)>,
    pub arm_on_connect: bool,
    pub rearm_after_receive: bool,
}

impl Recorder {
    pub fn new() -> (Self, Observer) {
        let (events, seen) = crossbeam_channel::unbounded();
        (
            Self {
                events,
                arm_on_connect: false,
                rearm_after_receive: false,
            },
            Observer { seen },
        )
    }

    pub fn arming(mut self) -> Self {
        self.arm_on_connect = true;
        self.rearm_after_receive = true;
        self
    }

    fn record(&self, event: Event) {
        let name = thread::current().name().unwrap_or_default().to_string();
        let _ = self.events.send((event, name));
    }
}

impl ServerHandler for Recorder {
    fn on_start(&self, _server: &TcpServer) -> Result<()> {
        self.record(Event::Start);
        Ok(())
    }

    fn on_stop(&self, _server: &TcpServer, reason: &str) -> Result<()> {
        self.record(Event::Stop(reason.to_string()));
        Ok(())
    }

    fn on_receive(&self, server: &TcpServer, conn: ConnectionId, data: &[u8]) -> Result<()> {
        self.record(Event::Receive(conn, data.to_vec()));
        if self.rearm_after_receive {
            server.register(conn, true)?;
        }
        Ok(())
    }

    fn on_connect(&self, server: &TcpServer, conn: ConnectionId) -> Result<()> {
        self.record(Event::Connect(conn));
        if self.arm_on_connect {
            server.register(conn, false)?;
        }
        Ok(())
    }

    fn on_disconnect(&self, _server: &TcpServer, conn: ConnectionId) -> Result<()> {
        self.record(Event::Disconnect(conn));
        Ok(())
    }

    fn on_abnormal_disconnect(
        &self,
        _server: &TcpServer,
        conn: ConnectionId,
        message: &str,
    ) -> Result<()> {
        self.record(Event::Abnormal(conn, message.to_string()));
        Ok(())
    }

    fn on_warning(&self, _server: &TcpServer, message: &str) -> Result<()> {
        self.record(Event::Warning(message.to_string()));
        Ok(())
    }
}

/// Receiving side of a [`Recorder`].
pub struct Observer {
    seen: Receiver<(Event, String)>,
}

impl Observer {
    pub fn next(&self) -> Event {
        self.next_with_thread().0
    }

    pub fn next_with_thread(&self) -> (Event, String) {
        self.seen
            .recv_timeout(WAIT)
            .expect("no hook fired in time")
    }

    pub fn next_within(&self, timeout: Duration) -> Option<Event> {
        self.seen.recv_timeout(timeout).ok().map(|(event, _)| event)
    }

    /// Skip events until `pick` matches one.
    pub fn until<T>(&self, mut pick: impl FnMut(&Event) -> Option<T>) -> T {
        let deadline = Instant::now() + WAIT;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let (event, _) = self
                .seen
                .recv_timeout(left)
                .expect("expected hook did not fire in time");
            if let Some(found) = pick(&event) {
                return found;
            }
        }
    }

    pub fn connected(&self) -> ConnectionId {
        self.until(|event| match event {
            Event::Connect(conn) => Some(*conn),
            _ => None,
        })
    }

    pub fn assert_quiet(&self, period: Duration) {
        if let Some(event) = self.next_within(period) {
            panic!("unexpected hook {event:?}");
        }
    }
}

pub fn config() -> ServerConfigBuilder {
    ServerConfig::builder().port(0).poll_timeout(TIMEOUT)
}

pub fn start(config: ServerConfig, handler: impl ServerHandler) -> TcpServer {
    init_tracing();
    let server = TcpServer::new(config, handler).expect("server");
    server.start().expect("start");
    server
}

pub fn connect(server: &TcpServer) -> TcpStream {
    let stream = TcpStream::connect(server.local_addr().expect("listening")).expect("connect");
    stream
        .set_read_timeout(Some(WAIT))
        .expect("read timeout");
    stream
}

pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
