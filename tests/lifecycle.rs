mod common;

use std::{
    io::Read,
    net::TcpStream,
    time::{Duration, Instant},
};

use common::*;
use mill_server::{
    error::{Error, Result},
    ConnectionId, NoOpHandler, ServerHandler, TcpServer,
};

#[test]
fn test_start_fires_on_start_and_binds_ephemeral_port() {
    let (recorder, seen) = Recorder::new();
    let server = start(config().build(), recorder);

    assert_eq!(seen.next(), Event::Start);
    let address = server.local_addr().unwrap();
    assert_ne!(address.port(), 0);
    assert!(server.is_running());

    server.stop("").unwrap();
}

#[test]
fn test_start_twice_is_usage_error() {
    let server = start(config().build(), NoOpHandler);
    assert!(matches!(server.start(), Err(Error::AlreadyStarted)));
    assert!(server.is_running());
    server.stop("").unwrap();
}

#[test]
fn test_stop_before_start_is_usage_error() {
    init_tracing();
    let server = TcpServer::new(config().build(), NoOpHandler).unwrap();
    assert!(matches!(server.stop(""), Err(Error::NotStarted)));
    assert!(matches!(server.wait(), Err(Error::NotStarted)));
}

#[test]
fn test_stop_blocks_until_stopped_and_reports_reason() {
    let (recorder, seen) = Recorder::new();
    let server = start(config().build(), recorder);
    assert_eq!(seen.next(), Event::Start);

    server.stop("maintenance").unwrap();

    // on_stop runs inline, so it has already fired when stop returns
    assert!(server.is_stopped());
    assert!(!server.is_running());
    assert_eq!(
        seen.next_within(Duration::from_millis(10)),
        Some(Event::Stop("maintenance".into()))
    );
}

#[test]
fn test_stop_is_one_shot() {
    let (recorder, seen) = Recorder::new();
    let server = start(config().build(), recorder);

    server.stop("").unwrap();
    assert!(matches!(server.stop(""), Err(Error::AlreadyStopped)));
    assert!(matches!(server.stop("again"), Err(Error::AlreadyStopped)));

    let stops = std::iter::from_fn(|| seen.next_within(Duration::from_millis(100)))
        .filter(|event| matches!(event, Event::Stop(_)))
        .count();
    assert_eq!(stops, 1);
}

#[test]
fn test_concurrent_stop_only_one_wins() {
    let server = start(config().build(), NoOpHandler);

    let results: Vec<bool> = (0..4)
        .map(|_| {
            let server = server.clone();
            std::thread::spawn(move || server.stop("").is_ok())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    assert_eq!(results.iter().filter(|won| **won).count(), 1);
    assert!(server.wait_timeout(WAIT));
}

#[test]
fn test_stop_returns_within_a_few_timeouts() {
    let server = start(config().build(), NoOpHandler);
    let started = Instant::now();
    server.stop("").unwrap();
    assert!(started.elapsed() < TIMEOUT * 10, "{:?}", started.elapsed());
}

#[test]
fn test_stop_drops_connections_silently() {
    let (recorder, seen) = Recorder::new();
    let server = start(config().build(), recorder.arming());
    let mut client = connect(&server);
    seen.connected();

    server.stop("").unwrap();
    assert_eq!(server.connection_count(), 0);

    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut buf).unwrap(), 0);

    let mut remaining = Vec::new();
    while let Some(event) = seen.next_within(Duration::from_millis(100)) {
        remaining.push(event);
    }
    assert!(
        !remaining
            .iter()
            .any(|event| matches!(event, Event::Disconnect(_) | Event::Abnormal(..))),
        "{remaining:?}"
    );
}

#[test]
fn test_wait_returns_after_stop_from_other_thread() {
    let server = start(config().build(), NoOpHandler);
    let stopper = server.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        stopper.stop("").unwrap();
    });

    server.wait().unwrap();
    assert!(server.is_stopped());
    handle.join().unwrap();
}

struct PanicOnConnect {
    recorder: Recorder,
}

impl ServerHandler for PanicOnConnect {
    fn on_connect(&self, _server: &TcpServer, _conn: ConnectionId) -> Result<()> {
        panic!("on_connect exploded");
    }

    fn on_stop(&self, server: &TcpServer, reason: &str) -> Result<()> {
        self.recorder.on_stop(server, reason)
    }
}

#[test]
fn test_panicking_inline_hook_shuts_the_server_down() {
    let (recorder, seen) = Recorder::new();
    let server = start(config().build(), PanicOnConnect { recorder });
    let _client = connect(&server);

    let reason = seen.until(|event| match event {
        Event::Stop(reason) => Some(reason.clone()),
        _ => None,
    });
    assert!(reason.contains("admission"), "{reason}");
    assert!(reason.contains("on_connect exploded"), "{reason}");
    assert!(server.wait_timeout(WAIT));
    assert!(!server.is_running());
}

#[test]
fn test_servers_are_independent() {
    let (first_recorder, first_seen) = Recorder::new();
    let (second_recorder, second_seen) = Recorder::new();
    let first = start(config().build(), first_recorder);
    let second = start(config().build(), second_recorder);
    assert_ne!(first.local_addr(), second.local_addr());

    let _client = connect(&second);
    second_seen.connected();

    first.stop("").unwrap();
    assert!(second.is_running());
    assert_eq!(second.connection_count(), 1);
    first_seen.until(|event| matches!(event, Event::Stop(_)).then_some(()));

    second.stop("").unwrap();
}

#[test]
fn test_bind_failure_leaves_server_startable() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    init_tracing();

    let server = TcpServer::new(config().port(port).build(), NoOpHandler).unwrap();
    assert!(matches!(server.start(), Err(Error::Io(_))));
    assert!(!server.is_running());
    assert!(server.local_addr().is_none());

    drop(taken);
    server.start().unwrap();
    assert_eq!(server.local_addr().unwrap().port(), port);
    let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    server.stop("").unwrap();
}

#[test]
fn test_invalid_config_rejected() {
    let config = config().poll_timeout(Duration::ZERO).build();
    assert!(matches!(
        TcpServer::new(config, NoOpHandler),
        Err(Error::Configuration(_))
    ));
}
