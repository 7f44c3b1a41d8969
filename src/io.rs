//! Raw non-blocking socket primitives.
//!
//! Both functions expect a socket in non-blocking mode and classify what the
//! kernel reports into the outcomes the server cares about.

use std::{
    io::{self, Read, Write},
    net::TcpStream,
    os::fd::AsRawFd,
    time::Duration,
};

use mio::{unix::SourceFd, Events, Interest, Poll, Token};

pub const DEFAULT_RECEIVE_SIZE: usize = 4096;

/// Outcome of a single [`receive_once`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Bytes read, never empty.
    Data(Vec<u8>),
    /// Nothing buffered right now; wait for the next readiness notification.
    WouldBlock,
    /// The peer closed the connection in an orderly way.
    Disconnected,
    /// Any other socket failure.
    Aborted(String),
}

/// Issue exactly one read of up to `size` bytes.
pub fn receive_once(stream: &TcpStream, size: usize) -> Received {
    let mut buffer = vec![0; size.max(1)];
    loop {
        match (&*stream).read(&mut buffer) {
            Ok(0) => return Received::Disconnected,
            Ok(n) => {
                buffer.truncate(n);
                return Received::Data(buffer);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Received::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Received::Aborted(format!("error while receiving: {e}")),
        }
    }
}

/// Write all of `data`, looping on partial writes.
///
/// When the socket buffer is full the call parks on a private poller for up
/// to `wait` at a time until the socket is writable again. The error string
/// describes the abnormal disconnect.
pub fn send_all(stream: &TcpStream, data: &[u8], wait: Duration) -> Result<(), String> {
    let mut sent = 0;
    let mut writable: Option<(Poll, Events)> = None;

    while sent < data.len() {
        match (&*stream).write(&data[sent..]) {
            Ok(0) => return Err("sent zero bytes".to_string()),
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if writable.is_none() {
                    writable = Some(writable_poller(stream).map_err(|e| {
                        format!("error while waiting for send buffer: {e}")
                    })?);
                }
                if let Some((poll, events)) = writable.as_mut() {
                    match poll.poll(events, Some(wait)) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(format!("error while waiting for send buffer: {e}")),
                    }
                }
            }
            Err(e) => return Err(format!("error while sending: {e}")),
        }
    }
    Ok(())
}

fn writable_poller(stream: &TcpStream) -> io::Result<(Poll, Events)> {
    let poll = Poll::new()?;
    poll.registry().register(
        &mut SourceFd(&stream.as_raw_fd()),
        Token(0),
        Interest::WRITABLE,
    )?;
    Ok((poll, Events::with_capacity(1)))
}
