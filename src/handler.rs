use crate::{error::Result, registry::ConnectionId, server::TcpServer};

/// Application behavior plugged into a [`TcpServer`].
///
/// Every hook defaults to a no-op, so implement only what you need. Where a
/// hook runs (inline on an engine thread, on a fresh thread, or on the worker
/// pool) is decided per hook by the server's threading policy, so
/// implementations must be thread-safe.
///
/// Each hook receives the server so it can send, register, or disconnect.
/// A hook that returns an error is logged and reported through
/// [`on_warning`](ServerHandler::on_warning); it never stops the server.
///
/// ## Reading data
///
/// New connections are not armed for reads. Call
/// [`TcpServer::register`] (typically from `on_connect`) to receive the first
/// `on_receive`, and again after each one to keep receiving.
pub trait ServerHandler: Send + Sync + 'static {
    /// Called once the server is listening
    fn on_start(&self, server: &TcpServer) -> Result<()> {
        let _ = server;
        Ok(())
    }

    /// Called after the server has fully stopped. `reason` is empty for a
    /// caller-initiated stop.
    fn on_stop(&self, server: &TcpServer, reason: &str) -> Result<()> {
        let _ = (server, reason);
        Ok(())
    }

    /// Called with the bytes of one read
    fn on_receive(&self, server: &TcpServer, conn: ConnectionId, data: &[u8]) -> Result<()> {
        let _ = (server, conn, data);
        Ok(())
    }

    /// Called when a connection has been admitted
    fn on_connect(&self, server: &TcpServer, conn: ConnectionId) -> Result<()> {
        let _ = (server, conn);
        Ok(())
    }

    /// Called when a connection closed normally
    fn on_disconnect(&self, server: &TcpServer, conn: ConnectionId) -> Result<()> {
        let _ = (server, conn);
        Ok(())
    }

    /// Called when a connection broke
    fn on_abnormal_disconnect(
        &self,
        server: &TcpServer,
        conn: ConnectionId,
        message: &str,
    ) -> Result<()> {
        let _ = (server, conn, message);
        Ok(())
    }

    /// Called for conditions worth reporting that do not affect the server
    fn on_warning(&self, server: &TcpServer, message: &str) -> Result<()> {
        let _ = (server, message);
        Ok(())
    }
}

/// Handler that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHandler;

impl ServerHandler for NoOpHandler {}
