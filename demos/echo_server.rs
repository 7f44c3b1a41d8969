use mill_server::{error::Result, prelude::*};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Echoes every chunk back to the client that sent it.
#[derive(Clone, Default)]
struct EchoHandler;

impl ServerHandler for EchoHandler {
    fn on_start(&self, server: &TcpServer) -> Result<()> {
        if let Some(address) = server.local_addr() {
            info!(%address, "echo server listening");
        }
        Ok(())
    }

    /// arm the new connection, otherwise it is never read from
    fn on_connect(&self, server: &TcpServer, conn: ConnectionId) -> Result<()> {
        info!(%conn, peer = %server.peer_address(conn)?, "client connected");
        server.register(conn, false)
    }

    fn on_receive(&self, server: &TcpServer, conn: ConnectionId, data: &[u8]) -> Result<()> {
        info!(
            %conn,
            bytes = data.len(),
            message = %String::from_utf8_lossy(data).trim_end(),
            "received"
        );
        server.send(conn, data, true)?;
        // each registration is good for one receive
        server.register(conn, true)
    }

    fn on_disconnect(&self, _server: &TcpServer, conn: ConnectionId) -> Result<()> {
        info!(%conn, "client disconnected");
        Ok(())
    }

    fn on_abnormal_disconnect(
        &self,
        _server: &TcpServer,
        conn: ConnectionId,
        message: &str,
    ) -> Result<()> {
        info!(%conn, message, "client dropped");
        Ok(())
    }

    fn on_stop(&self, _server: &TcpServer, reason: &str) -> Result<()> {
        info!(reason, "echo server stopped");
        Ok(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ServerConfig::builder()
        .address("127.0.0.1:8080".parse().unwrap())
        .build();

    let server = TcpServer::new(config, EchoHandler)?;
    server.start()?;

    // blocks until something calls stop()
    server.wait()
}
