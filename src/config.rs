use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    error::{Error, Result},
    io::DEFAULT_RECEIVE_SIZE,
    policy::Execution,
    thread_pool::default_capacity,
};

/// Configuration for [`TcpServer`](crate::TcpServer).
///
/// Controls where the server listens, how long its background stages block
/// before re-checking the stop flag, and the initial callback-threading
/// policy. Use [`ServerConfig::builder()`] for ergonomic construction, or
/// deserialize it from any serde format.
///
/// ## Timing
///
/// - `poll_timeout`: upper bound for every readiness wait and admission queue
///   pop. `stop()` returns at most about one interval after it is called.
///
/// ## Callback threading
///
/// - `hook_execution`: where the seven hooks run until changed at runtime
/// - `receive_dispatch`: where the per-connection receive dispatch runs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: IpAddr,
    /// Port to bind to, 0 picks an ephemeral port
    pub port: u16,
    /// Listen backlog
    pub backlog: u32,
    /// Bound for all blocking waits in the background stages
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,
    /// Read size used by the receive dispatch
    pub receive_buffer_size: usize,
    /// Initial execution of the seven hooks
    pub hook_execution: Execution,
    /// Initial execution of the receive dispatch
    pub receive_dispatch: Execution,
    /// Worker threads used by [`Execution::Pool`]
    pub pool_workers: usize,
    /// Arm new connections for reads right after `on_connect`
    pub auto_register: bool,
    /// Maximum number of live connections
    pub max_connections: Option<usize>,
    /// Enable TCP_NODELAY on admitted connections
    pub no_delay: bool,
}

impl ServerConfig {
    /// Create a new builder for ServerConfig
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backlog == 0 {
            return Err(Error::Configuration("backlog must be positive".into()));
        }
        if self.poll_timeout.is_zero() {
            return Err(Error::Configuration(
                "poll_timeout must be positive".into(),
            ));
        }
        if self.receive_buffer_size == 0 {
            return Err(Error::Configuration(
                "receive_buffer_size must be positive".into(),
            ));
        }
        if self.pool_workers == 0 {
            return Err(Error::Configuration(
                "pool_workers must be positive".into(),
            ));
        }
        if self.max_connections == Some(0) {
            return Err(Error::Configuration(
                "max_connections must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 1234,
            backlog: 1000,
            poll_timeout: Duration::from_millis(100),
            receive_buffer_size: DEFAULT_RECEIVE_SIZE,
            hook_execution: Execution::Inline,
            receive_dispatch: Execution::Thread,
            pool_workers: default_capacity(),
            auto_register: false,
            max_connections: None,
            no_delay: true,
        }
    }
}

/// Builder for ServerConfig.
///
/// Unset fields fall back to [`ServerConfig::default()`].
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: IpAddr) -> Self {
        self.config.host = host;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set host and port at once
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.config.host = address.ip();
        self.config.port = address.port();
        self
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.config.backlog = backlog;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout = timeout;
        self
    }

    pub fn receive_buffer_size(mut self, size: usize) -> Self {
        self.config.receive_buffer_size = size;
        self
    }

    pub fn hook_execution(mut self, execution: Execution) -> Self {
        self.config.hook_execution = execution;
        self
    }

    pub fn receive_dispatch(mut self, execution: Execution) -> Self {
        self.config.receive_dispatch = execution;
        self
    }

    pub fn pool_workers(mut self, workers: usize) -> Self {
        self.config.pool_workers = workers;
        self
    }

    pub fn auto_register(mut self, enabled: bool) -> Self {
        self.config.auto_register = enabled;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = Some(max);
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.config.no_delay = enabled;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}
