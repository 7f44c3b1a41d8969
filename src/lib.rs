//! # Mill-Server
//! An event-driven TCP server engine built on [`mio`] readiness polling and plain OS threads,
//! without an async runtime.
//!
//! The engine owns the listening socket, non-blocking I/O, connection lifecycle and shutdown.
//! Applications plug in behavior by implementing the [`ServerHandler`] hooks.
//!
//! ## Architecture Overview
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌────────────┐   ┌──────────┐   ┌──────────────┐
//! │ Acceptor │──▶│ admission │──▶│ Admission  │──▶│ Registry │   │ Dispatch     │
//! │ (poller) │   │ queue     │   │ on_connect │   └────┬─────┘   │ loop         │
//! └──────────┘   └───────────┘   └────────────┘        │         └──────┬───────┘
//!                                                       │ register()     │ one-shot
//!                                                       ▼                ▼
//!                                                  ┌──────────────────────────┐
//!                                                  │ Selector (mio, pluggable)│
//!                                                  └──────────────────────────┘
//! ```
//!
//! Connections are **not** read from until armed with [`TcpServer::register`], and each
//! readiness notification disarms the connection before its receive dispatch runs. A
//! connection therefore has at most one receive dispatch in flight, and must be re-armed
//! to keep receiving.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_server::{prelude::*, error::Result};
//!
//! struct Echo;
//!
//! impl ServerHandler for Echo {
//!     fn on_connect(&self, server: &TcpServer, conn: ConnectionId) -> Result<()> {
//!         server.register(conn, false)
//!     }
//!
//!     fn on_receive(&self, server: &TcpServer, conn: ConnectionId, data: &[u8]) -> Result<()> {
//!         server.send(conn, data, true)?;
//!         server.register(conn, true)
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let config = ServerConfig::builder()
//!         .address("127.0.0.1:8080".parse().unwrap())
//!         .build();
//!     let server = TcpServer::new(config, Echo)?;
//!     server.start()?;
//!     server.wait()
//! }
//! ```
//!
//! - [`TcpServer`]: lifecycle, connection operations and threading policy
//! - [`ServerHandler`]: the seven hooks
//! - [`policy`]: where each hook and the receive dispatch run
//! - [`poll`]: the pluggable readiness multiplexer
//! - [`io`]: stateless non-blocking send and receive primitives
//! - [`error`]: error types and result handling

#![cfg(unix)]

pub mod config;
pub mod error;
pub mod handler;
pub mod io;
pub mod poll;
pub mod policy;
mod registry;
pub mod server;
pub mod thread_pool;

pub use config::{ServerConfig, ServerConfigBuilder};
pub use handler::{NoOpHandler, ServerHandler};
pub use io::Received;
pub use poll::{PollSelector, Selector};
pub use policy::{Callback, Execution, PolicyTarget};
pub use registry::ConnectionId;
pub use server::{DisconnectReason, Target, TcpServer};

/// Commonly used types.
///
/// ```rust
/// use mill_server::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::ServerConfig;
    pub use crate::handler::ServerHandler;
    pub use crate::policy::{Callback, Execution};
    pub use crate::registry::ConnectionId;
    pub use crate::server::{DisconnectReason, Target, TcpServer};
}
