use std::io;

use thiserror::Error;

use crate::registry::ConnectionId;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised synchronously to callers of the server API.
///
/// Would-block and disconnect conditions met while dispatching reads are not
/// represented here; they are turned into hook invocations instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),

    #[error("Accept Error: {0}")]
    Accept(io::Error),

    #[error("server can only be started once")]
    AlreadyStarted,

    #[error("server has not been started yet")]
    NotStarted,

    #[error("server is already stopping or stopped")]
    AlreadyStopped,

    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),

    #[error("connection {0} is not registered")]
    NotRegistered(ConnectionId),

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("connection {conn} disconnected abnormally: {message}")]
    AbnormalDisconnect { conn: ConnectionId, message: String },

    #[error("Configuration Error: {0}")]
    Configuration(String),

    #[error("Handler Error: {0}")]
    Handler(String),

    #[error("stage fault: {0}")]
    StageFault(String),
}

impl Error {
    /// Usage errors are the caller's fault and leave the server untouched.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Error::AlreadyStarted
                | Error::NotStarted
                | Error::AlreadyStopped
                | Error::AlreadyRegistered(_)
                | Error::NotRegistered(_)
                | Error::UnknownConnection(_)
        )
    }
}
