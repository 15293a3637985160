//! Error types for the connection manager

use crate::connection::ConnectionKind;
use crate::context::ExecutionContextId;
use crate::identity::ConnectionIdentity;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("Too many connections for {identity} (context {context}): {current} registered, limit is {max}")]
    ConnectionLimitExceeded {
        identity: ConnectionIdentity,
        context: ExecutionContextId,
        current: usize,
        max: usize,
    },

    #[error("The connection for {identity} is already borrowed by context {context}")]
    AlreadyBorrowed {
        identity: ConnectionIdentity,
        context: ExecutionContextId,
    },

    #[error("Connection kind {0} is not supported")]
    UnsupportedProtocol(ConnectionKind),

    #[error("Failed to connect to {identity}: {reason}")]
    ConnectFailure {
        identity: ConnectionIdentity,
        reason: String,
    },

    #[error("Failed to disconnect: {0}")]
    DisconnectFailure(String),

    #[error("Timed out after {0:?} waiting for a pooled connection")]
    Timeout(std::time::Duration),

    #[error("The connection pool {0} is closed")]
    PoolClosed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;
