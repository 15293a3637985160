//! The connection capability supplied by protocol implementations

use crate::errors::ConnectionResult;
use crate::identity::ConnectionIdentity;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Closed set of connection kinds a factory can be asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ConnectionKind {
    /// SFTP channel over an SSH session
    Sftp,

    /// Interactive shell channel over an SSH session
    Shell,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Sftp => f.write_str("sftp"),
            ConnectionKind::Shell => f.write_str("shell"),
        }
    }
}

/// A live handle to a remote session.
///
/// The manager only ever talks to connections through this trait. Methods take
/// `&self` because a handle is shared between the registry and its borrower;
/// implementations keep their session state behind their own synchronization.
pub trait ConnectionHandle: Send + Sync {
    /// The kind of channel this handle carries
    fn kind(&self) -> ConnectionKind;

    /// Open the underlying session
    fn connect(&self, identity: &ConnectionIdentity, timeout: Duration) -> ConnectionResult<()>;

    /// Close the underlying session
    fn disconnect(&self) -> ConnectionResult<()>;

    /// Whether the session is still usable
    fn is_valid(&self) -> bool;

    /// Whether the session has been closed
    fn is_closed(&self) -> bool;
}

/// A handle is usable when it is valid and not closed
pub(crate) fn is_usable(handle: &Arc<dyn ConnectionHandle>) -> bool {
    handle.is_valid() && !handle.is_closed()
}
