//! Construction of connection handles by kind

use crate::connection::{ConnectionHandle, ConnectionKind};
use crate::errors::{ConnectionError, ConnectionResult};
use crate::identity::ConnectionIdentity;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Builds an unconnected handle
pub type HandleConstructor = Arc<dyn Fn() -> Arc<dyn ConnectionHandle> + Send + Sync>;

/// Maps each supported [`ConnectionKind`] to the constructor of its handle.
///
/// Kinds without a registered constructor are rejected with
/// [`ConnectionError::UnsupportedProtocol`].
#[derive(Clone, Default)]
pub struct ConnectionFactory {
    constructors: HashMap<ConnectionKind, HandleConstructor>,
}

impl ConnectionFactory {
    /// Create a factory with no supported kinds
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the constructor for `kind`, replacing any previous one
    pub fn with_constructor<F>(mut self, kind: ConnectionKind, constructor: F) -> Self
    where
        F: Fn() -> Arc<dyn ConnectionHandle> + Send + Sync + 'static,
    {
        self.register(kind, constructor);
        self
    }

    pub fn register<F>(&mut self, kind: ConnectionKind, constructor: F)
    where
        F: Fn() -> Arc<dyn ConnectionHandle> + Send + Sync + 'static,
    {
        self.constructors.insert(kind, Arc::new(constructor));
    }

    pub fn supports(&self, kind: ConnectionKind) -> bool {
        self.constructors.contains_key(&kind)
    }

    /// Construct a handle for `kind` and connect it to `identity`
    pub fn create(
        &self,
        identity: &ConnectionIdentity,
        kind: ConnectionKind,
        connect_timeout: Duration,
    ) -> ConnectionResult<Arc<dyn ConnectionHandle>> {
        let constructor = self.constructors.get(&kind).ok_or_else(|| {
            error!(%kind, "connection kind is not supported");
            ConnectionError::UnsupportedProtocol(kind)
        })?;

        let handle = constructor();
        handle.connect(identity, connect_timeout)?;
        debug!(host = %identity.host, port = identity.port, %kind, "opened connection");
        Ok(handle)
    }
}
