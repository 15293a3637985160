//! Connection manager backed by one object pool per identity and kind
//!
//! No execution-context affinity here: any caller may get any idle handle of
//! the right identity and kind. Handles go back to their pool when the
//! [`PooledConnection`] guard is dropped.

use crate::config::ManagerConfiguration;
use crate::connection::{ConnectionHandle, ConnectionKind, is_usable};
use crate::context::ExecutionContextId;
use crate::errors::{ConnectionError, ConnectionResult};
use crate::factory::ConnectionFactory;
use crate::identity::ConnectionIdentity;
use crate::manager::{ConnectionManager, ManagerKind};
use crate::monitor::{ConnectionMonitor, MonitorTarget};
use crate::observer::{InspectObserver, LogObserver, ManagerOperation, Observer};
use crate::pool::{ObjectPool, PooledObject, PooledObjectFactory};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// A borrowed handle that returns to its pool on drop
pub type PooledConnection = PooledObject<Arc<dyn ConnectionHandle>>;

type HandlePool = ObjectPool<Arc<dyn ConnectionHandle>>;

/// Which pool a handle belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub identity: ConnectionIdentity,
    pub kind: ConnectionKind,
}

/// Counts for one pool
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolStatistics {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub kind: ConnectionKind,
    pub idle: usize,
    pub active: usize,
    pub max: usize,
}

/// Opens, checks and closes handles for one pool
struct HandlePoolFactory {
    identity: ConnectionIdentity,
    kind: ConnectionKind,
    factory: Arc<ConnectionFactory>,
    connect_timeout: Duration,
}

impl PooledObjectFactory<Arc<dyn ConnectionHandle>> for HandlePoolFactory {
    fn create(&self) -> ConnectionResult<Arc<dyn ConnectionHandle>> {
        self.factory.create(&self.identity, self.kind, self.connect_timeout)
    }

    fn validate(&self, handle: &Arc<dyn ConnectionHandle>) -> bool {
        is_usable(handle)
    }

    fn destroy(&self, handle: Arc<dyn ConnectionHandle>) {
        if let Err(e) = handle.disconnect() {
            error!(identity = %self.identity, kind = %self.kind, error = %e, "failed to disconnect pooled connection");
        }
    }
}

/// Every pool of a pooled manager
#[derive(Default)]
pub struct PoolDirectory {
    pools: DashMap<PoolKey, Arc<HandlePool>>,
}

impl std::fmt::Debug for PoolDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolDirectory")
            .field("pools", &self.pools.len())
            .finish()
    }
}

impl PoolDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    fn get(&self, key: &PoolKey) -> Option<Arc<HandlePool>> {
        self.pools.get(key).map(|pool| Arc::clone(pool.value()))
    }

    fn get_or_insert_with(&self, key: PoolKey, make: impl FnOnce(&PoolKey) -> HandlePool) -> Arc<HandlePool> {
        if let Some(pool) = self.get(&key) {
            return pool;
        }
        let pool = self
            .pools
            .entry(key.clone())
            .or_insert_with(|| Arc::new(make(&key)));
        Arc::clone(pool.value())
    }

    fn pools(&self) -> Vec<(PoolKey, Arc<HandlePool>)> {
        self.pools
            .iter()
            .map(|item| (item.key().clone(), Arc::clone(item.value())))
            .collect()
    }

    /// Remove and close every pool of `identity`, returning how many idle handles were destroyed
    pub fn close_identity(&self, identity: &ConnectionIdentity) -> usize {
        let keys: Vec<PoolKey> = self
            .pools
            .iter()
            .filter(|item| &item.key().identity == identity)
            .map(|item| item.key().clone())
            .collect();

        let mut destroyed = 0;
        for key in keys {
            if let Some((_, pool)) = self.pools.remove(&key) {
                destroyed += pool.close();
            }
        }
        destroyed
    }

    /// Remove and close every pool
    pub fn close_all(&self) -> usize {
        let mut destroyed = 0;
        for (key, _) in self.pools() {
            if let Some((_, pool)) = self.pools.remove(&key) {
                destroyed += pool.close();
            }
        }
        destroyed
    }

    /// Destroy stale idle handles in every pool
    pub fn evict_idle(&self) -> usize {
        let evicted: usize = self.pools().iter().map(|(_, pool)| pool.evict_idle()).sum();
        if evicted > 0 {
            debug!(evicted, "evicted idle pooled connections");
        }
        evicted
    }

    pub fn statistics(&self) -> Vec<PoolStatistics> {
        self.pools()
            .iter()
            .map(|(key, pool)| Self::statistics_of(key, pool))
            .collect()
    }

    pub fn statistics_for(&self, identity: &ConnectionIdentity) -> Vec<PoolStatistics> {
        self.pools()
            .iter()
            .filter(|(key, _)| &key.identity == identity)
            .map(|(key, pool)| Self::statistics_of(key, pool))
            .collect()
    }

    fn statistics_of(key: &PoolKey, pool: &HandlePool) -> PoolStatistics {
        PoolStatistics {
            host: key.identity.host.clone(),
            port: key.identity.port,
            username: key.identity.username.clone(),
            kind: key.kind,
            idle: pool.idle_count(),
            active: pool.active_count(),
            max: pool.max_size(),
        }
    }
}

/// Manager that hands out pooled handles, shared by every caller.
///
/// `borrow_connection` blocks for up to the configured
/// [`borrow_max_wait`](ManagerConfiguration::borrow_max_wait) when the pool for
/// that identity and kind is exhausted.
pub struct PooledConnectionManager {
    directory: Arc<PoolDirectory>,
    factory: Arc<ConnectionFactory>,
    config: Arc<ManagerConfiguration>,
    monitor: ConnectionMonitor,
}

impl PooledConnectionManager {
    pub fn new(factory: ConnectionFactory, config: ManagerConfiguration) -> Self {
        let directory = Arc::new(PoolDirectory::new());
        let monitor = ConnectionMonitor::new(
            MonitorTarget::Pooled(Arc::clone(&directory)),
            config.schedule_period,
        );
        monitor.attach(Arc::new(LogObserver::new()));
        monitor.attach(Arc::new(InspectObserver::for_pools()));
        if config.auto_inspect {
            monitor.set_auto_inspect(true);
        }

        Self {
            directory,
            factory: Arc::new(factory),
            config: Arc::new(config),
            monitor,
        }
    }

    pub fn directory(&self) -> &PoolDirectory {
        &self.directory
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub fn configuration(&self) -> &ManagerConfiguration {
        &self.config
    }

    fn pool(&self, identity: &ConnectionIdentity, kind: ConnectionKind) -> ConnectionResult<Arc<HandlePool>> {
        if !self.factory.supports(kind) {
            error!(%kind, "connection kind is not supported");
            return Err(ConnectionError::UnsupportedProtocol(kind));
        }

        let key = PoolKey {
            identity: identity.clone(),
            kind,
        };
        Ok(self.directory.get_or_insert_with(key, |key| {
            let callbacks = HandlePoolFactory {
                identity: key.identity.clone(),
                kind: key.kind,
                factory: Arc::clone(&self.factory),
                connect_timeout: self.config.connect_timeout,
            };
            debug!(identity = %key.identity, kind = %key.kind, "created connection pool");
            ObjectPool::new(
                format!("{}/{}", key.identity, key.kind),
                Arc::new(callbacks),
                self.config.pool_configuration(),
            )
        }))
    }

    /// Borrow a handle asynchronously, waiting up to `borrow_max_wait` for one to free up
    pub async fn borrow_connection_async(
        &self,
        identity: &ConnectionIdentity,
        kind: ConnectionKind,
    ) -> ConnectionResult<PooledConnection> {
        self.monitor
            .notify(ManagerOperation::Borrow, identity, ExecutionContextId::current());
        let pool = self.pool(identity, kind)?;
        pool.borrow_async(self.config.borrow_max_wait).await
    }

    /// Stop the scheduler and close every pool
    pub fn shutdown(&self) {
        self.monitor.stop();
        let destroyed = self.directory.close_all();
        info!(destroyed, "pooled connection manager shut down");
    }
}

impl ConnectionManager for PooledConnectionManager {
    type Connection = PooledConnection;

    fn kind(&self) -> ManagerKind {
        ManagerKind::Pooled
    }

    fn borrow_connection(
        &self,
        identity: &ConnectionIdentity,
        kind: ConnectionKind,
    ) -> ConnectionResult<PooledConnection> {
        self.monitor
            .notify(ManagerOperation::Borrow, identity, ExecutionContextId::current());
        let pool = self.pool(identity, kind)?;
        pool.borrow(self.config.borrow_max_wait)
    }

    /// Handles return to their pool when the guard drops; nothing to do here
    fn release_connection(&self, identity: &ConnectionIdentity) {
        let context = ExecutionContextId::current();
        self.monitor.notify(ManagerOperation::Release, identity, context);
        info!(%identity, %context, "pooled connections are released by dropping them");
    }

    fn close_connection(&self, identity: &ConnectionIdentity) {
        let context = ExecutionContextId::current();
        self.monitor.notify(ManagerOperation::Close, identity, context);
        let destroyed = self.directory.close_identity(identity);
        info!(%identity, %context, destroyed, "closed connection pools");
    }

    fn inspect(&self) {
        self.monitor.tick();
    }

    fn attach(&self, observer: Arc<dyn Observer>) {
        self.monitor.attach(observer);
    }
}

impl Drop for PooledConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
