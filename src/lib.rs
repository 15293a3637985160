//! # Esox Connection Manager
//!
//! Reuse of expensive SSH/SFTP-style connections across calls from the same
//! worker, with idle and abandoned connections reclaimed in the background.
//!
//! ## Features
//!
//! - One connection per identity and execution context, reused on every borrow
//! - Idle connections of other contexts are taken over before opening new ones
//! - Per-identity connection limit
//! - Borrow timeout (forced release) and idle timeout (forced close)
//! - Per-call inspection of the caller's own slot plus a scheduled sweep
//! - Pluggable observers for every borrow, release and close
//! - A pooled variant with blocking and async borrows
//! - Health status, metrics and Prometheus export
//!
//! ## Quick Start
//!
//! ```rust
//! use esox_connection_manager::{
//!     BasicConnectionManager, ConnectionFactory, ConnectionHandle, ConnectionIdentity,
//!     ConnectionKind, ConnectionManager, ConnectionResult, ManagerConfiguration,
//! };
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::time::Duration;
//!
//! #[derive(Default)]
//! struct Loopback(AtomicBool);
//!
//! impl ConnectionHandle for Loopback {
//!     fn kind(&self) -> ConnectionKind { ConnectionKind::Sftp }
//!     fn connect(&self, _: &ConnectionIdentity, _: Duration) -> ConnectionResult<()> {
//!         self.0.store(true, Ordering::SeqCst);
//!         Ok(())
//!     }
//!     fn disconnect(&self) -> ConnectionResult<()> {
//!         self.0.store(false, Ordering::SeqCst);
//!         Ok(())
//!     }
//!     fn is_valid(&self) -> bool { self.0.load(Ordering::SeqCst) }
//!     fn is_closed(&self) -> bool { !self.0.load(Ordering::SeqCst) }
//! }
//!
//! let factory = ConnectionFactory::new()
//!     .with_constructor(ConnectionKind::Sftp, || Arc::new(Loopback::default()) as Arc<dyn ConnectionHandle>);
//! let manager = BasicConnectionManager::new(factory, ManagerConfiguration::default());
//! let identity = ConnectionIdentity::new("127.0.0.1", 2222, "test", "test");
//!
//! let first = manager.borrow_connection(&identity, ConnectionKind::Sftp).unwrap();
//! manager.release_connection(&identity);
//! let again = manager.borrow_connection(&identity, ConnectionKind::Sftp).unwrap();
//! assert!(Arc::ptr_eq(&first, &again));
//! ```

mod config;
mod connection;
mod context;
mod errors;
mod eviction;
mod factory;
mod health;
mod identity;
mod manager;
mod metrics;
mod monitor;
mod observer;
mod pool;
mod pooled;
mod registry;
mod scheduler;
mod slot;

#[cfg(test)]
mod mock;

pub use config::{ManagerConfiguration, PoolConfiguration};
pub use connection::{ConnectionHandle, ConnectionKind};
pub use context::ExecutionContextId;
pub use errors::{ConnectionError, ConnectionResult};
pub use eviction::{EvictionEngine, EvictionPolicy, SlotVerdict, SweepReport};
pub use factory::{ConnectionFactory, HandleConstructor};
pub use health::HealthStatus;
pub use identity::ConnectionIdentity;
pub use manager::{BasicConnectionManager, BorrowStatus, ConnectionManager, ManagerKind};
pub use metrics::ManagerMetrics;
#[cfg(feature = "prometheus")]
pub use metrics::MetricsExporter;
pub use monitor::{ConnectionMonitor, MonitorTarget};
pub use observer::{InspectObserver, LogObserver, ManagerEvent, ManagerOperation, ManagerView, Observer};
pub use pool::{ObjectPool, PooledObject, PooledObjectFactory};
pub use pooled::{PoolDirectory, PoolKey, PoolStatistics, PooledConnection, PooledConnectionManager};
pub use registry::{IdentityEntry, IdentityStatistics, Registry};
pub use slot::ConnectionSlot;
