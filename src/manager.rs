//! Context-affine connection manager
//!
//! Every execution context owns at most one slot per identity. A borrow walks
//! [`BorrowStatus`] from `Init` until it either hands out a handle or fails:
//! the caller's own idle slot first, then any other context's idle slot of the
//! right kind, and only then a new connection.

use crate::config::ManagerConfiguration;
use crate::connection::{ConnectionHandle, ConnectionKind};
use crate::context::ExecutionContextId;
use crate::errors::{ConnectionError, ConnectionResult};
use crate::eviction::{EvictionEngine, EvictionPolicy, SweepReport};
use crate::factory::ConnectionFactory;
use crate::health::HealthStatus;
use crate::identity::ConnectionIdentity;
use crate::metrics::{ManagerMetrics, MetricsTracker};
use crate::monitor::{ConnectionMonitor, MonitorTarget};
use crate::observer::{InspectObserver, LogObserver, ManagerOperation, Observer};
use crate::registry::{IdentityEntry, Registry, SlotReservation};
use crate::slot::ConnectionSlot;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

#[cfg(feature = "prometheus")]
use crate::metrics::MetricsExporter;

/// The two manager flavours observers can tell apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerKind {
    /// Context-affine slots, see [`BasicConnectionManager`]
    Basic,

    /// Shared pools, see [`PooledConnectionManager`](crate::PooledConnectionManager)
    Pooled,
}

/// States of one borrow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorrowStatus {
    Init,
    NoConnection,
    ThreadHasConnection,
    ThreadHasNoConnection,
    OtherThreadHasConnection,
    NeedNewConnection,
    OverLimit,
    Final,
}

/// Borrow, release and close connections by identity.
///
/// Every call is announced to the manager's observers before it runs.
pub trait ConnectionManager: Send + Sync {
    type Connection;

    fn kind(&self) -> ManagerKind;

    fn borrow_connection(
        &self,
        identity: &ConnectionIdentity,
        kind: ConnectionKind,
    ) -> ConnectionResult<Self::Connection>;

    /// Give the caller's connection back without closing it
    fn release_connection(&self, identity: &ConnectionIdentity);

    /// Disconnect and forget the caller's connection
    fn close_connection(&self, identity: &ConnectionIdentity);

    /// Run one scheduled inspection now
    fn inspect(&self);

    fn attach(&self, observer: Arc<dyn Observer>);
}

/// Manager that keeps one connection per identity and execution context.
///
/// # Examples
///
/// ```no_run
/// use esox_connection_manager::{
///     BasicConnectionManager, ConnectionFactory, ConnectionIdentity, ConnectionKind,
///     ConnectionManager, ManagerConfiguration,
/// };
///
/// # fn sftp_factory() -> ConnectionFactory { ConnectionFactory::new() }
/// let manager = BasicConnectionManager::new(sftp_factory(), ManagerConfiguration::default());
/// let identity = ConnectionIdentity::new("10.0.0.5", 22, "deploy", "secret");
///
/// let handle = manager.borrow_connection(&identity, ConnectionKind::Sftp)?;
/// assert!(handle.is_valid());
/// manager.release_connection(&identity);
/// # Ok::<(), esox_connection_manager::ConnectionError>(())
/// ```
pub struct BasicConnectionManager {
    registry: Arc<Registry>,
    factory: ConnectionFactory,
    engine: EvictionEngine,
    monitor: ConnectionMonitor,
    config: ManagerConfiguration,
    metrics: Arc<MetricsTracker>,
}

impl BasicConnectionManager {
    /// Build a manager with the log and inspect observers attached, starting
    /// the scheduled inspection when `auto_inspect` is set.
    pub fn new(factory: ConnectionFactory, config: ManagerConfiguration) -> Self {
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(MetricsTracker::new());
        let engine = EvictionEngine::new(EvictionPolicy::from_config(&config), Arc::clone(&metrics));
        let monitor = ConnectionMonitor::new(
            MonitorTarget::Basic(Arc::clone(&registry)),
            config.schedule_period,
        );
        monitor.attach(Arc::new(LogObserver::new()));
        monitor.attach(Arc::new(InspectObserver::new(engine.clone())));
        if config.auto_inspect {
            monitor.set_auto_inspect(true);
        }

        Self {
            registry,
            factory,
            engine,
            monitor,
            config,
            metrics,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub fn configuration(&self) -> &ManagerConfiguration {
        &self.config
    }

    pub fn set_auto_inspect(&self, enabled: bool) {
        self.monitor.set_auto_inspect(enabled);
    }

    /// Borrow on behalf of `context` instead of the calling thread
    pub fn borrow_connection_for(
        &self,
        context: ExecutionContextId,
        identity: &ConnectionIdentity,
        kind: ConnectionKind,
    ) -> ConnectionResult<Arc<dyn ConnectionHandle>> {
        self.monitor.notify(ManagerOperation::Borrow, identity, context);

        let mut entry: Option<Arc<IdentityEntry>> = None;
        let mut status = BorrowStatus::Init;
        loop {
            status = match status {
                BorrowStatus::Init => match self.registry.get(identity) {
                    None => BorrowStatus::NoConnection,
                    Some(found) => {
                        let has_slot = found.slot(context).is_some();
                        entry = Some(found);
                        if has_slot {
                            BorrowStatus::ThreadHasConnection
                        } else {
                            BorrowStatus::ThreadHasNoConnection
                        }
                    }
                },
                BorrowStatus::NoConnection => BorrowStatus::NeedNewConnection,
                BorrowStatus::ThreadHasConnection => {
                    let reused = match &entry {
                        Some(entry) => self.reuse(identity, entry, context, kind)?,
                        None => None,
                    };
                    match reused {
                        Some(handle) => return Ok(handle),
                        None => BorrowStatus::OtherThreadHasConnection,
                    }
                }
                BorrowStatus::ThreadHasNoConnection => BorrowStatus::OtherThreadHasConnection,
                BorrowStatus::OtherThreadHasConnection => {
                    let stolen = entry
                        .as_ref()
                        .and_then(|entry| self.steal(identity, entry, context, kind));
                    match stolen {
                        Some(handle) => return Ok(handle),
                        None => BorrowStatus::NeedNewConnection,
                    }
                }
                BorrowStatus::NeedNewConnection => {
                    match self.registry.reserve(identity, self.config.max_connection_size) {
                        Some(reservation) => return self.open(identity, context, kind, reservation),
                        None => BorrowStatus::OverLimit,
                    }
                }
                BorrowStatus::OverLimit => {
                    let current = self.registry.slot_count(identity);
                    MetricsTracker::increment(&self.metrics.over_limit_rejections);
                    error!(
                        %identity,
                        %context,
                        current,
                        max = self.config.max_connection_size,
                        "too many connections"
                    );
                    return Err(ConnectionError::ConnectionLimitExceeded {
                        identity: identity.clone(),
                        context,
                        current,
                        max: self.config.max_connection_size,
                    });
                }
                BorrowStatus::Final => {
                    return Err(ConnectionError::Internal(
                        "borrow finished without a connection".to_string(),
                    ));
                }
            };
        }
    }

    /// Release on behalf of `context`; `false` when it held nothing
    pub fn release_connection_for(&self, context: ExecutionContextId, identity: &ConnectionIdentity) -> bool {
        self.monitor.notify(ManagerOperation::Release, identity, context);

        let Some(slot) = self.registry.slot(identity, context) else {
            info!(%identity, %context, "no connection to release");
            return false;
        };
        let mut state = slot.lock();
        if !state.is_live_for(context) {
            info!(%identity, %context, "no connection to release");
            return false;
        }

        state.mark_idle(Instant::now());
        MetricsTracker::increment(&self.metrics.total_released);
        debug!(%identity, %context, "released connection");
        true
    }

    /// Close on behalf of `context`; `false` when it held nothing
    pub fn close_connection_for(&self, context: ExecutionContextId, identity: &ConnectionIdentity) -> bool {
        self.monitor.notify(ManagerOperation::Close, identity, context);

        let Some(entry) = self.registry.get(identity) else {
            info!(%identity, %context, "no connection to close");
            return false;
        };
        let Some(slot) = entry.slot(context) else {
            info!(%identity, %context, "no connection to close");
            return false;
        };
        let mut state = slot.lock();
        // A sweep may have closed it between the lookup and the lock.
        if !state.is_live_for(context) {
            info!(%identity, %context, "no connection to close");
            return false;
        }

        self.engine.close_locked(identity, &entry, &slot, &mut state);
        MetricsTracker::increment(&self.metrics.total_closed);
        true
    }

    /// Sweep every identity right away, bypassing the observers
    pub fn sweep(&self) -> SweepReport {
        self.engine.sweep_all(&self.registry)
    }

    /// Disconnect and remove every slot of every identity
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for (identity, entry) in self.registry.drain() {
            let _sweep = entry.sweep_guard();
            for (context, slot) in entry.slots() {
                let mut state = slot.lock();
                if state.is_live_for(context) {
                    self.engine.close_locked(&identity, &entry, &slot, &mut state);
                    closed += 1;
                }
            }
        }
        info!(closed, "closed all connections");
        closed
    }

    /// Stop the scheduled inspection and close everything
    pub fn shutdown(&self) {
        self.monitor.stop();
        self.close_all();
    }

    pub fn get_health_status(&self) -> HealthStatus {
        HealthStatus::from_statistics(&self.registry.statistics(), self.config.max_connection_size)
    }

    pub fn get_metrics(&self) -> ManagerMetrics {
        let statistics = self.registry.statistics();
        let open = statistics.iter().map(|stats| stats.contexts).sum();
        let borrowed = statistics.iter().map(|stats| stats.borrowed).sum();
        self.metrics.get_metrics(statistics.len(), open, borrowed)
    }

    pub fn export_metrics(&self) -> HashMap<String, String> {
        self.get_metrics().export()
    }

    #[cfg(feature = "prometheus")]
    pub fn export_metrics_prometheus(
        &self,
        manager_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> Result<String, prometheus::Error> {
        MetricsExporter::export_prometheus(&self.get_metrics(), manager_name, tags)
    }

    /// The caller's own slot, if it is idle, usable and of `kind`.
    ///
    /// An unusable or mismatched own slot is closed so the walk can continue.
    fn reuse(
        &self,
        identity: &ConnectionIdentity,
        entry: &IdentityEntry,
        context: ExecutionContextId,
        kind: ConnectionKind,
    ) -> ConnectionResult<Option<Arc<dyn ConnectionHandle>>> {
        let Some(slot) = entry.slot(context) else {
            return Ok(None);
        };
        let mut state = slot.lock();
        if !state.is_live_for(context) {
            return Ok(None);
        }

        if !state.has_usable_handle() {
            debug!(%identity, %context, "own connection is no longer valid");
            self.engine.close_locked(identity, entry, &slot, &mut state);
            return Ok(None);
        }
        if state.borrowed {
            return Err(ConnectionError::AlreadyBorrowed {
                identity: identity.clone(),
                context,
            });
        }
        if !state.is_reassignable_to(kind) {
            debug!(%identity, %context, %kind, "own connection is of another kind");
            self.engine.close_locked(identity, entry, &slot, &mut state);
            return Ok(None);
        }

        state.mark_borrowed(Instant::now());
        MetricsTracker::increment(&self.metrics.total_reused);
        MetricsTracker::increment(&self.metrics.total_borrowed);
        debug!(%identity, %context, "reused own connection");
        Ok(state.handle.clone())
    }

    /// Move the first idle, usable slot of `kind` from another context to `context`
    fn steal(
        &self,
        identity: &ConnectionIdentity,
        entry: &IdentityEntry,
        context: ExecutionContextId,
        kind: ConnectionKind,
    ) -> Option<Arc<dyn ConnectionHandle>> {
        for (owner, slot) in entry.slots() {
            if owner == context {
                continue;
            }

            let mut state = slot.lock();
            if !state.is_live_for(owner) || !state.is_reassignable_to(kind) {
                continue;
            }
            let Some(previous) = entry.reassign(owner, context, &slot) else {
                continue;
            };

            state.owner = context;
            state.mark_borrowed(Instant::now());
            let handle = state.handle.clone();
            drop(state);

            if let Some(previous) = previous {
                self.discard(identity, entry, &previous);
            }
            MetricsTracker::increment(&self.metrics.total_stolen);
            MetricsTracker::increment(&self.metrics.total_borrowed);
            debug!(%identity, from = %owner, to = %context, "took over idle connection");
            return handle;
        }
        None
    }

    /// Open a new connection outside any slot lock and register it borrowed.
    ///
    /// `reservation` holds the connection's place under the limit while it
    /// opens; a failed connect gives it back.
    fn open(
        &self,
        identity: &ConnectionIdentity,
        context: ExecutionContextId,
        kind: ConnectionKind,
        reservation: SlotReservation,
    ) -> ConnectionResult<Arc<dyn ConnectionHandle>> {
        let handle = self.factory.create(identity, kind, self.config.connect_timeout)?;
        let slot = Arc::new(ConnectionSlot::borrowed_by(context, Arc::clone(&handle)));

        let entry = Arc::clone(reservation.entry());
        if let Some(previous) = reservation.commit(context, slot) {
            self.discard(identity, &entry, &previous);
        }
        MetricsTracker::increment(&self.metrics.total_created);
        MetricsTracker::increment(&self.metrics.total_borrowed);
        debug!(%identity, %context, %kind, "registered new connection");
        Ok(handle)
    }

    /// Close a slot that was displaced from its key
    fn discard(&self, identity: &ConnectionIdentity, entry: &IdentityEntry, slot: &Arc<ConnectionSlot>) {
        let mut state = slot.lock();
        if state.handle.is_some() {
            self.engine.close_locked(identity, entry, slot, &mut state);
        }
    }
}

impl ConnectionManager for BasicConnectionManager {
    type Connection = Arc<dyn ConnectionHandle>;

    fn kind(&self) -> ManagerKind {
        ManagerKind::Basic
    }

    fn borrow_connection(
        &self,
        identity: &ConnectionIdentity,
        kind: ConnectionKind,
    ) -> ConnectionResult<Arc<dyn ConnectionHandle>> {
        self.borrow_connection_for(ExecutionContextId::current(), identity, kind)
    }

    fn release_connection(&self, identity: &ConnectionIdentity) {
        self.release_connection_for(ExecutionContextId::current(), identity);
    }

    fn close_connection(&self, identity: &ConnectionIdentity) {
        self.close_connection_for(ExecutionContextId::current(), identity);
    }

    fn inspect(&self) {
        self.monitor.tick();
    }

    fn attach(&self, observer: Arc<dyn Observer>) {
        self.monitor.attach(observer);
    }
}

impl Drop for BasicConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, same_handle};
    use crossbeam::channel;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn identity() -> ConnectionIdentity {
        ConnectionIdentity::new("127.0.0.1", 2222, "test", "test")
    }

    fn config() -> ManagerConfiguration {
        ManagerConfiguration::new().with_auto_inspect(false)
    }

    fn manager(backend: &Arc<MockBackend>, config: ManagerConfiguration) -> BasicConnectionManager {
        BasicConnectionManager::new(backend.factory(), config)
    }

    #[test]
    fn test_release_then_borrow_reuses_handle() {
        let backend = MockBackend::new();
        let manager = manager(&backend, config());

        let first = manager.borrow_connection(&identity(), ConnectionKind::Sftp).unwrap();
        manager.release_connection(&identity());
        let second = manager.borrow_connection(&identity(), ConnectionKind::Sftp).unwrap();

        assert!(same_handle(&first, &second));
        assert_eq!(backend.created_count(), 1);
        assert_eq!(manager.get_metrics().total_reused, 1);
    }

    #[test]
    fn test_close_then_borrow_opens_new_handle() {
        let backend = MockBackend::new();
        let manager = manager(&backend, config());

        let first = manager.borrow_connection(&identity(), ConnectionKind::Sftp).unwrap();
        manager.close_connection(&identity());
        let second = manager.borrow_connection(&identity(), ConnectionKind::Sftp).unwrap();

        assert!(!same_handle(&first, &second));
        assert_eq!(backend.handle(0).disconnect_count(), 1);
        assert_eq!(manager.registry().slot_count(&identity()), 1);
    }

    #[test]
    fn test_limit_is_enforced_across_contexts() {
        let backend = MockBackend::new();
        let manager = manager(&backend, config().with_max_connection_size(1));
        let a = ExecutionContextId::allocate();
        let b = ExecutionContextId::allocate();

        manager.borrow_connection_for(a, &identity(), ConnectionKind::Sftp).unwrap();
        let result = manager.borrow_connection_for(b, &identity(), ConnectionKind::Sftp);

        match result {
            Err(ConnectionError::ConnectionLimitExceeded { context, current, max, .. }) => {
                assert_eq!(context, b);
                assert_eq!(current, 1);
                assert_eq!(max, 1);
            }
            other => panic!("expected limit error, got {:?}", other.map(|_| ())),
        }
        assert_eq!(manager.get_metrics().over_limit_rejections, 1);
    }

    #[test]
    fn test_double_borrow_is_rejected() {
        let backend = MockBackend::new();
        let manager = manager(&backend, config());

        manager.borrow_connection(&identity(), ConnectionKind::Sftp).unwrap();
        let result = manager.borrow_connection(&identity(), ConnectionKind::Sftp);

        assert!(matches!(result, Err(ConnectionError::AlreadyBorrowed { .. })));
        assert_eq!(backend.created_count(), 1);
    }

    #[test]
    fn test_idle_connection_moves_to_other_context() {
        let backend = MockBackend::new();
        let manager = manager(&backend, config().with_max_connection_size(8));
        let a = ExecutionContextId::allocate();
        let b = ExecutionContextId::allocate();

        let h1 = manager.borrow_connection_for(a, &identity(), ConnectionKind::Sftp).unwrap();
        assert!(manager.release_connection_for(a, &identity()));
        let taken = manager.borrow_connection_for(b, &identity(), ConnectionKind::Sftp).unwrap();

        assert!(same_handle(&h1, &taken));
        assert_eq!(backend.created_count(), 1);
        assert!(manager.registry().slot(&identity(), a).is_none());
        let slot = manager.registry().slot(&identity(), b).unwrap();
        assert_eq!(slot.owner(), b);
        assert!(slot.is_borrowed());
        assert_eq!(manager.get_metrics().total_stolen, 1);
    }

    #[test]
    fn test_idle_connection_moves_between_threads() {
        let backend = MockBackend::new();
        let manager = Arc::new(manager(&backend, config()));

        let first = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                let handle = manager.borrow_connection(&identity(), ConnectionKind::Sftp).unwrap();
                manager.release_connection(&identity());
                handle
            })
            .join()
            .unwrap()
        };
        let second = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || manager.borrow_connection(&identity(), ConnectionKind::Sftp).unwrap())
                .join()
                .unwrap()
        };

        assert!(same_handle(&first, &second));
        assert_eq!(backend.created_count(), 1);
    }

    #[test]
    fn test_borrowed_connection_is_not_taken() {
        let backend = MockBackend::new();
        let manager = manager(&backend, config());
        let a = ExecutionContextId::allocate();
        let b = ExecutionContextId::allocate();

        let held = manager.borrow_connection_for(a, &identity(), ConnectionKind::Sftp).unwrap();
        let other = manager.borrow_connection_for(b, &identity(), ConnectionKind::Sftp).unwrap();

        assert!(!same_handle(&held, &other));
        assert_eq!(manager.registry().slot_count(&identity()), 2);
    }

    #[test]
    fn test_other_kind_is_not_taken() {
        let backend = MockBackend::new();
        let manager = manager(&backend, config());
        let a = ExecutionContextId::allocate();
        let b = ExecutionContextId::allocate();

        manager.borrow_connection_for(a, &identity(), ConnectionKind::Shell).unwrap();
        manager.release_connection_for(a, &identity());
        let sftp = manager.borrow_connection_for(b, &identity(), ConnectionKind::Sftp).unwrap();

        assert_eq!(sftp.kind(), ConnectionKind::Sftp);
        assert_eq!(backend.created_count(), 2);
    }

    #[test]
    fn test_own_connection_of_other_kind_is_replaced() {
        let backend = MockBackend::new();
        let manager = manager(&backend, config());

        manager.borrow_connection(&identity(), ConnectionKind::Sftp).unwrap();
        manager.release_connection(&identity());
        let shell = manager.borrow_connection(&identity(), ConnectionKind::Shell).unwrap();

        assert_eq!(shell.kind(), ConnectionKind::Shell);
        assert_eq!(backend.handle(0).disconnect_count(), 1);
        assert_eq!(manager.registry().slot_count(&identity()), 1);
    }

    #[test]
    fn test_invalid_own_connection_is_replaced() {
        let backend = MockBackend::new();
        let manager = manager(&backend, config());

        let first = manager.borrow_connection(&identity(), ConnectionKind::Sftp).unwrap();
        manager.release_connection(&identity());
        backend.handle(0).invalidate();
        let second = manager.borrow_connection(&identity(), ConnectionKind::Sftp).unwrap();

        assert!(!same_handle(&first, &second));
        assert!(second.is_valid());
        assert_eq!(backend.handle(0).disconnect_count(), 1);
    }

    #[test]
    fn test_absent_release_and_close_are_noops() {
        let backend = MockBackend::new();
        let manager = manager(&backend, config());
        let ctx = ExecutionContextId::allocate();

        assert!(!manager.release_connection_for(ctx, &identity()));
        assert!(!manager.close_connection_for(ctx, &identity()));

        manager.borrow_connection_for(ctx, &identity(), ConnectionKind::Sftp).unwrap();
        assert!(manager.close_connection_for(ctx, &identity()));
        assert!(!manager.close_connection_for(ctx, &identity()));
        assert_eq!(backend.handle(0).disconnect_count(), 1);
    }

    #[test]
    fn test_connect_failure_leaves_no_slot() {
        let backend = MockBackend::new();
        backend.fail_connects(true);
        let manager = manager(&backend, config());

        let result = manager.borrow_connection(&identity(), ConnectionKind::Sftp);

        assert!(matches!(result, Err(ConnectionError::ConnectFailure { .. })));
        assert_eq!(manager.registry().total_slots(), 0);
    }

    #[test]
    fn test_unsupported_kind_is_surfaced() {
        let backend = MockBackend::new();
        let factory = ConnectionFactory::new()
            .with_constructor(ConnectionKind::Sftp, backend.constructor(ConnectionKind::Sftp));
        let manager = BasicConnectionManager::new(factory, config());

        let result = manager.borrow_connection(&identity(), ConnectionKind::Shell);

        assert!(matches!(result, Err(ConnectionError::UnsupportedProtocol(ConnectionKind::Shell))));
    }

    #[test]
    fn test_borrow_checks_own_slot_first() {
        let backend = MockBackend::new();
        let manager = manager(&backend, config().with_idle_timeout(Duration::from_millis(1)));

        let first = manager.borrow_connection(&identity(), ConnectionKind::Sftp).unwrap();
        manager.release_connection(&identity());
        std::thread::sleep(Duration::from_millis(10));
        let second = manager.borrow_connection(&identity(), ConnectionKind::Sftp).unwrap();

        // The inspect observer closed the expired slot before the walk began.
        assert!(!same_handle(&first, &second));
        assert_eq!(backend.handle(0).disconnect_count(), 1);
    }

    #[test]
    fn test_scheduler_releases_forgotten_borrow() {
        let backend = MockBackend::new();
        let manager = manager(
            &backend,
            ManagerConfiguration::new()
                .with_borrow_timeout(Duration::from_millis(1))
                .with_schedule_period(Duration::from_millis(20)),
        );

        manager.borrow_connection(&identity(), ConnectionKind::Sftp).unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let slot = manager.registry().slot(&identity(), ExecutionContextId::current()).unwrap();
        assert!(!slot.is_borrowed());
        assert!(slot.is_open());
    }

    #[test]
    fn test_scheduler_closes_idle_connection() {
        let backend = MockBackend::new();
        let manager = manager(
            &backend,
            ManagerConfiguration::new()
                .with_idle_timeout(Duration::from_millis(1))
                .with_schedule_period(Duration::from_millis(20)),
        );

        let first = manager.borrow_connection(&identity(), ConnectionKind::Sftp).unwrap();
        manager.release_connection(&identity());
        std::thread::sleep(Duration::from_millis(200));

        assert!(manager.registry().slot(&identity(), ExecutionContextId::current()).is_none());
        let second = manager.borrow_connection(&identity(), ConnectionKind::Sftp).unwrap();
        assert!(!same_handle(&first, &second));
    }

    #[test]
    fn test_sweep_keeps_fresh_connections() {
        let backend = MockBackend::new();
        let manager = manager(&backend, config().with_max_connection_size(2));
        let contexts: Vec<_> = (0..2).map(|_| ExecutionContextId::allocate()).collect();
        for ctx in &contexts {
            manager.borrow_connection_for(*ctx, &identity(), ConnectionKind::Sftp).unwrap();
        }
        for ctx in &contexts {
            assert!(manager.release_connection_for(*ctx, &identity()));
        }

        assert_eq!(manager.sweep().closed(), 0);
        assert_eq!(manager.registry().slot_count(&identity()), 2);
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let backend = MockBackend::new();
        let manager = manager(&backend, ManagerConfiguration::new());
        let a = ExecutionContextId::allocate();
        let b = ExecutionContextId::allocate();
        manager.borrow_connection_for(a, &identity(), ConnectionKind::Sftp).unwrap();
        manager.borrow_connection_for(b, &identity(), ConnectionKind::Shell).unwrap();
        assert!(manager.monitor().is_auto_inspecting());

        manager.shutdown();

        assert!(manager.registry().is_empty());
        assert!(!manager.monitor().is_auto_inspecting());
        assert_eq!(backend.handle(0).disconnect_count(), 1);
        assert_eq!(backend.handle(1).disconnect_count(), 1);
    }

    #[test]
    fn test_concurrent_borrowers_stay_within_limit() {
        let backend = MockBackend::new();
        let manager = Arc::new(manager(&backend, config().with_max_connection_size(8)));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let handle = manager.borrow_connection(&identity(), ConnectionKind::Sftp).unwrap();
                        assert!(handle.is_valid());
                        manager.release_connection(&identity());
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(manager.registry().slot_count(&identity()) <= 8);
        assert!(backend.created_count() <= 8);
        assert_eq!(manager.get_metrics().total_borrowed, 400);
    }

    #[test]
    fn test_health_and_metrics() {
        let backend = MockBackend::new();
        let manager = manager(&backend, config().with_max_connection_size(2));
        let a = ExecutionContextId::allocate();
        let b = ExecutionContextId::allocate();
        manager.borrow_connection_for(a, &identity(), ConnectionKind::Sftp).unwrap();
        manager.borrow_connection_for(b, &identity(), ConnectionKind::Sftp).unwrap();
        manager.release_connection_for(b, &identity());

        let health = manager.get_health_status();
        assert_eq!(health.open_connections, 2);
        assert_eq!(health.borrowed_connections, 1);
        assert_eq!(health.warning_count, 2);

        let exported = manager.export_metrics();
        assert_eq!(exported["total_created"], "2");
        assert_eq!(exported["borrowed_connections"], "1");
        assert_eq!(manager.kind(), ManagerKind::Basic);
    }

    #[test]
    fn test_slow_connects_cannot_exceed_limit() {
        let backend = MockBackend::new();
        backend.slow_connects(Duration::from_millis(50));
        let manager = Arc::new(manager(&backend, config().with_max_connection_size(1)));
        let start = Arc::new(Barrier::new(4));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let start = Arc::clone(&start);
                std::thread::spawn(move || {
                    start.wait();
                    manager.borrow_connection(&identity(), ConnectionKind::Sftp).is_ok()
                })
            })
            .collect();
        let granted = workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(granted, 1);
        assert_eq!(backend.created_count(), 1);
        assert_eq!(manager.registry().slot_count(&identity()), 1);
        assert_eq!(manager.get_metrics().over_limit_rejections, 3);
    }

    #[test]
    fn test_failed_connect_frees_its_place() {
        let backend = MockBackend::new();
        let manager = manager(&backend, config().with_max_connection_size(1));

        backend.fail_connects(true);
        assert!(manager.borrow_connection(&identity(), ConnectionKind::Sftp).is_err());
        backend.fail_connects(false);
        manager.borrow_connection(&identity(), ConnectionKind::Sftp).unwrap();

        let entry = manager.registry().get(&identity()).unwrap();
        assert_eq!(entry.pending(), 0);
        assert_eq!(entry.len(), 1);
    }

    #[test]
    fn test_borrow_does_not_wait_for_sweep() {
        let backend = MockBackend::new();
        let manager = Arc::new(manager(&backend, config()));
        manager.borrow_connection(&identity(), ConnectionKind::Sftp).unwrap();
        manager.release_connection(&identity());

        let entry = manager.registry().get(&identity()).unwrap();
        let sweep = entry.sweep_guard();
        let (done, finished) = channel::bounded(1);
        let worker = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                let ctx = ExecutionContextId::allocate();
                let borrowed = manager.borrow_connection_for(ctx, &identity(), ConnectionKind::Sftp).is_ok();
                let closed = manager.close_connection_for(ctx, &identity());
                let _ = done.send(borrowed && closed);
            })
        };

        assert_eq!(finished.recv_timeout(Duration::from_secs(5)), Ok(true));
        drop(sweep);
        worker.join().unwrap();
        assert_eq!(backend.created_count(), 1);
    }

    #[test]
    fn test_sweeps_race_with_borrow_and_close() {
        let backend = MockBackend::new();
        let manager = Arc::new(manager(
            &backend,
            config()
                .with_max_connection_size(4)
                .with_borrow_timeout(Duration::from_millis(1))
                .with_idle_timeout(Duration::from_millis(1)),
        ));
        let running = Arc::new(AtomicBool::new(true));

        let sweeper = {
            let manager = Arc::clone(&manager);
            let running = Arc::clone(&running);
            std::thread::spawn(move || {
                let mut sweeps = 0;
                while running.load(Ordering::SeqCst) {
                    manager.sweep();
                    sweeps += 1;
                }
                sweeps
            })
        };
        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    for round in 0..200 {
                        manager.borrow_connection(&identity(), ConnectionKind::Sftp).unwrap();
                        if (round + worker) % 3 == 0 {
                            manager.close_connection(&identity());
                        } else {
                            manager.release_connection(&identity());
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        running.store(false, Ordering::SeqCst);
        assert!(sweeper.join().unwrap() > 0);

        if let Some(entry) = manager.registry().get(&identity()) {
            assert!(entry.len() <= 4);
            for (_, slot) in entry.slots() {
                assert!(slot.is_open());
            }
        }
        manager.shutdown();
        for handle in backend.handles() {
            assert_eq!(handle.disconnect_count(), 1);
        }
    }

    #[test]
    fn test_sweep_forgets_identity_without_connections() {
        let backend = MockBackend::new();
        let manager = manager(&backend, config());

        manager.borrow_connection(&identity(), ConnectionKind::Sftp).unwrap();
        manager.close_connection(&identity());
        assert_eq!(manager.registry().len(), 1);

        assert_eq!(manager.sweep(), SweepReport::default());
        assert!(manager.registry().is_empty());

        manager.borrow_connection(&identity(), ConnectionKind::Sftp).unwrap();
        assert_eq!(manager.registry().slot_count(&identity()), 1);
        assert_eq!(backend.created_count(), 2);
    }
}
