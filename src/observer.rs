//! Reactions to manager calls and scheduled ticks

use crate::context::ExecutionContextId;
use crate::eviction::{EvictionEngine, SlotVerdict};
use crate::identity::ConnectionIdentity;
use crate::manager::ManagerKind;
use crate::pooled::PoolDirectory;
use crate::registry::Registry;
use std::fmt;
use tracing::debug;

/// Which manager call triggered a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerOperation {
    Borrow,
    Release,
    Close,
}

impl fmt::Display for ManagerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerOperation::Borrow => f.write_str("borrow"),
            ManagerOperation::Release => f.write_str("release"),
            ManagerOperation::Close => f.write_str("close"),
        }
    }
}

/// Read access to the state of the manager that sent a notification
#[derive(Debug, Clone, Copy)]
pub enum ManagerView<'a> {
    Basic(&'a Registry),
    Pooled(&'a PoolDirectory),
}

impl ManagerView<'_> {
    pub fn kind(&self) -> ManagerKind {
        match self {
            ManagerView::Basic(_) => ManagerKind::Basic,
            ManagerView::Pooled(_) => ManagerKind::Pooled,
        }
    }
}

/// One manager call, delivered to every observer before the call runs
#[derive(Debug, Clone, Copy)]
pub struct ManagerEvent<'a> {
    pub operation: ManagerOperation,
    pub identity: &'a ConnectionIdentity,
    pub context: ExecutionContextId,
    pub view: ManagerView<'a>,
}

/// Something attached to a [`ConnectionMonitor`](crate::ConnectionMonitor).
///
/// `visit` runs synchronously on the caller's thread for every manager call.
/// `on_schedule` runs on the monitor thread once per scheduled period.
pub trait Observer: Send + Sync {
    fn visit(&self, event: &ManagerEvent<'_>);

    fn on_schedule(&self, view: &ManagerView<'_>) {
        let _ = view;
    }
}

/// Logs connection counts; never changes anything
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl LogObserver {
    pub fn new() -> Self {
        Self
    }

    fn summarize(view: &ManagerView<'_>) {
        match view {
            ManagerView::Basic(registry) => {
                debug!(identities = registry.len(), slots = registry.total_slots(), "connection summary");
                for stats in registry.statistics() {
                    debug!(
                        host = %stats.host,
                        port = stats.port,
                        username = %stats.username,
                        contexts = stats.contexts,
                        borrowed = stats.borrowed,
                        "identity connections"
                    );
                }
            }
            ManagerView::Pooled(directory) => {
                debug!(pools = directory.len(), "pool summary");
                for stats in directory.statistics() {
                    debug!(
                        host = %stats.host,
                        port = stats.port,
                        kind = %stats.kind,
                        idle = stats.idle,
                        active = stats.active,
                        max = stats.max,
                        "pool connections"
                    );
                }
            }
        }
    }
}

impl Observer for LogObserver {
    fn visit(&self, event: &ManagerEvent<'_>) {
        debug!(
            operation = %event.operation,
            identity = %event.identity,
            context = %event.context,
            "manager call"
        );
        Self::summarize(&event.view);
    }

    fn on_schedule(&self, view: &ManagerView<'_>) {
        Self::summarize(view);
    }
}

/// Runs eviction.
///
/// On a basic manager every call checks the caller's own slot and every
/// scheduled tick sweeps all identities. On a pooled manager every call logs
/// the pool's counts and every tick evicts stale idle handles; the pools carry
/// their own timeouts, so no engine is needed there.
#[derive(Debug, Clone)]
pub struct InspectObserver {
    engine: Option<EvictionEngine>,
}

impl InspectObserver {
    /// Inspector for a basic manager's registry
    pub fn new(engine: EvictionEngine) -> Self {
        Self { engine: Some(engine) }
    }

    /// Inspector for a pooled manager
    pub fn for_pools() -> Self {
        Self { engine: None }
    }
}

impl Observer for InspectObserver {
    fn visit(&self, event: &ManagerEvent<'_>) {
        match event.view {
            ManagerView::Basic(registry) => {
                let Some(engine) = &self.engine else {
                    return;
                };
                let verdict = engine.check_slot(registry, event.identity, event.context);
                if verdict != SlotVerdict::Keep {
                    debug!(identity = %event.identity, context = %event.context, ?verdict, "inspected slot");
                }
            }
            ManagerView::Pooled(directory) => {
                for stats in directory.statistics_for(event.identity) {
                    debug!(
                        identity = %event.identity,
                        kind = %stats.kind,
                        idle = stats.idle,
                        active = stats.active,
                        "pool state"
                    );
                }
            }
        }
    }

    fn on_schedule(&self, view: &ManagerView<'_>) {
        match view {
            ManagerView::Basic(registry) => {
                if let Some(engine) = &self.engine {
                    engine.sweep_all(registry);
                }
            }
            ManagerView::Pooled(directory) => {
                directory.evict_idle();
            }
        }
    }
}
