//! Observer fan-out for manager calls and scheduled ticks

use crate::context::ExecutionContextId;
use crate::identity::ConnectionIdentity;
use crate::observer::{ManagerEvent, ManagerOperation, ManagerView, Observer};
use crate::pooled::PoolDirectory;
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// The state a monitor exposes to its observers
#[derive(Debug, Clone)]
pub enum MonitorTarget {
    Basic(Arc<Registry>),
    Pooled(Arc<PoolDirectory>),
}

impl MonitorTarget {
    pub fn view(&self) -> ManagerView<'_> {
        match self {
            MonitorTarget::Basic(registry) => ManagerView::Basic(registry),
            MonitorTarget::Pooled(directory) => ManagerView::Pooled(directory),
        }
    }
}

struct MonitorShared {
    observers: RwLock<Vec<Arc<dyn Observer>>>,
    target: MonitorTarget,
}

impl MonitorShared {
    fn observers(&self) -> Vec<Arc<dyn Observer>> {
        self.observers.read().clone()
    }

    fn tick(&self) {
        let view = self.target.view();
        for observer in self.observers() {
            observer.on_schedule(&view);
        }
    }
}

/// Delivers every manager call to the attached observers, in attach order, and
/// drives their scheduled hook from one background thread.
///
/// The scheduler runs only while auto inspection is on. Dropping the monitor
/// stops it.
pub struct ConnectionMonitor {
    shared: Arc<MonitorShared>,
    scheduler: Scheduler,
    period: Mutex<Duration>,
    auto_inspect: AtomicBool,
}

impl ConnectionMonitor {
    /// A monitor with no observers and the scheduler stopped
    pub fn new(target: MonitorTarget, period: Duration) -> Self {
        Self {
            shared: Arc::new(MonitorShared {
                observers: RwLock::new(Vec::new()),
                target,
            }),
            scheduler: Scheduler::new(),
            period: Mutex::new(period),
            auto_inspect: AtomicBool::new(false),
        }
    }

    pub fn attach(&self, observer: Arc<dyn Observer>) {
        self.shared.observers.write().push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.shared.observers.read().len()
    }

    pub fn target(&self) -> &MonitorTarget {
        &self.shared.target
    }

    /// Deliver one manager call to every observer on the calling thread
    pub fn notify(
        &self,
        operation: ManagerOperation,
        identity: &ConnectionIdentity,
        context: ExecutionContextId,
    ) {
        let event = ManagerEvent {
            operation,
            identity,
            context,
            view: self.shared.target.view(),
        };
        for observer in self.shared.observers() {
            observer.visit(&event);
        }
    }

    /// Run one scheduled fan-out now, on the calling thread
    pub fn tick(&self) {
        self.shared.tick();
    }

    /// Turn the scheduled fan-out on or off.
    ///
    /// Always cancels the running task first; turning it on starts a fresh one
    /// with the current period.
    pub fn set_auto_inspect(&self, enabled: bool) {
        self.scheduler.stop();
        self.auto_inspect.store(enabled, Ordering::Release);
        if enabled {
            let shared = Arc::clone(&self.shared);
            self.scheduler
                .start(self.schedule_period(), Arc::new(move || shared.tick()));
        }
        debug!(enabled, "auto inspection changed");
    }

    pub fn is_auto_inspecting(&self) -> bool {
        self.auto_inspect.load(Ordering::Acquire)
    }

    /// Period for the next time the scheduler starts; a running task keeps its own
    pub fn set_schedule_period(&self, period: Duration) {
        *self.period.lock() = period;
    }

    pub fn schedule_period(&self) -> Duration {
        *self.period.lock()
    }

    /// Stop the scheduler and leave auto inspection off
    pub fn stop(&self) {
        self.scheduler.stop();
        self.auto_inspect.store(false, Ordering::Release);
    }
}
