//! In-memory connection handles for tests

use crate::connection::{ConnectionHandle, ConnectionKind};
use crate::errors::{ConnectionError, ConnectionResult};
use crate::factory::ConnectionFactory;
use crate::identity::ConnectionIdentity;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub(crate) struct MockHandle {
    kind: ConnectionKind,
    backend: Arc<MockBackend>,
    connected: AtomicBool,
    valid: AtomicBool,
    disconnects: AtomicUsize,
}

impl MockHandle {
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl ConnectionHandle for MockHandle {
    fn kind(&self) -> ConnectionKind {
        self.kind
    }

    fn connect(&self, identity: &ConnectionIdentity, _timeout: Duration) -> ConnectionResult<()> {
        let delay = *self.backend.connect_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.backend.fail_connect.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectFailure {
                identity: identity.clone(),
                reason: "connection refused".to_string(),
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) -> ConnectionResult<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if self.backend.fail_disconnect.load(Ordering::SeqCst) {
            return Err(ConnectionError::DisconnectFailure("socket reset".to_string()));
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst) && self.connected.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        !self.connected.load(Ordering::SeqCst)
    }
}

/// Records every handle it hands out so tests can poke at them
#[derive(Default)]
pub(crate) struct MockBackend {
    created: Mutex<Vec<Arc<MockHandle>>>,
    fail_connect: AtomicBool,
    fail_disconnect: AtomicBool,
    connect_delay: Mutex<Duration>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn constructor(
        self: &Arc<Self>,
        kind: ConnectionKind,
    ) -> impl Fn() -> Arc<dyn ConnectionHandle> + Send + Sync + 'static {
        let backend = Arc::clone(self);
        move || {
            let handle = Arc::new(MockHandle {
                kind,
                backend: Arc::clone(&backend),
                connected: AtomicBool::new(false),
                valid: AtomicBool::new(true),
                disconnects: AtomicUsize::new(0),
            });
            backend.created.lock().push(Arc::clone(&handle));
            handle as Arc<dyn ConnectionHandle>
        }
    }

    /// A factory supporting every kind
    pub fn factory(self: &Arc<Self>) -> ConnectionFactory {
        ConnectionFactory::new()
            .with_constructor(ConnectionKind::Sftp, self.constructor(ConnectionKind::Sftp))
            .with_constructor(ConnectionKind::Shell, self.constructor(ConnectionKind::Shell))
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn handle(&self, index: usize) -> Arc<MockHandle> {
        Arc::clone(&self.created.lock()[index])
    }

    pub fn fail_connects(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_disconnects(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    /// Make every connect take at least `delay`
    pub fn slow_connects(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    pub fn handles(&self) -> Vec<Arc<MockHandle>> {
        self.created.lock().clone()
    }
}

/// Whether two trait objects point at the same handle
pub(crate) fn same_handle(a: &Arc<dyn ConnectionHandle>, b: &Arc<dyn ConnectionHandle>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
