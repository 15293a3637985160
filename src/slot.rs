//! Lifecycle record of one open connection

use crate::connection::{ConnectionHandle, ConnectionKind, is_usable};
use crate::context::ExecutionContextId;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Mutable part of a slot, only reachable through the slot lock
pub(crate) struct SlotState {
    /// Context the slot is registered under
    pub owner: ExecutionContextId,
    /// `None` once the slot has been closed
    pub handle: Option<Arc<dyn ConnectionHandle>>,
    pub borrowed: bool,
    pub borrow_time: Instant,
    pub release_time: Instant,
}

impl SlotState {
    pub fn mark_borrowed(&mut self, now: Instant) {
        self.borrowed = true;
        self.borrow_time = now;
    }

    pub fn mark_idle(&mut self, now: Instant) {
        self.borrowed = false;
        self.release_time = now;
    }

    /// The slot is still registered under `context` and holds an open handle
    pub fn is_live_for(&self, context: ExecutionContextId) -> bool {
        self.owner == context && self.handle.is_some()
    }

    pub fn has_usable_handle(&self) -> bool {
        self.handle.as_ref().is_some_and(is_usable)
    }

    /// Idle, usable and of the requested kind
    pub fn is_reassignable_to(&self, kind: ConnectionKind) -> bool {
        !self.borrowed
            && self
                .handle
                .as_ref()
                .is_some_and(|handle| is_usable(handle) && handle.kind() == kind)
    }
}

impl fmt::Debug for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotState")
            .field("owner", &self.owner)
            .field("open", &self.handle.is_some())
            .field("borrowed", &self.borrowed)
            .field("borrow_time", &self.borrow_time)
            .field("release_time", &self.release_time)
            .finish()
    }
}

/// One open connection bound to one identity and one execution context.
///
/// Every field lives behind the slot's own lock, so two contexts never
/// mutate the same slot at the same time.
#[derive(Debug)]
pub struct ConnectionSlot {
    state: Mutex<SlotState>,
}

impl ConnectionSlot {
    /// A freshly opened connection, already borrowed by `owner`
    pub(crate) fn borrowed_by(owner: ExecutionContextId, handle: Arc<dyn ConnectionHandle>) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(SlotState {
                owner,
                handle: Some(handle),
                borrowed: true,
                borrow_time: now,
                release_time: now,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock()
    }

    pub fn is_borrowed(&self) -> bool {
        self.state.lock().borrowed
    }

    /// Whether the slot still holds an open handle
    pub fn is_open(&self) -> bool {
        self.state.lock().handle.is_some()
    }

    pub fn owner(&self) -> ExecutionContextId {
        self.state.lock().owner
    }

    pub fn handle(&self) -> Option<Arc<dyn ConnectionHandle>> {
        self.state.lock().handle.clone()
    }

    pub fn borrow_time(&self) -> Instant {
        self.state.lock().borrow_time
    }

    pub fn release_time(&self) -> Instant {
        self.state.lock().release_time
    }
}
