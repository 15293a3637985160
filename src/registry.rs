//! Keyed registry of live connection slots
//!
//! `ConnectionIdentity -> (ExecutionContextId -> ConnectionSlot)`. Both levels
//! are sharded concurrent maps, so lookups and inserts on different identities
//! or different contexts never wait on each other.
//!
//! Lock order: never lock a slot while holding a guard into either map. Callers
//! clone the `Arc`s out first. Anything that adds a slot to an identity, or moves
//! one between contexts, does so under that identity's pending counter, so the
//! slot count plus connections still opening never undercounts.

use crate::context::ExecutionContextId;
use crate::identity::ConnectionIdentity;
use crate::slot::ConnectionSlot;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Connection counts for one identity
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct IdentityStatistics {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Number of registered slots (one per context)
    pub contexts: usize,
    /// How many of those are currently borrowed
    pub borrowed: usize,
}

/// All slots of one identity plus the lock that serializes bulk sweeps over them
#[derive(Debug, Default)]
pub struct IdentityEntry {
    contexts: DashMap<ExecutionContextId, Arc<ConnectionSlot>>,
    /// Connections reserved but not registered yet
    pending: Mutex<usize>,
    sweep_lock: Mutex<()>,
}

impl IdentityEntry {
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn slot(&self, context: ExecutionContextId) -> Option<Arc<ConnectionSlot>> {
        self.contexts.get(&context).map(|slot| Arc::clone(slot.value()))
    }

    /// Snapshot of every `(context, slot)` pair
    pub fn slots(&self) -> Vec<(ExecutionContextId, Arc<ConnectionSlot>)> {
        self.contexts
            .iter()
            .map(|item| (*item.key(), Arc::clone(item.value())))
            .collect()
    }

    /// Connections currently being opened for this identity
    pub fn pending(&self) -> usize {
        *self.pending.lock()
    }

    /// Claim room for one more slot, unless registered plus pending slots
    /// already reach `max`.
    pub(crate) fn try_reserve(self: &Arc<Self>, max: usize) -> Option<SlotReservation> {
        let mut pending = self.pending.lock();
        if self.contexts.len() + *pending >= max {
            return None;
        }
        *pending += 1;
        Some(SlotReservation {
            entry: Arc::clone(self),
            committed: false,
        })
    }

    /// Move `slot` from `from` to `to` in one step.
    ///
    /// `None` when `slot` is no longer registered under `from`. Otherwise the
    /// slot `to` held before, if any.
    pub(crate) fn reassign(
        &self,
        from: ExecutionContextId,
        to: ExecutionContextId,
        slot: &Arc<ConnectionSlot>,
    ) -> Option<Option<Arc<ConnectionSlot>>> {
        let _pending = self.pending.lock();
        if !self.detach(from, slot) {
            return None;
        }
        Some(self.contexts.insert(to, Arc::clone(slot)))
    }

    /// No slot registered and none on its way
    fn is_vacant(&self) -> bool {
        let pending = self.pending.lock();
        *pending == 0 && self.contexts.is_empty()
    }

    /// Remove `slot` from under `context`, unless a different slot took the key meanwhile
    pub(crate) fn detach(&self, context: ExecutionContextId, slot: &Arc<ConnectionSlot>) -> bool {
        self.contexts
            .remove_if(&context, |_, registered| Arc::ptr_eq(registered, slot))
            .is_some()
    }

    /// Held for the whole of a bulk sweep, never on the single-slot path
    pub(crate) fn sweep_guard(&self) -> MutexGuard<'_, ()> {
        self.sweep_lock.lock()
    }

    fn statistics(&self, identity: &ConnectionIdentity) -> IdentityStatistics {
        let slots = self.slots();
        let borrowed = slots.iter().filter(|(_, slot)| slot.is_borrowed()).count();
        IdentityStatistics {
            host: identity.host.clone(),
            port: identity.port,
            username: identity.username.clone(),
            contexts: slots.len(),
            borrowed,
        }
    }
}

/// Room for one slot of an identity, held while its connection opens.
///
/// Dropping it without [`commit`](Self::commit) gives the room back.
#[derive(Debug)]
pub(crate) struct SlotReservation {
    entry: Arc<IdentityEntry>,
    committed: bool,
}

impl SlotReservation {
    pub fn entry(&self) -> &Arc<IdentityEntry> {
        &self.entry
    }

    /// Register `slot` under `context`, returning the slot it replaced
    pub fn commit(mut self, context: ExecutionContextId, slot: Arc<ConnectionSlot>) -> Option<Arc<ConnectionSlot>> {
        let mut pending = self.entry.pending.lock();
        let previous = self.entry.contexts.insert(context, slot);
        *pending -= 1;
        drop(pending);
        self.committed = true;
        previous
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if !self.committed {
            *self.entry.pending.lock() -= 1;
        }
    }
}

/// Process-wide record of every live connection slot
#[derive(Debug, Default)]
pub struct Registry {
    identities: DashMap<ConnectionIdentity, Arc<IdentityEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The per-context map for `identity`, if any slot was ever registered for it
    pub fn get(&self, identity: &ConnectionIdentity) -> Option<Arc<IdentityEntry>> {
        self.identities.get(identity).map(|entry| Arc::clone(entry.value()))
    }

    pub fn slot(
        &self,
        identity: &ConnectionIdentity,
        context: ExecutionContextId,
    ) -> Option<Arc<ConnectionSlot>> {
        self.get(identity)?.slot(context)
    }

    /// The per-context map for `identity`, created empty if missing
    fn entry(&self, identity: &ConnectionIdentity) -> Arc<IdentityEntry> {
        if let Some(entry) = self.get(identity) {
            return entry;
        }
        let entry = self.identities.entry(identity.clone()).or_default();
        Arc::clone(entry.value())
    }

    /// Claim room for one more slot of `identity` under the limit `max`.
    ///
    /// The reservation is taken on the entry the registry currently holds, so a
    /// concurrent [`remove_vacant`](Self::remove_vacant) never strands it.
    pub(crate) fn reserve(&self, identity: &ConnectionIdentity, max: usize) -> Option<SlotReservation> {
        loop {
            let entry = self.entry(identity);
            let reservation = entry.try_reserve(max)?;
            let registered = self
                .identities
                .get(identity)
                .is_some_and(|current| Arc::ptr_eq(current.value(), &entry));
            if registered {
                return Some(reservation);
            }
        }
    }

    /// Register `slot` for `(identity, context)` without a limit, returning the
    /// slot it replaced
    pub fn put(
        &self,
        identity: &ConnectionIdentity,
        context: ExecutionContextId,
        slot: Arc<ConnectionSlot>,
    ) -> Option<Arc<ConnectionSlot>> {
        self.reserve(identity, usize::MAX)
            .and_then(|reservation| reservation.commit(context, slot))
    }

    pub fn remove(
        &self,
        identity: &ConnectionIdentity,
        context: ExecutionContextId,
    ) -> Option<Arc<ConnectionSlot>> {
        let entry = self.get(identity)?;
        entry.contexts.remove(&context).map(|(_, slot)| slot)
    }

    /// Forget `identity` if `entry` is still its record and holds nothing
    pub(crate) fn remove_vacant(&self, identity: &ConnectionIdentity, entry: &Arc<IdentityEntry>) -> bool {
        self.identities
            .remove_if(identity, |_, registered| {
                Arc::ptr_eq(registered, entry) && registered.is_vacant()
            })
            .is_some()
    }

    /// Number of slots registered for `identity` across all contexts
    pub fn slot_count(&self, identity: &ConnectionIdentity) -> usize {
        self.get(identity).map_or(0, |entry| entry.len())
    }

    /// Snapshot of the known identities
    pub fn identities(&self) -> Vec<ConnectionIdentity> {
        self.identities.iter().map(|item| item.key().clone()).collect()
    }

    pub(crate) fn entries(&self) -> Vec<(ConnectionIdentity, Arc<IdentityEntry>)> {
        self.identities
            .iter()
            .map(|item| (item.key().clone(), Arc::clone(item.value())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn total_slots(&self) -> usize {
        self.identities.iter().map(|item| item.value().len()).sum()
    }

    pub fn statistics(&self) -> Vec<IdentityStatistics> {
        self.entries()
            .iter()
            .map(|(identity, entry)| entry.statistics(identity))
            .collect()
    }

    /// Drop every identity, handing back what was registered
    pub(crate) fn drain(&self) -> Vec<(ConnectionIdentity, Arc<IdentityEntry>)> {
        let entries = self.entries();
        for (identity, _) in &entries {
            self.identities.remove(identity);
        }
        entries
    }
}
