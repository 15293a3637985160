//! Eviction of timed out and surplus connections
//!
//! Two entry points share the same timeout rules. [`EvictionEngine::check_slot`]
//! looks at the caller's own slot under that slot's lock only.
//! [`EvictionEngine::sweep`] walks every slot of one identity under the
//! identity's sweep lock, so two sweeps of the same identity never interleave.

use crate::config::ManagerConfiguration;
use crate::context::ExecutionContextId;
use crate::identity::ConnectionIdentity;
use crate::metrics::MetricsTracker;
use crate::registry::{IdentityEntry, Registry};
use crate::slot::{ConnectionSlot, SlotState};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Timeout and size rules applied to connection slots
///
/// # Examples
///
/// ```
/// use esox_connection_manager::{EvictionPolicy, SlotVerdict};
/// use std::time::{Duration, Instant};
///
/// let policy = EvictionPolicy {
///     borrow_timeout: Duration::from_secs(60),
///     idle_timeout: Duration::from_secs(10),
///     max_connections: 8,
/// };
///
/// let released = Instant::now();
/// let later = released + Duration::from_secs(11);
/// assert_eq!(policy.verdict(false, released, released, later), SlotVerdict::Close);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// A slot borrowed for longer than this is released to idle
    pub borrow_timeout: Duration,

    /// A slot idle for longer than this is closed
    pub idle_timeout: Duration,

    /// Per identity; surplus idle slots are closed by the sweep
    pub max_connections: usize,
}

impl EvictionPolicy {
    pub fn from_config(config: &ManagerConfiguration) -> Self {
        Self {
            borrow_timeout: config.borrow_timeout,
            idle_timeout: config.idle_timeout,
            max_connections: config.max_connection_size,
        }
    }

    pub fn is_borrow_expired(&self, borrow_time: Instant, now: Instant) -> bool {
        now.saturating_duration_since(borrow_time) > self.borrow_timeout
    }

    pub fn is_idle_expired(&self, release_time: Instant, now: Instant) -> bool {
        now.saturating_duration_since(release_time) > self.idle_timeout
    }

    /// What the single-slot check does with a slot in the given state
    pub fn verdict(
        &self,
        borrowed: bool,
        borrow_time: Instant,
        release_time: Instant,
        now: Instant,
    ) -> SlotVerdict {
        if borrowed {
            if self.is_borrow_expired(borrow_time, now) {
                SlotVerdict::Release
            } else {
                SlotVerdict::Keep
            }
        } else if self.is_idle_expired(release_time, now) {
            SlotVerdict::Close
        } else {
            SlotVerdict::Keep
        }
    }

    fn verdict_for(&self, state: &SlotState, now: Instant) -> SlotVerdict {
        self.verdict(state.borrowed, state.borrow_time, state.release_time, now)
    }
}

/// Outcome of checking one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotVerdict {
    /// Leave the slot alone
    Keep,

    /// Borrow timed out, force it back to idle
    Release,

    /// Idle timed out, disconnect and remove it
    Close,
}

/// What a bulk sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Borrowed slots released after the borrow timeout
    pub released: usize,

    /// Idle slots closed after the idle timeout
    pub closed_idle: usize,

    /// Idle slots closed to get back under the connection limit
    pub closed_over_limit: usize,
}

impl SweepReport {
    pub fn closed(&self) -> usize {
        self.closed_idle + self.closed_over_limit
    }

    fn merge(&mut self, other: SweepReport) {
        self.released += other.released;
        self.closed_idle += other.closed_idle;
        self.closed_over_limit += other.closed_over_limit;
    }
}

/// Applies an [`EvictionPolicy`] to the slots of a [`Registry`]
#[derive(Debug, Clone)]
pub struct EvictionEngine {
    policy: EvictionPolicy,
    metrics: Arc<MetricsTracker>,
}

impl EvictionEngine {
    pub(crate) fn new(policy: EvictionPolicy, metrics: Arc<MetricsTracker>) -> Self {
        Self { policy, metrics }
    }

    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    /// Check the slot `context` holds for `identity`: release it if its borrow
    /// timed out, close it if its idle time ran out.
    pub fn check_slot(
        &self,
        registry: &Registry,
        identity: &ConnectionIdentity,
        context: ExecutionContextId,
    ) -> SlotVerdict {
        let Some(entry) = registry.get(identity) else {
            return SlotVerdict::Keep;
        };
        let Some(slot) = entry.slot(context) else {
            return SlotVerdict::Keep;
        };

        let mut state = slot.lock();
        // A sweep or a steal may have got here first.
        if !state.is_live_for(context) {
            return SlotVerdict::Keep;
        }

        let now = Instant::now();
        let verdict = self.policy.verdict_for(&state, now);
        match verdict {
            SlotVerdict::Release => {
                state.mark_idle(now);
                MetricsTracker::increment(&self.metrics.evicted_released);
                debug!(host = %identity.host, %context, "borrow timed out, released to idle");
            }
            SlotVerdict::Close => {
                self.close_locked(identity, &entry, &slot, &mut state);
                MetricsTracker::increment(&self.metrics.evicted_closed);
                debug!(host = %identity.host, %context, "idle timed out, closed");
            }
            SlotVerdict::Keep => {}
        }
        verdict
    }

    /// Sweep every slot of one identity.
    ///
    /// Releases borrow-expired slots, closes idle-expired ones, then closes idle
    /// slots, least recently released first, until the identity is back at its
    /// connection limit or no idle slot is left.
    pub fn sweep(&self, identity: &ConnectionIdentity, entry: &IdentityEntry) -> SweepReport {
        let _sweep = entry.sweep_guard();
        self.sweep_locked(identity, entry)
    }

    /// Sweep every identity currently in the registry, then forget the
    /// identities left without any slot
    pub fn sweep_all(&self, registry: &Registry) -> SweepReport {
        let mut report = SweepReport::default();
        for (identity, entry) in registry.entries() {
            let _sweep = entry.sweep_guard();
            report.merge(self.sweep_locked(&identity, &entry));
            if registry.remove_vacant(&identity, &entry) {
                debug!(host = %identity.host, port = identity.port, "forgot identity without connections");
            }
        }
        report
    }

    fn sweep_locked(&self, identity: &ConnectionIdentity, entry: &IdentityEntry) -> SweepReport {
        let now = Instant::now();
        let mut report = SweepReport::default();

        for (context, slot) in entry.slots() {
            let mut state = slot.lock();
            if state.is_live_for(context)
                && state.borrowed
                && self.policy.is_borrow_expired(state.borrow_time, now)
            {
                state.mark_idle(now);
                report.released += 1;
            }
        }

        for (context, slot) in entry.slots() {
            let mut state = slot.lock();
            if state.is_live_for(context)
                && !state.borrowed
                && self.policy.is_idle_expired(state.release_time, now)
            {
                self.close_locked(identity, entry, &slot, &mut state);
                report.closed_idle += 1;
            }
        }

        if entry.len() > self.policy.max_connections {
            let mut idle: Vec<_> = entry
                .slots()
                .into_iter()
                .filter_map(|(context, slot)| {
                    let state = slot.lock();
                    let candidate = state.is_live_for(context) && !state.borrowed;
                    let release_time = state.release_time;
                    drop(state);
                    candidate.then_some((release_time, context, slot))
                })
                .collect();
            idle.sort_by_key(|(release_time, _, _)| *release_time);

            for (_, context, slot) in idle {
                if entry.len() <= self.policy.max_connections {
                    break;
                }
                let mut state = slot.lock();
                if state.is_live_for(context) && !state.borrowed {
                    self.close_locked(identity, entry, &slot, &mut state);
                    report.closed_over_limit += 1;
                }
            }
        }

        self.metrics
            .evicted_released
            .fetch_add(report.released, std::sync::atomic::Ordering::Relaxed);
        self.metrics
            .evicted_closed
            .fetch_add(report.closed(), std::sync::atomic::Ordering::Relaxed);

        if report != SweepReport::default() {
            debug!(
                host = %identity.host,
                port = identity.port,
                released = report.released,
                closed_idle = report.closed_idle,
                closed_over_limit = report.closed_over_limit,
                remaining = entry.len(),
                "swept connections"
            );
        }
        report
    }

    /// Disconnect the slot's handle and remove it from `entry`.
    ///
    /// The caller holds the slot lock. A failed disconnect is logged and the slot
    /// is removed anyway.
    pub(crate) fn close_locked(
        &self,
        identity: &ConnectionIdentity,
        entry: &IdentityEntry,
        slot: &Arc<ConnectionSlot>,
        state: &mut SlotState,
    ) {
        let context = state.owner;
        if let Some(handle) = state.handle.take() {
            if let Err(e) = handle.disconnect() {
                MetricsTracker::increment(&self.metrics.disconnect_failures);
                error!(host = %identity.host, %context, error = %e, "failed to disconnect");
            }
        }
        state.borrowed = false;
        entry.detach(context, slot);
        info!(host = %identity.host, port = identity.port, %context, "connection removed");
    }
}
