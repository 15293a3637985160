//! Execution context identifiers
//!
//! A context is the caller whose affinity decides which slot it may reuse.
//! Threads register lazily the first time they ask for their id; task based
//! runtimes can allocate ids themselves and pass them explicitly.

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_CONTEXT: Cell<Option<ExecutionContextId>> = const { Cell::new(None) };
}

/// Opaque identifier of one execution context (thread, worker, task)
///
/// # Examples
///
/// ```
/// use esox_connection_manager::ExecutionContextId;
///
/// let here = ExecutionContextId::current();
/// assert_eq!(here, ExecutionContextId::current());
///
/// let elsewhere = std::thread::spawn(ExecutionContextId::current).join().unwrap();
/// assert_ne!(here, elsewhere);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionContextId(u64);

impl ExecutionContextId {
    /// Allocate a fresh id that is not bound to any thread
    pub fn allocate() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Id of the calling thread, registering it on first use
    pub fn current() -> Self {
        CURRENT_CONTEXT.with(|cell| match cell.get() {
            Some(id) => id,
            None => {
                let id = Self::allocate();
                cell.set(Some(id));
                id
            }
        })
    }

    /// Bind `id` to the calling thread, returning the previous binding
    pub fn enter(id: ExecutionContextId) -> Option<ExecutionContextId> {
        CURRENT_CONTEXT.with(|cell| cell.replace(Some(id)))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ExecutionContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_unique() {
        let a = ExecutionContextId::allocate();
        let b = ExecutionContextId::allocate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_enter_rebinds_current() {
        std::thread::spawn(|| {
            let original = ExecutionContextId::current();
            let custom = ExecutionContextId::allocate();

            assert_eq!(ExecutionContextId::enter(custom), Some(original));
            assert_eq!(ExecutionContextId::current(), custom);
        })
        .join()
        .unwrap();
    }
}
