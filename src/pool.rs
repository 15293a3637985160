//! Generic bounded object pool

use crate::config::PoolConfiguration;
use crate::errors::{ConnectionError, ConnectionResult};

use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Longest single wait between two attempts of a blocking borrow
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Callbacks a pool uses to manage the lifecycle of its objects
pub trait PooledObjectFactory<T>: Send + Sync {
    /// Build a new object
    fn create(&self) -> ConnectionResult<T>;

    /// Whether an idle object can still be handed out
    fn validate(&self, object: &T) -> bool;

    /// Dispose of an object leaving the pool
    fn destroy(&self, object: T);
}

/// A pooled object that automatically returns to the pool when dropped
pub struct PooledObject<T> {
    value: Option<T>,
    object_id: usize,
    return_fn: Arc<dyn Fn(T, usize) + Send + Sync>,
}

impl<T> PooledObject<T> {
    fn new(value: T, object_id: usize, return_fn: Arc<dyn Fn(T, usize) + Send + Sync>) -> Self {
        Self {
            value: Some(value),
            object_id,
            return_fn,
        }
    }

    /// Pool-local id of the object, stable across borrows
    pub fn id(&self) -> usize {
        self.object_id
    }
}

impl<T> Deref for PooledObject<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.value.as_ref().expect("pooled object already returned")
    }
}

impl<T> Drop for PooledObject<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            (self.return_fn)(value, self.object_id);
        }
    }
}

struct IdleObject<T> {
    value: T,
    id: usize,
    idle_since: Instant,
}

struct PoolShared<T> {
    name: String,
    idle: ArrayQueue<IdleObject<T>>,
    factory: Arc<dyn PooledObjectFactory<T>>,
    config: PoolConfiguration,
    /// Idle plus borrowed plus reserved for creation
    total: AtomicUsize,
    next_id: AtomicUsize,
    closed: AtomicBool,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    signal: Mutex<()>,
    returned: Condvar,
}

impl<T> PoolShared<T> {
    fn destroy(&self, value: T) {
        self.factory.destroy(value);
        self.total.fetch_sub(1, Ordering::AcqRel);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        self.returned.notify_one();
    }

    fn is_idle_expired(&self, idle_since: Instant, now: Instant) -> bool {
        self.config
            .idle_timeout
            .is_some_and(|timeout| now.saturating_duration_since(idle_since) > timeout)
    }

    fn give_back(&self, value: T, id: usize) {
        if self.closed.load(Ordering::Acquire) || !self.factory.validate(&value) {
            self.destroy(value);
            return;
        }

        let idle = IdleObject {
            value,
            id,
            idle_since: Instant::now(),
        };
        if let Err(rejected) = self.idle.push(idle) {
            self.destroy(rejected.value);
            return;
        }
        // A close racing with the push above must not strand the object.
        if self.closed.load(Ordering::Acquire) {
            self.drain();
        }
        self.returned.notify_one();
    }

    fn drain(&self) -> usize {
        let mut drained = 0;
        while let Some(idle) = self.idle.pop() {
            self.destroy(idle.value);
            drained += 1;
        }
        drained
    }
}

/// Thread-safe pool that creates objects on demand up to a fixed size.
///
/// Borrowed objects come back through [`PooledObject`]'s `Drop`; objects that
/// fail validation on the way in or out are destroyed instead of reused.
pub struct ObjectPool<T: Send + 'static> {
    shared: Arc<PoolShared<T>>,
}

impl<T: Send + 'static> ObjectPool<T> {
    pub fn new(
        name: impl Into<String>,
        factory: Arc<dyn PooledObjectFactory<T>>,
        config: PoolConfiguration,
    ) -> Self {
        let capacity = config.max_pool_size.max(1);
        Self {
            shared: Arc::new(PoolShared {
                name: name.into(),
                idle: ArrayQueue::new(capacity),
                factory,
                config,
                total: AtomicUsize::new(0),
                next_id: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                created: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
                signal: Mutex::new(()),
                returned: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Borrow an object without waiting.
    ///
    /// Returns `Ok(None)` when every object is out and the pool is full.
    pub fn try_borrow(&self) -> ConnectionResult<Option<PooledObject<T>>> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::PoolClosed(shared.name.clone()));
        }

        let now = Instant::now();
        while let Some(idle) = shared.idle.pop() {
            if shared.is_idle_expired(idle.idle_since, now) || !shared.factory.validate(&idle.value) {
                debug!(pool = %shared.name, id = idle.id, "discarding stale pooled object");
                shared.destroy(idle.value);
                continue;
            }
            return Ok(Some(self.wrap(idle.value, idle.id)));
        }

        if !self.reserve() {
            return Ok(None);
        }
        match shared.factory.create() {
            Ok(value) => {
                let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
                shared.created.fetch_add(1, Ordering::Relaxed);
                debug!(pool = %shared.name, id, "created pooled object");
                Ok(Some(self.wrap(value, id)))
            }
            Err(e) => {
                shared.total.fetch_sub(1, Ordering::AcqRel);
                shared.returned.notify_one();
                Err(e)
            }
        }
    }

    /// Borrow an object, blocking the caller for at most `timeout`
    pub fn borrow(&self, timeout: Duration) -> ConnectionResult<PooledObject<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(object) = self.try_borrow()? {
                return Ok(object);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ConnectionError::Timeout(timeout));
            }
            let mut guard = self.shared.signal.lock();
            self.shared
                .returned
                .wait_for(&mut guard, (deadline - now).min(WAIT_SLICE));
        }
    }

    /// Borrow an object asynchronously, giving up after `timeout`
    pub async fn borrow_async(&self, timeout: Duration) -> ConnectionResult<PooledObject<T>> {
        tokio::time::timeout(timeout, async {
            loop {
                match self.try_borrow() {
                    Ok(Some(object)) => return Ok(object),
                    Ok(None) => {
                        tokio::time::sleep(WAIT_SLICE).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
        .await
        .map_err(|_| ConnectionError::Timeout(timeout))?
    }

    /// Destroy idle objects that timed out or no longer validate.
    ///
    /// Returns how many were destroyed.
    pub fn evict_idle(&self) -> usize {
        let shared = &self.shared;
        let now = Instant::now();
        let mut evicted = 0;
        let mut keep = Vec::new();

        while let Some(idle) = shared.idle.pop() {
            if shared.is_idle_expired(idle.idle_since, now) || !shared.factory.validate(&idle.value) {
                shared.destroy(idle.value);
                evicted += 1;
            } else {
                keep.push(idle);
            }
        }
        for idle in keep {
            if let Err(rejected) = shared.idle.push(idle) {
                shared.destroy(rejected.value);
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!(pool = %shared.name, evicted, "evicted idle pooled objects");
        }
        evicted
    }

    /// Refuse further borrows and destroy every idle object.
    ///
    /// Borrowed objects are destroyed when they come back.
    pub fn close(&self) -> usize {
        self.shared.closed.store(true, Ordering::Release);
        let drained = self.shared.drain();
        self.shared.returned.notify_all();
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.shared.idle.len()
    }

    /// Objects alive right now, idle or borrowed
    pub fn total_count(&self) -> usize {
        self.shared.total.load(Ordering::Acquire)
    }

    pub fn active_count(&self) -> usize {
        self.total_count().saturating_sub(self.idle_count())
    }

    pub fn max_size(&self) -> usize {
        self.shared.config.max_pool_size
    }

    pub fn created_count(&self) -> usize {
        self.shared.created.load(Ordering::Relaxed)
    }

    pub fn destroyed_count(&self) -> usize {
        self.shared.destroyed.load(Ordering::Relaxed)
    }

    fn reserve(&self) -> bool {
        let max = self.shared.config.max_pool_size;
        let mut current = self.shared.total.load(Ordering::Acquire);
        loop {
            if current >= max {
                return false;
            }
            match self.shared.total.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn wrap(&self, value: T, id: usize) -> PooledObject<T> {
        PooledObject::new(value, id, self.make_return_fn())
    }

    fn make_return_fn(&self) -> Arc<dyn Fn(T, usize) + Send + Sync> {
        let shared = Arc::clone(&self.shared);
        Arc::new(move |value, id| shared.give_back(value, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        next: AtomicUsize,
        fail: AtomicBool,
        reject: AtomicBool,
        destroyed: Mutex<Vec<usize>>,
    }

    impl PooledObjectFactory<usize> for Counter {
        fn create(&self) -> ConnectionResult<usize> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ConnectionError::Internal("create failed".to_string()));
            }
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }

        fn validate(&self, _object: &usize) -> bool {
            !self.reject.load(Ordering::SeqCst)
        }

        fn destroy(&self, object: usize) {
            self.destroyed.lock().push(object);
        }
    }

    fn pool(max: usize) -> (Arc<Counter>, ObjectPool<usize>) {
        let factory = Arc::new(Counter::default());
        let config = PoolConfiguration::new()
            .with_max_pool_size(max)
            .with_max_wait(Duration::from_millis(50));
        (Arc::clone(&factory), ObjectPool::new("test", factory, config))
    }

    #[test]
    fn test_object_returns_on_drop() {
        let (_, pool) = pool(2);

        {
            let object = pool.borrow(Duration::from_millis(10)).unwrap();
            assert_eq!(*object, 0);
            assert_eq!(pool.active_count(), 1);
        }

        assert_eq!(pool.idle_count(), 1);
        let again = pool.borrow(Duration::from_millis(10)).unwrap();
        assert_eq!(*again, 0);
        assert_eq!(pool.created_count(), 1);
    }

    #[test]
    fn test_full_pool_times_out() {
        let (_, pool) = pool(1);
        let _held = pool.borrow(Duration::from_millis(10)).unwrap();

        let result = pool.borrow(Duration::from_millis(30));

        assert!(matches!(result, Err(ConnectionError::Timeout(_))));
        assert!(pool.try_borrow().unwrap().is_none());
    }

    #[test]
    fn test_waiter_wakes_on_return() {
        let (_, pool) = pool(1);
        let pool = Arc::new(pool);
        let held = pool.borrow(Duration::from_millis(10)).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.borrow(Duration::from_secs(2)).map(|object| *object))
        };
        std::thread::sleep(Duration::from_millis(30));
        drop(held);

        assert_eq!(waiter.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_invalid_object_is_destroyed_not_reused() {
        let (factory, pool) = pool(2);
        drop(pool.borrow(Duration::from_millis(10)).unwrap());

        factory.reject.store(true, Ordering::SeqCst);
        assert_eq!(pool.evict_idle(), 1);
        assert_eq!(*factory.destroyed.lock(), vec![0]);

        factory.reject.store(false, Ordering::SeqCst);
        let fresh = pool.borrow(Duration::from_millis(10)).unwrap();
        assert_eq!(*fresh, 1);
    }

    #[test]
    fn test_idle_timeout_evicts() {
        let factory = Arc::new(Counter::default());
        let config = PoolConfiguration::new().with_idle_timeout(Duration::from_millis(1));
        let pool = ObjectPool::new("test", Arc::clone(&factory) as Arc<dyn PooledObjectFactory<usize>>, config);

        drop(pool.borrow(Duration::from_millis(10)).unwrap());
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(pool.evict_idle(), 1);
        assert_eq!(pool.total_count(), 0);
    }

    #[test]
    fn test_create_failure_releases_reservation() {
        let (factory, pool) = pool(1);
        factory.fail.store(true, Ordering::SeqCst);

        assert!(pool.borrow(Duration::from_millis(10)).is_err());
        assert_eq!(pool.total_count(), 0);

        factory.fail.store(false, Ordering::SeqCst);
        assert!(pool.borrow(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_close_destroys_idle_and_returning_objects() {
        let (factory, pool) = pool(2);
        let held = pool.borrow(Duration::from_millis(10)).unwrap();
        drop(pool.borrow(Duration::from_millis(10)).unwrap());

        assert_eq!(pool.close(), 1);
        assert!(matches!(pool.try_borrow(), Err(ConnectionError::PoolClosed(_))));

        drop(held);
        assert_eq!(pool.total_count(), 0);
        assert_eq!(factory.destroyed.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_async_borrow() {
        let (_, pool) = pool(1);

        let object = pool.borrow_async(Duration::from_millis(50)).await.unwrap();
        assert_eq!(*object, 0);

        let result = pool.borrow_async(Duration::from_millis(30)).await;
        assert!(matches!(result, Err(ConnectionError::Timeout(_))));
    }
}
