use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::types::{Result, TesseraError};

/// Creates and recycles pooled resources.
pub trait ResourceFactory<K, V>: Send + Sync {
    /// Builds a fresh resource for `key`.
    fn create(&self, key: &K) -> Result<V>;

    /// Prepares an idle resource before it is handed out again.
    fn reuse(&self, _key: &K, _resource: &mut V) {}
}

/// Counting semaphore with timed acquisition.
struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    fn acquire_until(&self, deadline: Instant) -> bool {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.cond.wait_until(&mut permits, deadline).timed_out() && *permits == 0 {
                return false;
            }
        }
        *permits -= 1;
        true
    }

    fn release(&self) {
        *self.permits.lock() += 1;
        self.cond.notify_one();
    }

    fn available(&self) -> usize {
        *self.permits.lock()
    }
}

/// Bounded pool: at most `max` resources are checked out at once.
///
/// Idle resources are reused before new ones are created. A failed creation
/// gives its permit back so the pool never shrinks because of an error.
pub struct ResourcePool<K, V> {
    max: usize,
    permits: Semaphore,
    idle: Mutex<Vec<V>>,
    factory: Box<dyn ResourceFactory<K, V>>,
}

impl<K, V> ResourcePool<K, V> {
    /// Creates a pool allowing `max` concurrent checkouts.
    pub fn new(max: usize, factory: impl ResourceFactory<K, V> + 'static) -> Self {
        Self {
            max,
            permits: Semaphore::new(max),
            idle: Mutex::new(Vec::new()),
            factory: Box::new(factory),
        }
    }

    /// Takes a resource, waiting up to `max_wait` for a free slot.
    pub fn get_resource(&self, key: &K, max_wait: Duration) -> Result<V> {
        if !self.permits.acquire_until(Instant::now() + max_wait) {
            debug!(max = self.max, wait_ms = max_wait.as_millis() as u64, "pool.timeout");
            return Err(TesseraError::LockTimeout {
                resource: format!("pooled resource (max {})", self.max),
                timeout_ms: max_wait.as_millis() as u64,
            });
        }
        let recycled = self.idle.lock().pop();
        match recycled {
            Some(mut resource) => {
                self.factory.reuse(key, &mut resource);
                trace!("pool.reuse");
                Ok(resource)
            }
            None => match self.factory.create(key) {
                Ok(resource) => {
                    trace!("pool.create");
                    Ok(resource)
                }
                Err(err) => {
                    self.permits.release();
                    Err(err)
                }
            },
        }
    }

    /// Returns a resource obtained from [`ResourcePool::get_resource`].
    pub fn return_resource(&self, resource: V) {
        self.idle.lock().push(resource);
        self.permits.release();
    }

    /// Checks out a resource that goes back to the pool when dropped.
    pub fn checkout(&self, key: &K, max_wait: Duration) -> Result<Pooled<'_, K, V>> {
        let resource = self.get_resource(key, max_wait)?;
        Ok(Pooled {
            pool: self,
            resource: Some(resource),
        })
    }

    /// Maximum concurrent checkouts.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.permits.available()
    }

    /// Resources waiting for reuse.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

/// A checked-out resource; returned to its pool on drop.
pub struct Pooled<'a, K, V> {
    pool: &'a ResourcePool<K, V>,
    resource: Option<V>,
}

impl<'a, K, V> Pooled<'a, K, V> {
    /// Removes the resource from pool accounting: the slot is freed but the
    /// resource is not recycled.
    pub fn detach(mut self) -> Option<V> {
        let resource = self.resource.take();
        self.pool.permits.release();
        resource
    }
}

impl<'a, K, V> Deref for Pooled<'a, K, V> {
    type Target = V;

    fn deref(&self) -> &V {
        // Only `detach` and `drop` take the resource, and both consume the guard.
        match &self.resource {
            Some(resource) => resource,
            None => unreachable!("pooled resource accessed after detach"),
        }
    }
}

impl<'a, K, V> DerefMut for Pooled<'a, K, V> {
    fn deref_mut(&mut self) -> &mut V {
        match &mut self.resource {
            Some(resource) => resource,
            None => unreachable!("pooled resource accessed after detach"),
        }
    }
}

impl<'a, K, V> Drop for Pooled<'a, K, V> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.return_resource(resource);
        }
    }
}
