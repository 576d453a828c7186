use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::types::{Result, TesseraError};

/// Kind of lock requested on a resource.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum LockMode {
    /// Many holders at once, excluded by an exclusive holder.
    Shared,
    /// Single holder.
    Exclusive,
}

/// Tuning for [`LockManager`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    /// Wait used when the caller does not pass an explicit timeout.
    pub default_timeout_ms: u64,
    /// Initial capacity of the lock tables.
    pub concurrency_level: usize,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            concurrency_level: 64,
        }
    }
}

impl LockOptions {
    /// Overrides the default wait.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

/// Counters describing lock manager activity.
#[derive(Default, Debug, Clone, Copy)]
pub struct LockStatsSnapshot {
    /// Locks granted without waiting.
    pub immediate: u64,
    /// Locks granted after waiting on the resource queue.
    pub after_wait: u64,
    /// Shared locks promoted to exclusive.
    pub promotions: u64,
    /// Requests that gave up after their timeout.
    pub timeouts: u64,
}

#[derive(Default)]
struct LockStats {
    immediate: AtomicU64,
    after_wait: AtomicU64,
    promotions: AtomicU64,
    timeouts: AtomicU64,
}

/// Shared holders of one resource. The common single-holder case avoids a list.
enum SharedHolders<Q> {
    One(Q),
    Many(Vec<Q>),
}

impl<Q: Eq + Clone> SharedHolders<Q> {
    fn push(&mut self, requester: Q) {
        match self {
            SharedHolders::Many(list) => list.push(requester),
            SharedHolders::One(first) => {
                let first = first.clone();
                *self = SharedHolders::Many(vec![first, requester]);
            }
        }
    }

    fn is_only(&self, requester: &Q) -> bool {
        match self {
            SharedHolders::One(holder) => holder == requester,
            SharedHolders::Many(list) => list.iter().all(|holder| holder == requester),
        }
    }

    /// Removes one hold of `requester`. Returns `None` if it held nothing,
    /// otherwise whether the holder set is now empty.
    fn remove(&mut self, requester: &Q) -> Option<bool> {
        match self {
            SharedHolders::One(holder) if holder == requester => Some(true),
            SharedHolders::One(_) => None,
            SharedHolders::Many(list) => {
                let idx = list.iter().position(|holder| holder == requester)?;
                list.swap_remove(idx);
                Some(list.is_empty())
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            SharedHolders::One(_) => 1,
            SharedHolders::Many(list) => list.len(),
        }
    }
}

struct WaitQueue {
    cond: Arc<Condvar>,
    waiters: usize,
}

struct LockTable<R, Q> {
    shared: FxHashMap<R, SharedHolders<Q>>,
    exclusive: FxHashMap<R, Q>,
    queues: FxHashMap<R, WaitQueue>,
}

enum Grant {
    Immediate,
    Promoted,
    Busy,
}

impl<R, Q> LockTable<R, Q>
where
    R: Eq + Hash + Clone,
    Q: Eq + Clone,
{
    fn try_acquire(&mut self, requester: &Q, resource: &R, mode: LockMode) -> Grant {
        if self.exclusive.contains_key(resource) {
            return Grant::Busy;
        }
        match mode {
            LockMode::Shared => {
                match self.shared.get_mut(resource) {
                    Some(holders) => holders.push(requester.clone()),
                    None => {
                        self.shared
                            .insert(resource.clone(), SharedHolders::One(requester.clone()));
                    }
                }
                Grant::Immediate
            }
            LockMode::Exclusive => match self.shared.get(resource) {
                None => {
                    self.exclusive.insert(resource.clone(), requester.clone());
                    Grant::Immediate
                }
                Some(holders) if holders.is_only(requester) => {
                    self.shared.remove(resource);
                    self.exclusive.insert(resource.clone(), requester.clone());
                    Grant::Promoted
                }
                Some(_) => Grant::Busy,
            },
        }
    }

    fn enqueue(&mut self, resource: &R) -> Arc<Condvar> {
        let queue = self
            .queues
            .entry(resource.clone())
            .or_insert_with(|| WaitQueue {
                cond: Arc::new(Condvar::new()),
                waiters: 0,
            });
        queue.waiters += 1;
        Arc::clone(&queue.cond)
    }

    fn dequeue(&mut self, resource: &R) {
        if let Some(queue) = self.queues.get_mut(resource) {
            queue.waiters = queue.waiters.saturating_sub(1);
            if queue.waiters == 0 {
                self.queues.remove(resource);
            }
        }
    }

    fn wake(&self, resource: &R) {
        if let Some(queue) = self.queues.get(resource) {
            queue.cond.notify_all();
        }
    }
}

/// Per-resource shared/exclusive lock table with bounded waits.
///
/// A sole shared holder asking for an exclusive lock is promoted in place.
/// Waiters sleep on a queue owned by the resource and retry every time a
/// holder of that resource releases, until their deadline passes.
pub struct LockManager<R, Q> {
    table: Mutex<LockTable<R, Q>>,
    options: LockOptions,
    stats: LockStats,
}

impl<R, Q> LockManager<R, Q>
where
    R: Eq + Hash + Clone + Debug,
    Q: Eq + Clone + Debug,
{
    /// Creates an empty manager.
    pub fn new(options: LockOptions) -> Self {
        let cap = options.concurrency_level;
        Self {
            table: Mutex::new(LockTable {
                shared: FxHashMap::with_capacity_and_hasher(cap, Default::default()),
                exclusive: FxHashMap::with_capacity_and_hasher(cap, Default::default()),
                queues: FxHashMap::default(),
            }),
            options,
            stats: LockStats::default(),
        }
    }

    /// Configured default wait.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.options.default_timeout_ms)
    }

    /// Acquires `mode` on `resource` for `requester`, waiting at most
    /// `timeout` (or the configured default).
    pub fn acquire_lock(
        &self,
        requester: &Q,
        resource: &R,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let timeout = timeout.unwrap_or_else(|| self.default_timeout());
        let deadline = Instant::now() + timeout;
        let mut table = self.table.lock();
        let mut waited = false;
        loop {
            match table.try_acquire(requester, resource, mode) {
                Grant::Immediate => {
                    let counter = if waited {
                        &self.stats.after_wait
                    } else {
                        &self.stats.immediate
                    };
                    counter.fetch_add(1, AtomicOrdering::Relaxed);
                    trace!(?resource, ?requester, ?mode, "lock.acquired");
                    return Ok(());
                }
                Grant::Promoted => {
                    self.stats.promotions.fetch_add(1, AtomicOrdering::Relaxed);
                    trace!(?resource, ?requester, "lock.promoted");
                    return Ok(());
                }
                Grant::Busy => {}
            }
            if Instant::now() >= deadline {
                self.stats.timeouts.fetch_add(1, AtomicOrdering::Relaxed);
                debug!(
                    ?resource,
                    ?requester,
                    ?mode,
                    timeout_ms = timeout.as_millis() as u64,
                    "lock.timeout"
                );
                return Err(TesseraError::LockTimeout {
                    resource: format!("{mode:?} lock on {resource:?}"),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            let cond = table.enqueue(resource);
            cond.wait_until(&mut table, deadline);
            table.dequeue(resource);
            waited = true;
        }
    }

    /// Releases one hold of `mode` on `resource`.
    ///
    /// Fails with [`TesseraError::Lock`] when `requester` does not hold it.
    pub fn release_lock(&self, requester: &Q, resource: &R, mode: LockMode) -> Result<()> {
        let mut table = self.table.lock();
        match mode {
            LockMode::Shared => {
                let emptied = table
                    .shared
                    .get_mut(resource)
                    .and_then(|holders| holders.remove(requester))
                    .ok_or_else(|| {
                        TesseraError::Lock(format!(
                            "{requester:?} tried to release a shared lock on {resource:?} it does not hold"
                        ))
                    })?;
                if emptied {
                    table.shared.remove(resource);
                }
            }
            LockMode::Exclusive => match table.exclusive.get(resource) {
                Some(holder) if holder == requester => {
                    table.exclusive.remove(resource);
                }
                _ => {
                    return Err(TesseraError::Lock(format!(
                        "{requester:?} tried to release an exclusive lock on {resource:?} it does not hold"
                    )))
                }
            },
        }
        table.wake(resource);
        trace!(?resource, ?requester, ?mode, "lock.released");
        Ok(())
    }

    /// Acquires a lock that is released when the returned guard drops.
    pub fn lock(
        &self,
        requester: Q,
        resource: R,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<ResourceLock<'_, R, Q>> {
        self.acquire_lock(&requester, &resource, mode, timeout)?;
        Ok(ResourceLock {
            manager: self,
            requester,
            resource,
            mode,
        })
    }

    /// Number of shared holders and whether an exclusive holder exists.
    pub fn holders(&self, resource: &R) -> (usize, bool) {
        let table = self.table.lock();
        let shared = table.shared.get(resource).map_or(0, SharedHolders::len);
        (shared, table.exclusive.contains_key(resource))
    }

    /// Drops every held lock and wakes all waiters.
    pub fn clear(&self) {
        let mut table = self.table.lock();
        table.shared.clear();
        table.exclusive.clear();
        for queue in table.queues.values() {
            queue.cond.notify_all();
        }
    }

    /// Returns activity counters.
    pub fn stats(&self) -> LockStatsSnapshot {
        LockStatsSnapshot {
            immediate: self.stats.immediate.load(AtomicOrdering::Relaxed),
            after_wait: self.stats.after_wait.load(AtomicOrdering::Relaxed),
            promotions: self.stats.promotions.load(AtomicOrdering::Relaxed),
            timeouts: self.stats.timeouts.load(AtomicOrdering::Relaxed),
        }
    }
}

impl<R, Q> Default for LockManager<R, Q>
where
    R: Eq + Hash + Clone + Debug,
    Q: Eq + Clone + Debug,
{
    fn default() -> Self {
        Self::new(LockOptions::default())
    }
}

/// Guard returned by [`LockManager::lock`].
pub struct ResourceLock<'a, R, Q>
where
    R: Eq + Hash + Clone + Debug,
    Q: Eq + Clone + Debug,
{
    manager: &'a LockManager<R, Q>,
    requester: Q,
    resource: R,
    mode: LockMode,
}

impl<'a, R, Q> ResourceLock<'a, R, Q>
where
    R: Eq + Hash + Clone + Debug,
    Q: Eq + Clone + Debug,
{
    /// Mode held by this guard.
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl<'a, R, Q> Drop for ResourceLock<'a, R, Q>
where
    R: Eq + Hash + Clone + Debug,
    Q: Eq + Clone + Debug,
{
    fn drop(&mut self) {
        if let Err(err) = self
            .manager
            .release_lock(&self.requester, &self.resource, self.mode)
        {
            debug!(error = %err, "lock.guard_release_failed");
        }
    }
}
