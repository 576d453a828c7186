#![forbid(unsafe_code)]

//! Background commit worker for batched trees.
//!
//! Trees register a weak [`CommitTarget`] and schedule themselves after
//! mutating. A single worker thread drains pending targets every interval,
//! on [`AsyncCommitter::flush`], and once more on shutdown.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::types::{Result, TesseraError};

/// Something the worker can flush.
pub trait CommitTarget: Send + Sync {
    /// Persists all pending changes.
    fn commit(&self) -> Result<()>;

    /// Short label used in logs.
    fn describe(&self) -> String;
}

/// Registration handle returned by [`AsyncCommitter::register`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct CommitTicket(u64);

/// Worker settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitOptions {
    /// Milliseconds between background drains.
    pub interval_ms: u64,
}

impl Default for CommitOptions {
    fn default() -> Self {
        Self { interval_ms: 500 }
    }
}

impl CommitOptions {
    /// Sets the drain interval.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval_ms = interval.as_millis() as u64;
        self
    }
}

/// Snapshot of committer activity.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitStatsSnapshot {
    /// Schedule requests received
    pub scheduled: u64,
    /// Successful target commits
    pub committed: u64,
    /// Failed target commits
    pub failed: u64,
    /// Drain rounds executed
    pub rounds: u64,
}

#[derive(Default)]
struct CommitStats {
    scheduled: AtomicU64,
    committed: AtomicU64,
    failed: AtomicU64,
    rounds: AtomicU64,
}

enum Message {
    Schedule(CommitTicket),
    Flush(Sender<Vec<String>>),
    Shutdown,
}

struct Shared {
    targets: Mutex<FxHashMap<CommitTicket, Weak<dyn CommitTarget>>>,
    failures: Mutex<Vec<String>>,
    stats: CommitStats,
}

struct Inner {
    sender: Mutex<Option<Sender<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
    next_ticket: AtomicU64,
}

/// Handle to the commit worker. Clones share one worker.
#[derive(Clone)]
pub struct AsyncCommitter {
    inner: Arc<Inner>,
}

impl AsyncCommitter {
    /// Spawns the worker thread.
    pub fn spawn(options: CommitOptions) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let shared = Arc::new(Shared {
            targets: Mutex::new(FxHashMap::default()),
            failures: Mutex::new(Vec::new()),
            stats: CommitStats::default(),
        });
        let interval = Duration::from_millis(options.interval_ms.max(1));
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("tessera-commit".into())
            .spawn(move || commit_loop(receiver, worker_shared, interval))?;
        info!(interval_ms = options.interval_ms, "commit.spawn");
        Ok(Self {
            inner: Arc::new(Inner {
                sender: Mutex::new(Some(sender)),
                worker: Mutex::new(Some(worker)),
                shared,
                next_ticket: AtomicU64::new(1),
            }),
        })
    }

    fn send(&self, message: Message) -> Result<()> {
        let sender = self.inner.sender.lock();
        let sender = sender.as_ref().ok_or(TesseraError::Closed("committer"))?;
        sender
            .send(message)
            .map_err(|_| TesseraError::Closed("committer"))
    }

    /// Registers a target. The committer never keeps it alive.
    pub fn register(&self, target: Weak<dyn CommitTarget>) -> CommitTicket {
        let ticket = CommitTicket(self.inner.next_ticket.fetch_add(1, AtomicOrdering::Relaxed));
        self.inner.shared.targets.lock().insert(ticket, target);
        debug!(ticket = ticket.0, "commit.register");
        ticket
    }

    /// Forgets a target; pending work for it is dropped.
    pub fn unregister(&self, ticket: CommitTicket) {
        self.inner.shared.targets.lock().remove(&ticket);
    }

    /// Number of live registrations.
    pub fn registered(&self) -> usize {
        self.inner.shared.targets.lock().len()
    }

    /// Marks a target as having pending changes.
    pub fn schedule(&self, ticket: CommitTicket) -> Result<()> {
        self.send(Message::Schedule(ticket))?;
        self.inner
            .shared
            .stats
            .scheduled
            .fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    /// Drains every pending target now and reports failures seen since the
    /// previous flush. Must not be called while holding a registered tree's lock.
    pub fn flush(&self) -> Result<()> {
        let (ack, done) = mpsc::channel();
        self.send(Message::Flush(ack))?;
        let failures = done.recv().map_err(|_| TesseraError::Closed("committer"))?;
        report(failures)
    }

    /// Drains pending work, stops the worker and waits for it. Later calls
    /// are no-ops; later schedules fail with [`TesseraError::Closed`].
    pub fn shutdown(&self) -> Result<()> {
        let Some(sender) = self.inner.sender.lock().take() else {
            return Ok(());
        };
        // A send failure means the worker already exited; joining reports why.
        let _ = sender.send(Message::Shutdown);
        drop(sender);
        if let Some(worker) = self.inner.worker.lock().take() {
            if !join_worker(worker) {
                return Err(TesseraError::Commit("commit worker panicked".into()));
            }
        }
        info!(stats = ?self.stats(), "commit.shutdown");
        let failures = std::mem::take(&mut *self.inner.shared.failures.lock());
        report(failures)
    }

    /// Returns whether [`AsyncCommitter::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        self.inner.sender.lock().is_none()
    }

    /// Activity counters.
    pub fn stats(&self) -> CommitStatsSnapshot {
        let stats = &self.inner.shared.stats;
        CommitStatsSnapshot {
            scheduled: stats.scheduled.load(AtomicOrdering::Relaxed),
            committed: stats.committed.load(AtomicOrdering::Relaxed),
            failed: stats.failed.load(AtomicOrdering::Relaxed),
            rounds: stats.rounds.load(AtomicOrdering::Relaxed),
        }
    }
}

impl fmt::Debug for AsyncCommitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCommitter")
            .field("registered", &self.registered())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.get_mut().take() {
            let _ = sender.send(Message::Shutdown);
            if let Some(worker) = self.worker.get_mut().take() {
                if !join_worker(worker) {
                    error!("commit.worker_panicked");
                }
            }
        }
    }
}

/// Waits for the worker to exit. A target committed on the worker may drop
/// the last handle, in which case the worker is left to finish on its own.
/// Returns false if the worker panicked.
fn join_worker(worker: JoinHandle<()>) -> bool {
    if worker.thread().id() == thread::current().id() {
        debug!("commit.worker_detached");
        return true;
    }
    worker.join().is_ok()
}

fn report(failures: Vec<String>) -> Result<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(TesseraError::Commit(failures.join("; ")))
    }
}

fn commit_loop(receiver: Receiver<Message>, shared: Arc<Shared>, interval: Duration) {
    let mut pending = BTreeSet::new();
    let mut next_drain = Instant::now() + interval;
    loop {
        let mut acks = Vec::new();
        let mut stop = false;
        let wait = next_drain.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(wait) {
            Ok(first) => {
                let mut batch = vec![first];
                while let Ok(more) = receiver.try_recv() {
                    batch.push(more);
                }
                for message in batch {
                    match message {
                        Message::Schedule(ticket) => {
                            pending.insert(ticket);
                        }
                        Message::Flush(ack) => acks.push(ack),
                        Message::Shutdown => stop = true,
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => stop = true,
        }

        if stop || !acks.is_empty() || Instant::now() >= next_drain {
            drain(&shared, &mut pending);
            next_drain = Instant::now() + interval;
        }
        if !acks.is_empty() {
            let failures = std::mem::take(&mut *shared.failures.lock());
            for ack in acks {
                let _ = ack.send(failures.clone());
            }
        }
        if stop {
            break;
        }
    }
    debug!("commit.worker_exit");
}

fn drain(shared: &Shared, pending: &mut BTreeSet<CommitTicket>) {
    if pending.is_empty() {
        return;
    }
    shared.stats.rounds.fetch_add(1, AtomicOrdering::Relaxed);
    for ticket in std::mem::take(pending) {
        let target = shared.targets.lock().get(&ticket).map(Weak::upgrade);
        let target = match target {
            Some(Some(target)) => target,
            Some(None) => {
                debug!(ticket = ticket.0, "commit.target_dropped");
                shared.targets.lock().remove(&ticket);
                continue;
            }
            None => continue,
        };
        match target.commit() {
            Ok(()) => {
                shared.stats.committed.fetch_add(1, AtomicOrdering::Relaxed);
            }
            Err(err) => {
                shared.stats.failed.fetch_add(1, AtomicOrdering::Relaxed);
                let label = target.describe();
                error!(target = %label, error = %err, "commit.failed");
                shared.failures.lock().push(format!("{label}: {err}"));
            }
        }
    }
}
