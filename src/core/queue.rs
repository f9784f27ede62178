/// Bounded pending-operation queue
///
/// Each connection owns two of these: one for requests that have not been written
/// yet and one for requests waiting on a reply. Producers that find the queue full
/// are suspended rather than refused, so a slow server throttles its callers instead
/// of growing memory without bound.
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Number of scheduler yields a low-latency waiter makes before parking.
const SPIN_LIMIT: usize = 64;

/// How a waiter behaves while the queue is empty (consumer) or full (producer)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    /// Park immediately until notified
    Mutex,
    /// Re-check a bounded number of times, yielding to the scheduler, before parking
    LowLatencySpin,
}

struct Inner<T> {
    entries: VecDeque<T>,
    closed: bool,
}

/// Thread-safe bounded FIFO with blocking and non-blocking access
pub struct PendingQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    lock_type: LockType,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> PendingQueue<T> {
    pub fn new(capacity: usize, lock_type: LockType) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            capacity: capacity.max(1),
            lock_type,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        // Entries are plain data; a panicking holder cannot leave them half-updated.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn should_spin(&self, spins: &mut usize) -> bool {
        if self.lock_type == LockType::LowLatencySpin && *spins < SPIN_LIMIT {
            *spins += 1;
            true
        } else {
            false
        }
    }

    /// Add an entry without waiting.
    ///
    /// Hands the entry back if the queue is full or closed.
    pub fn offer(&self, entry: T) -> Result<(), T> {
        let mut inner = self.lock();
        if inner.closed || inner.entries.len() >= self.capacity {
            return Err(entry);
        }
        inner.entries.push_back(entry);
        let room_left = inner.entries.len() < self.capacity;
        drop(inner);

        self.not_empty.notify_one();
        if room_left {
            self.not_full.notify_one();
        }
        Ok(())
    }

    /// Add an entry, waiting while the queue is at capacity.
    ///
    /// Fails only when the queue has been closed, returning the entry.
    pub async fn put(&self, mut entry: T) -> Result<(), T> {
        let mut spins = 0;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.offer(entry) {
                Ok(()) => return Ok(()),
                Err(rejected) if self.is_closed() => return Err(rejected),
                Err(rejected) => entry = rejected,
            }

            if self.should_spin(&mut spins) {
                tokio::task::yield_now().await;
                continue;
            }
            notified.await;
        }
    }

    /// Add several entries as one contiguous run.
    ///
    /// Waits until all of them fit. A run longer than the capacity is admitted once
    /// the queue is empty so it cannot wait forever.
    pub async fn put_all(&self, entries: Vec<T>) -> Result<(), Vec<T>> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut entries = Some(entries);
        let mut spins = 0;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                let batch = entries.take().unwrap_or_default();
                if inner.closed {
                    return Err(batch);
                }
                let fits = inner.entries.len() + batch.len() <= self.capacity
                    || inner.entries.is_empty();
                if fits {
                    inner.entries.extend(batch);
                    drop(inner);
                    self.not_empty.notify_one();
                    return Ok(());
                }
                entries = Some(batch);
            }

            if self.should_spin(&mut spins) {
                tokio::task::yield_now().await;
                continue;
            }
            notified.await;
        }
    }

    /// Remove the head entry without waiting.
    pub fn poll(&self) -> Option<T> {
        let mut inner = self.lock();
        let entry = inner.entries.pop_front()?;
        let more = !inner.entries.is_empty();
        drop(inner);

        self.not_full.notify_one();
        if more {
            self.not_empty.notify_one();
        }
        Some(entry)
    }

    /// Remove the head entry, waiting until one exists.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn take(&self) -> Option<T> {
        let mut spins = 0;
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.poll() {
                return Some(entry);
            }
            if self.is_closed() {
                return None;
            }

            if self.should_spin(&mut spins) {
                tokio::task::yield_now().await;
                continue;
            }
            notified.await;
        }
    }

    /// Atomically remove every entry into `out`, returning how many were moved.
    pub fn drain_to(&self, out: &mut Vec<T>) -> usize {
        let mut inner = self.lock();
        let count = inner.entries.len();
        out.extend(inner.entries.drain(..));
        drop(inner);

        if count > 0 {
            self.not_full.notify_waiters();
        }
        count
    }

    /// Refuse further puts and wake every waiter. Remaining entries stay drainable.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Advisory number of entries
    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    /// Advisory emptiness check
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
