//! Per-key asynchronous reader/writer lock with writer preference.
//!
//! Any number of readers may hold a key together; a writer holds it alone.
//! When a key is released, queued writers are served before queued readers,
//! and a reader that arrives while a writer is queued waits behind it, so a
//! steady stream of readers cannot starve writers.
//!
//! Grants are delivered to waiters as guards through a oneshot channel. If
//! the waiting future was dropped, the send fails and the grant is rolled back
//! under the table lock; a guard that was delivered but never observed is
//! released when the channel drops it. Locks never time out: callers must not
//! take a second key while holding the first.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

#[derive(Default)]
struct LockEntry {
    readers: usize,
    writer: bool,
    waiting_writers: VecDeque<oneshot::Sender<WriteGuard>>,
    waiting_readers: VecDeque<oneshot::Sender<ReadGuard>>,
}

impl LockEntry {
    fn is_idle(&self) -> bool {
        self.readers == 0
            && !self.writer
            && self.waiting_writers.is_empty()
            && self.waiting_readers.is_empty()
    }
}

#[derive(Default)]
struct LockTable {
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl LockTable {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, LockEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared guard for a key; releases on drop.
#[must_use = "the read lock is released as soon as the guard is dropped"]
pub struct ReadGuard {
    table: Arc<LockTable>,
    key: String,
    armed: bool,
}

/// Exclusive guard for a key; releases on drop.
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct WriteGuard {
    table: Arc<LockTable>,
    key: String,
    armed: bool,
}

impl ReadGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl WriteGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for ReadGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadGuard").field("key", &self.key).finish()
    }
}

impl std::fmt::Debug for WriteGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteGuard").field("key", &self.key).finish()
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let table = self.table.clone();
        let mut entries = table.entries();
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.readers = entry.readers.saturating_sub(1);
            tracing::trace!(key = %self.key, readers = entry.readers, "read lock released");
            wake(&table, entry, &self.key);
            if entry.is_idle() {
                entries.remove(&self.key);
            }
        }
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let table = self.table.clone();
        let mut entries = table.entries();
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.writer = false;
            tracing::trace!(key = %self.key, "write lock released");
            wake(&table, entry, &self.key);
            if entry.is_idle() {
                entries.remove(&self.key);
            }
        }
    }
}

/// Hand the key to the next waiters. Must be called with the table locked.
fn wake(table: &Arc<LockTable>, entry: &mut LockEntry, key: &str) {
    if entry.writer {
        return;
    }
    if entry.readers == 0 {
        while let Some(tx) = entry.waiting_writers.pop_front() {
            entry.writer = true;
            let guard = WriteGuard {
                table: table.clone(),
                key: key.to_string(),
                armed: true,
            };
            match tx.send(guard) {
                Ok(()) => {
                    tracing::trace!(key, "write lock granted to waiter");
                    return;
                }
                Err(mut guard) => {
                    // Waiter went away before the grant.
                    guard.armed = false;
                    entry.writer = false;
                }
            }
        }
    } else if !entry.waiting_writers.is_empty() {
        return;
    }

    while let Some(tx) = entry.waiting_readers.pop_front() {
        entry.readers += 1;
        let guard = ReadGuard {
            table: table.clone(),
            key: key.to_string(),
            armed: true,
        };
        if let Err(mut guard) = tx.send(guard) {
            guard.armed = false;
            entry.readers -= 1;
        }
    }
}

/// Keyed reader/writer lock. Cheap to clone; clones share the key table.
#[derive(Clone, Default)]
pub struct FairLock {
    table: Arc<LockTable>,
}

impl std::fmt::Debug for FairLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FairLock")
            .field("tracked_keys", &self.table.entries().len())
            .finish()
    }
}

impl FairLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a shared lock on `key`, waiting behind any active or queued writer.
    pub async fn read(&self, key: impl Into<String>) -> ReadGuard {
        let key = key.into();
        loop {
            let rx = {
                let mut entries = self.table.entries();
                let entry = entries.entry(key.clone()).or_default();
                if !entry.writer && entry.waiting_writers.is_empty() {
                    entry.readers += 1;
                    return ReadGuard {
                        table: self.table.clone(),
                        key,
                        armed: true,
                    };
                }
                let (tx, rx) = oneshot::channel();
                entry.waiting_readers.push_back(tx);
                rx
            };
            if let Ok(guard) = rx.await {
                return guard;
            }
        }
    }

    /// Acquire an exclusive lock on `key`.
    pub async fn write(&self, key: impl Into<String>) -> WriteGuard {
        let key = key.into();
        loop {
            let rx = {
                let mut entries = self.table.entries();
                let entry = entries.entry(key.clone()).or_default();
                if !entry.writer && entry.readers == 0 && entry.waiting_writers.is_empty() {
                    entry.writer = true;
                    return WriteGuard {
                        table: self.table.clone(),
                        key,
                        armed: true,
                    };
                }
                let (tx, rx) = oneshot::channel();
                entry.waiting_writers.push_back(tx);
                rx
            };
            if let Ok(guard) = rx.await {
                return guard;
            }
        }
    }

    /// Whether the table currently holds an entry for `key`.
    pub fn is_tracked(&self, key: &str) -> bool {
        self.table.entries().contains_key(key)
    }

    /// Number of keys with holders or waiters.
    pub fn tracked_keys(&self) -> usize {
        self.table.entries().len()
    }
}
