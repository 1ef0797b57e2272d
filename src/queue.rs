use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Condvar, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::permission::PermissionTree;

/// Which side's copy is newer for a pending change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncSide {
    Local,
    Remote,
}

/// A single pending change discovered by [`crate::datasite_state::DatasiteState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeInfo {
    pub path: String,
    pub side_last_modified: SyncSide,
    pub date_last_modified: DateTime<Utc>,
    pub num_bytes: u64,
}

impl FileChangeInfo {
    /// Permission files always sort first (priority 0); everything else sorts by size,
    /// with a floor of 1 so a zero-byte file never ties with a permission file.
    pub fn priority(&self) -> u64 {
        if PermissionTree::is_permission_path(&self.path) {
            0
        } else {
            self.num_bytes.max(1)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncQueueItem {
    pub priority: u64,
    pub change: FileChangeInfo,
}

impl SyncQueueItem {
    pub fn new(change: FileChangeInfo) -> Self {
        Self {
            priority: change.priority(),
            change,
        }
    }
}

// BinaryHeap in std is a max-heap; we want the smallest (priority, path) dequeued
// first, so Ord is reversed relative to natural field order.
impl Ord for SyncQueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.change.path.cmp(&self.change.path))
    }
}

impl PartialOrd for SyncQueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<SyncQueueItem>,
    dedupe_set: HashSet<String>,
}

/// Thread-safe min-heap of pending change items keyed by `(priority, path)`,
/// deduplicated by path: a path already enqueued is never enqueued a second time
/// until it is dequeued (or [`SyncQueue::force_put`] explicitly replaces it).
#[derive(Clone)]
pub struct SyncQueue {
    inner: Arc<Mutex<Inner>>,
    not_empty: Arc<Condvar>,
}

impl Default for SyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            not_empty: Arc::new(Condvar::new()),
        }
    }

    /// Enqueues `item` unless its path is already pending. Returns `true` if enqueued.
    pub fn put(&self, item: FileChangeInfo) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.dedupe_set.contains(&item.path) {
            return false;
        }
        inner.dedupe_set.insert(item.path.clone());
        inner.heap.push(SyncQueueItem::new(item));
        self.not_empty.notify_one();
        true
    }

    /// Enqueues `item`, first removing any existing entry for the same path.
    pub fn force_put(&self, item: FileChangeInfo) {
        let mut inner = self.inner.lock().unwrap();
        inner.dedupe_set.insert(item.path.clone());
        inner.heap.retain(|existing| existing.change.path != item.path);
        inner.heap.push(SyncQueueItem::new(item));
        self.not_empty.notify_one();
    }

    /// Blocks until an item is available, then removes and returns it.
    pub fn get(&self) -> SyncQueueItem {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.heap.pop() {
                inner.dedupe_set.remove(&item.change.path);
                return item;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Non-blocking pop; `None` if empty.
    pub fn try_get(&self) -> Option<SyncQueueItem> {
        let mut inner = self.inner.lock().unwrap();
        let item = inner.heap.pop()?;
        inner.dedupe_set.remove(&item.change.path);
        Some(item)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.inner.lock().unwrap().dedupe_set.contains(path)
    }

    /// Snapshot of currently-queued paths, for the status dashboard.
    pub fn snapshot_paths(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .heap
            .iter()
            .map(|item| item.change.path.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(path: &str, num_bytes: u64) -> FileChangeInfo {
        FileChangeInfo {
            path: path.to_string(),
            side_last_modified: SyncSide::Local,
            date_last_modified: Utc::now(),
            num_bytes,
        }
    }

    #[test]
    fn permission_files_always_dequeue_first() {
        let q = SyncQueue::new();
        q.put(change("a@x.com/big.bin", 10_000));
        q.put(change("a@x.com/_.syftperm", 5));
        q.put(change("a@x.com/small.txt", 1));

        let first = q.get();
        assert_eq!(first.change.path, "a@x.com/_.syftperm");
        assert_eq!(first.priority, 0);
    }

    #[test]
    fn duplicate_path_is_not_enqueued_twice() {
        let q = SyncQueue::new();
        assert!(q.put(change("a@x.com/f.txt", 1)));
        assert!(!q.put(change("a@x.com/f.txt", 999)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn force_put_replaces_existing_entry() {
        let q = SyncQueue::new();
        q.put(change("a@x.com/f.txt", 1));
        q.force_put(change("a@x.com/f.txt", 999));
        assert_eq!(q.len(), 1);
        let item = q.get();
        assert_eq!(item.change.num_bytes, 999);
    }

    #[test]
    fn smaller_files_dequeue_before_larger_ones() {
        let q = SyncQueue::new();
        q.put(change("a@x.com/big.bin", 10_000));
        q.put(change("a@x.com/small.txt", 10));
        assert_eq!(q.get().change.path, "a@x.com/small.txt");
        assert_eq!(q.get().change.path, "a@x.com/big.bin");
    }
}
