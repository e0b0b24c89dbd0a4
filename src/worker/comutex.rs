//! Task-aware reentrant mutex.
//!
//! A `CoMutex` is held by a task *graph*, not an OS thread: every task
//! sharing a root acquires recursively, so a task never deadlocks against
//! its own sub-tasks. Waiters from other graphs park per-graph and are
//! admitted a whole graph at a time, FIFO by first arrival.

use std::collections::VecDeque;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::task::{TaskId, TaskNode};

struct WaitGroup {
    root: TaskId,
    waiters: Vec<oneshot::Sender<()>>,
}

#[derive(Default)]
struct Inner {
    /// Root of the graph currently holding the lock.
    holder: Option<TaskId>,
    /// Recursive hold count across the holding graph.
    rep: usize,
    /// Parked graphs, FIFO by first arrival.
    blocked: VecDeque<WaitGroup>,
}

/// A reentrant mutex keyed by task-graph root.
#[derive(Default)]
pub struct CoMutex {
    inner: parking_lot::Mutex<Inner>,
}

impl CoMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire on behalf of `node`'s graph. Reentrant within one graph;
    /// other graphs suspend until the holder fully releases.
    pub async fn lock(&self, node: &TaskNode) {
        let root = node.root;
        let rx = {
            let mut inner = self.inner.lock();
            match inner.holder {
                None => {
                    inner.holder = Some(root);
                    inner.rep = 1;
                    return;
                }
                Some(holder) if holder == root => {
                    inner.rep += 1;
                    return;
                }
                Some(_) => {
                    let (tx, rx) = oneshot::channel();
                    match inner.blocked.iter_mut().find(|g| g.root == root) {
                        Some(group) => group.waiters.push(tx),
                        None => inner.blocked.push_back(WaitGroup {
                            root,
                            waiters: vec![tx],
                        }),
                    }
                    rx
                }
            }
        };
        // The releasing side transfers ownership before signaling, so a
        // dropped sender can only mean the mutex itself went away.
        let _ = rx.await;
    }

    /// Release one hold. When the holding graph's count reaches zero the
    /// next parked graph is admitted, all of its waiters at once.
    pub fn unlock(&self, node: &TaskNode) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.holder, Some(node.root));
        inner.rep = inner.rep.saturating_sub(1);
        if inner.rep > 0 {
            return;
        }
        match inner.blocked.pop_front() {
            None => {
                inner.holder = None;
            }
            Some(group) => {
                inner.holder = Some(group.root);
                inner.rep = group.waiters.len();
                for tx in group.waiters {
                    let _ = tx.send(());
                }
            }
        }
    }

    /// Acquire without waiting, if free or already held by this graph.
    pub fn try_lock(&self, node: &TaskNode) -> bool {
        let mut inner = self.inner.lock();
        match inner.holder {
            None => {
                inner.holder = Some(node.root);
                inner.rep = 1;
                true
            }
            Some(holder) if holder == node.root => {
                inner.rep += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Root of the graph currently holding the lock, if any.
    pub fn holder(&self) -> Option<TaskId> {
        self.inner.lock().holder
    }
}

/// A keyed collection of `CoMutex`es, created on first use.
pub struct CoMutexTable<K: Eq + Hash> {
    locks: parking_lot::Mutex<HashMap<K, Arc<CoMutex>>>,
}

impl<K: Eq + Hash> Default for CoMutexTable<K> {
    fn default() -> Self {
        Self {
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> CoMutexTable<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mutex for `key`, created if absent.
    pub fn get(&self, key: &K) -> Arc<CoMutex> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}
