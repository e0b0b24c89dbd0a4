//! Lanes: ordered per-container work queues.
//!
//! A lane is a multi-producer, single-consumer queue of task references
//! bound to exactly one worker at a time. Tasks in one lane execute in FIFO
//! submission order; cross-lane ordering is not guaranteed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::task::{ContainerId, PoolId, Task, TaskId, TaskPrio};

/// Result type for lane operations.
pub type Result<T> = std::result::Result<T, LaneError>;

/// Errors that can occur emplacing into a lane.
#[derive(Debug, thiserror::Error)]
pub enum LaneError {
    #[error("Lane {0} queue is full")]
    Full(u32),

    #[error("Lane {0} is closed")]
    Closed(u32),
}

/// Identifier of a lane within its container.
pub type LaneId = u32;

/// A single-consumer queue of tasks bound to one worker.
#[derive(Debug)]
pub struct Lane {
    id: LaneId,
    pool: PoolId,
    container: ContainerId,
    prio: TaskPrio,
    tx: mpsc::Sender<Arc<Task>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Task>>>,
    /// Worker the lane is currently bound to; -1 while unassigned.
    worker: AtomicI64,
    /// Entries currently queued (load accounting).
    queued: AtomicUsize,
    /// Entries dequeued over the lane's lifetime.
    popped: AtomicUsize,
    /// In-flight task ids with reference counts.
    active: parking_lot::Mutex<HashMap<TaskId, usize>>,
    /// While > 0, dequeuing pauses; queued entries are retained.
    plug_count: AtomicUsize,
}

impl Lane {
    pub fn new(id: LaneId, pool: PoolId, container: ContainerId, prio: TaskPrio, depth: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(depth);
        Arc::new(Self {
            id,
            pool,
            container,
            prio,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            worker: AtomicI64::new(-1),
            queued: AtomicUsize::new(0),
            popped: AtomicUsize::new(0),
            active: parking_lot::Mutex::new(HashMap::new()),
            plug_count: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> LaneId {
        self.id
    }

    pub fn pool(&self) -> PoolId {
        self.pool
    }

    pub fn container(&self) -> ContainerId {
        self.container
    }

    pub fn prio(&self) -> TaskPrio {
        self.prio
    }

    /// The worker this lane is bound to, once assigned.
    pub fn worker(&self) -> Option<u32> {
        let id = self.worker.load(Ordering::Acquire);
        (id >= 0).then_some(id as u32)
    }

    /// Bind the lane to a worker; load accounting attributes to this id.
    pub fn bind_worker(&self, worker_id: u32) {
        self.worker.store(worker_id as i64, Ordering::Release);
        debug!(lane = self.id, worker = worker_id, "Bound lane to worker");
    }

    // ------------------------------------------------------------------
    // Producing
    // ------------------------------------------------------------------

    /// Append a task to the lane. Any thread may produce concurrently.
    pub fn emplace(&self, task: Arc<Task>) -> Result<()> {
        match self.tx.try_send(task) {
            Ok(()) => {
                self.queued.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(LaneError::Full(self.id)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(LaneError::Closed(self.id)),
        }
    }

    /// Emplace with cooperative back-off while the queue is full.
    pub async fn emplace_yielding(&self, task: Arc<Task>) -> Result<()> {
        loop {
            match self.emplace(Arc::clone(&task)) {
                Ok(()) => return Ok(()),
                Err(LaneError::Full(_)) => tokio::task::yield_now().await,
                Err(err) => return Err(err),
            }
        }
    }

    // ------------------------------------------------------------------
    // Consuming (bound worker only)
    // ------------------------------------------------------------------

    /// Dequeue the next task if one is ready and the lane is not plugged.
    pub fn try_pop(&self) -> Option<Arc<Task>> {
        if self.is_plugged() {
            return None;
        }
        let mut rx = self.rx.try_lock().ok()?;
        match rx.try_recv() {
            Ok(task) => {
                self.queued.fetch_sub(1, Ordering::AcqRel);
                self.popped.fetch_add(1, Ordering::AcqRel);
                Some(task)
            }
            Err(_) => None,
        }
    }

    // ------------------------------------------------------------------
    // Active-set accounting
    // ------------------------------------------------------------------

    /// Record a task as in-flight; reentrant per task id.
    pub fn set_active(&self, id: TaskId) {
        *self.active.lock().entry(id).or_insert(0) += 1;
    }

    /// Release one in-flight reference.
    pub fn unset_active(&self, id: TaskId) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                active.remove(&id);
            }
        }
    }

    /// Whether the task id is already in flight on this lane. Guards
    /// against a task blocking on a sub-task active in its own lane.
    pub fn is_active(&self, id: TaskId) -> bool {
        self.active.lock().contains_key(&id)
    }

    pub fn num_active(&self) -> usize {
        self.active.lock().len()
    }

    // ------------------------------------------------------------------
    // Plugging
    // ------------------------------------------------------------------

    pub fn is_plugged(&self) -> bool {
        self.plug_count.load(Ordering::Acquire) > 0
    }

    /// Pause dequeuing without losing queued entries.
    pub fn plug(&self) {
        self.plug_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Resume dequeuing once all pluggers release.
    pub fn unplug(&self) {
        self.plug_count.fetch_sub(1, Ordering::AcqRel);
    }

    // ------------------------------------------------------------------
    // Load
    // ------------------------------------------------------------------

    /// Outstanding work on this lane: queued plus in-flight entries.
    pub fn load(&self) -> usize {
        self.queued.load(Ordering::Acquire) + self.num_active()
    }

    pub fn num_queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Entries dequeued since the lane was created.
    pub fn num_popped(&self) -> usize {
        self.popped.load(Ordering::Acquire)
    }
}

/// A named collection of lanes for one container.
pub struct LaneGroup {
    lanes: Vec<Arc<Lane>>,
}

impl LaneGroup {
    pub fn new(
        pool: PoolId,
        container: ContainerId,
        count: u32,
        prio: TaskPrio,
        depth: usize,
    ) -> Self {
        let lanes = (0..count)
            .map(|id| Lane::new(id, pool, container, prio, depth))
            .collect();
        Self { lanes }
    }

    pub fn lanes(&self) -> &[Arc<Lane>] {
        &self.lanes
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Select a lane by hash of a routing key (affinity).
    pub fn by_hash(&self, hash: u32) -> &Arc<Lane> {
        &self.lanes[hash as usize % self.lanes.len()]
    }

    /// Select the least-loaded lane (load balancing).
    pub fn least_loaded(&self) -> &Arc<Lane> {
        self.lanes
            .iter()
            .min_by_key(|lane| lane.load())
            .expect("lane group is never empty")
    }

    /// Sum of lane loads.
    pub fn load(&self) -> usize {
        self.lanes.iter().map(|lane| lane.load()).sum()
    }
}

#[cfg(test)]
mod tests;
