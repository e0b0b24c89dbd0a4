//! The task data model.
//!
//! This module contains:
//! - `TaskId` / `TaskNode`: globally unique task identity and task-graph position
//! - `TaskFlags`: named boolean capabilities of a task
//! - `Task`: the mutable work record scheduled into lanes
//! - Wait primitives (cooperative await inside the runtime, spin-poll outside)

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::domain::DomainQuery;

/// Identifier of a node (process) in the cluster. Node ids start at 1;
/// 0 is reserved for the nil sentinel.
pub type NodeId = u32;

/// Identifier of one container (partition) of a pool.
pub type ContainerId = u32;

/// Identifier of an operation within a pool's dispatch table.
pub type MethodId = u32;

/// The constructor method of every container.
pub const METHOD_CREATE: MethodId = 0;
/// The destructor method of every container.
pub const METHOD_DESTROY: MethodId = 1;
/// Carried by flush sweep probes; only ever seen by `monitor`.
pub const METHOD_FLUSH: MethodId = 2;
/// Where user-defined methods should start.
pub const METHOD_USER: MethodId = 10;

/// Latency class of a task; selects the lane group and worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TaskPrio {
    /// Served by dedicated, continuously polling workers.
    #[default]
    LowLatency,
    /// Served by overlapped workers sharing cores.
    HighLatency,
}

/// A globally unique task identifier: (owning node, monotonic counter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TaskId {
    pub node: NodeId,
    pub unique: u64,
}

impl TaskId {
    pub fn new(node: NodeId, unique: u64) -> Self {
        Self { node, unique }
    }

    /// The nil sentinel id.
    pub fn nil() -> Self {
        Self { node: 0, unique: 0 }
    }

    pub fn is_nil(&self) -> bool {
        self.node == 0 && self.unique == 0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.unique)
    }
}

/// A pool identifier, allocated the same way as task ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PoolId {
    pub node: NodeId,
    pub unique: u64,
}

impl PoolId {
    pub fn new(node: NodeId, unique: u64) -> Self {
        Self { node, unique }
    }

    pub fn nil() -> Self {
        Self { node: 0, unique: 0 }
    }

    pub fn is_nil(&self) -> bool {
        self.node == 0 && self.unique == 0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.unique)
    }
}

/// A task's position in a dynamically spawned task graph.
///
/// All tasks spawned transitively from one root share `root`; `depth`
/// increments as subtasks are created, preventing priority inversion
/// across generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TaskNode {
    pub root: TaskId,
    pub depth: u32,
}

impl TaskNode {
    /// A new root node.
    pub fn root(root: TaskId) -> Self {
        Self { root, depth: 0 }
    }

    /// The node for a subtask spawned from this one.
    pub fn child(&self) -> Self {
        Self {
            root: self.root,
            depth: self.depth + 1,
        }
    }

    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    pub fn is_nil(&self) -> bool {
        self.root.is_nil()
    }
}

impl fmt::Display for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.root, self.depth)
    }
}

// ============================================================================
// Flags
// ============================================================================

/// Wait mask: the task was marked complete by its module.
pub const WAIT_MODULE_COMPLETE: u8 = 1 << 0;
/// Wait mask: the task fully completed inside the runtime.
pub const WAIT_COMPLETE: u8 = 1 << 1;

/// Named boolean capabilities of a task.
///
/// Scheduling-visible flags are individually atomic so producers, workers,
/// and RPC handlers can observe them without locking the task.
#[derive(Debug, Default)]
pub struct TaskFlags {
    /// Reads pool state.
    pub read: AtomicBool,
    /// Writes pool state.
    pub write: AtomicBool,
    /// Fundamentally updates pool state.
    pub update: AtomicBool,
    /// Executes as a cooperative coroutine (may suspend mid-run).
    pub coroutine: AtomicBool,
    /// Completion is not awaited by the caller; the runtime reclaims it.
    pub fire_and_forget: AtomicBool,
    /// Re-executed periodically until explicitly stopped.
    pub long_running: AtomicBool,
    /// Owns the data buffers referenced by its payload.
    pub data_owner: AtomicBool,
    /// Arrived from a remote node.
    pub remote: AtomicBool,
    /// Participates in a runtime flush.
    pub flush: AtomicBool,
    /// Currently parked waiting on sub-tasks.
    pub blocked: AtomicBool,
    /// Has begun execution at least once.
    pub started: AtomicBool,
    /// Fully completed inside the runtime.
    pub complete: AtomicBool,
    /// Marked complete by module code.
    pub module_complete: AtomicBool,
    /// On completion, the result must be shipped back to the origin node.
    pub signal_remote_complete: AtomicBool,
}

impl TaskFlags {
    fn get(flag: &AtomicBool) -> bool {
        flag.load(Ordering::Acquire)
    }

    fn set(flag: &AtomicBool, val: bool) {
        flag.store(val, Ordering::Release);
    }

    /// True when every flag named in `mask` is set.
    pub fn satisfies(&self, mask: u8) -> bool {
        if mask & WAIT_MODULE_COMPLETE != 0 && !Self::get(&self.module_complete) {
            return false;
        }
        if mask & WAIT_COMPLETE != 0 && !Self::get(&self.complete) {
            return false;
        }
        true
    }

    /// Serializable snapshot of the wire-visible flags.
    pub fn snapshot(&self) -> FlagSet {
        FlagSet {
            read: Self::get(&self.read),
            write: Self::get(&self.write),
            update: Self::get(&self.update),
            coroutine: Self::get(&self.coroutine),
            fire_and_forget: Self::get(&self.fire_and_forget),
            long_running: Self::get(&self.long_running),
            data_owner: Self::get(&self.data_owner),
            flush: Self::get(&self.flush),
        }
    }

    /// Restore a wire snapshot.
    pub fn restore(&self, set: &FlagSet) {
        Self::set(&self.read, set.read);
        Self::set(&self.write, set.write);
        Self::set(&self.update, set.update);
        Self::set(&self.coroutine, set.coroutine);
        Self::set(&self.fire_and_forget, set.fire_and_forget);
        Self::set(&self.long_running, set.long_running);
        Self::set(&self.data_owner, set.data_owner);
        Self::set(&self.flush, set.flush);
    }
}

/// The wire-visible flags of a task, as serialized into archives.
///
/// Run-state flags (blocked, started, complete, ...) never travel; a
/// deserialized task starts fresh on the receiving node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSet {
    pub read: bool,
    pub write: bool,
    pub update: bool,
    pub coroutine: bool,
    pub fire_and_forget: bool,
    pub long_running: bool,
    pub data_owner: bool,
    pub flush: bool,
}

// ============================================================================
// Run context
// ============================================================================

/// Scratch state used only while a task is inside the runtime.
#[derive(Default)]
pub struct RunContext {
    /// The worker currently executing the task.
    pub worker_id: Option<u32>,
    /// The task whose continuation is signaled when this one completes.
    pub pending_parent: Option<Arc<Task>>,
    /// Completion token on the origin node, for remote replicas.
    pub ret_token: Option<u64>,
    /// The node the result must be shipped back to.
    pub ret_node: Option<NodeId>,
    /// Number of sub-tasks currently blocking this task.
    pub block_count: usize,
}

#[derive(Debug, Default)]
struct PeriodState {
    period: Option<Duration>,
    last_run: Option<Instant>,
}

// ============================================================================
// Task
// ============================================================================

/// The unit of work scheduled by the runtime.
///
/// Tasks are shared via `Arc`, but exactly one logical owner frees the task
/// (via `Client::del_task`); a debug-build counter detects double frees.
pub struct Task {
    /// The target pool.
    pub pool: PoolId,
    /// The operation id within the pool's dispatch table.
    pub method: MethodId,
    /// Position in the task graph.
    pub node: TaskNode,
    /// Latency class.
    pub prio: TaskPrio,
    /// Named capabilities.
    pub flags: TaskFlags,
    /// Routing target; rewritten on replicas to the resolved local query.
    dom_query: parking_lot::RwLock<DomainQuery>,
    /// Periodic re-execution state.
    period: parking_lot::Mutex<PeriodState>,
    /// Module-typed payload; the owning container downcasts it.
    payload: parking_lot::Mutex<Option<Box<dyn Any + Send + Sync>>>,
    /// Scratch state used only during execution.
    ctx: parking_lot::Mutex<RunContext>,
    /// Wakes awaiting continuations when a flag set changes.
    notify: Notify,
    /// Debug-build delete counter; tripping it is a lifecycle violation.
    delcnt: AtomicI32,
}

impl Task {
    /// Create a task addressed to `(pool, method)` with the given routing.
    pub fn new(node: TaskNode, pool: PoolId, method: MethodId, dom_query: DomainQuery) -> Arc<Self> {
        Self::with_prio(node, pool, method, dom_query, TaskPrio::LowLatency)
    }

    /// Create a task with an explicit latency class.
    pub fn with_prio(
        node: TaskNode,
        pool: PoolId,
        method: MethodId,
        dom_query: DomainQuery,
        prio: TaskPrio,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            method,
            node,
            prio,
            flags: TaskFlags::default(),
            dom_query: parking_lot::RwLock::new(dom_query),
            period: parking_lot::Mutex::new(PeriodState::default()),
            payload: parking_lot::Mutex::new(None),
            ctx: parking_lot::Mutex::new(RunContext::default()),
            notify: Notify::new(),
            delcnt: AtomicI32::new(0),
        })
    }

    /// Current routing target.
    pub fn dom_query(&self) -> DomainQuery {
        *self.dom_query.read()
    }

    /// Rewrite the routing target (used when a replica is bound to its
    /// resolved destination).
    pub fn set_dom_query(&self, query: DomainQuery) {
        *self.dom_query.write() = query;
    }

    /// Access the run context.
    pub fn ctx(&self) -> parking_lot::MutexGuard<'_, RunContext> {
        self.ctx.lock()
    }

    // ------------------------------------------------------------------
    // Payload
    // ------------------------------------------------------------------

    /// Install the module payload.
    pub fn set_payload<P: Any + Send + Sync>(&self, payload: P) {
        *self.payload.lock() = Some(Box::new(payload));
    }

    /// Borrow the payload, downcast to the module's type.
    pub fn with_payload<P: Any + Send + Sync, R>(&self, f: impl FnOnce(&P) -> R) -> Option<R> {
        let guard = self.payload.lock();
        guard.as_ref().and_then(|p| p.downcast_ref::<P>()).map(f)
    }

    /// Mutably borrow the payload, downcast to the module's type.
    pub fn with_payload_mut<P: Any + Send + Sync, R>(
        &self,
        f: impl FnOnce(&mut P) -> R,
    ) -> Option<R> {
        let mut guard = self.payload.lock();
        guard.as_mut().and_then(|p| p.downcast_mut::<P>()).map(f)
    }

    /// Discard the payload without inspecting it.
    pub fn drop_payload(&self) {
        *self.payload.lock() = None;
    }

    /// Remove and return the payload.
    pub fn take_payload<P: Any + Send + Sync>(&self) -> Option<Box<P>> {
        let boxed = self.payload.lock().take()?;
        match boxed.downcast::<P>() {
            Ok(p) => Some(p),
            Err(other) => {
                // Wrong type requested; put it back untouched.
                *self.payload.lock() = Some(other);
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Mark the task complete from module code. Idempotent.
    pub fn set_module_complete(&self) {
        TaskFlags::set(&self.flags.module_complete, true);
        self.notify.notify_waiters();
    }

    pub fn is_module_complete(&self) -> bool {
        TaskFlags::get(&self.flags.module_complete)
    }

    pub fn unset_module_complete(&self) {
        TaskFlags::set(&self.flags.module_complete, false);
    }

    /// Mark the task fully complete (implies module-complete). Idempotent.
    pub fn set_complete(&self) {
        TaskFlags::set(&self.flags.module_complete, true);
        TaskFlags::set(&self.flags.complete, true);
        self.notify.notify_waiters();
    }

    pub fn is_complete(&self) -> bool {
        TaskFlags::get(&self.flags.complete)
    }

    pub fn is_fire_and_forget(&self) -> bool {
        TaskFlags::get(&self.flags.fire_and_forget)
    }

    pub fn set_fire_and_forget(&self) {
        TaskFlags::set(&self.flags.fire_and_forget, true);
    }

    pub fn unset_fire_and_forget(&self) {
        TaskFlags::set(&self.flags.fire_and_forget, false);
    }

    pub fn is_long_running(&self) -> bool {
        TaskFlags::get(&self.flags.long_running)
    }

    pub fn set_long_running(&self) {
        TaskFlags::set(&self.flags.long_running, true);
    }

    pub fn unset_long_running(&self) {
        TaskFlags::set(&self.flags.long_running, false);
    }

    pub fn is_coroutine(&self) -> bool {
        TaskFlags::get(&self.flags.coroutine)
    }

    pub fn set_coroutine(&self) {
        TaskFlags::set(&self.flags.coroutine, true);
    }

    pub fn is_data_owner(&self) -> bool {
        TaskFlags::get(&self.flags.data_owner)
    }

    pub fn set_data_owner(&self) {
        TaskFlags::set(&self.flags.data_owner, true);
    }

    pub fn unset_data_owner(&self) {
        TaskFlags::set(&self.flags.data_owner, false);
    }

    pub fn is_remote(&self) -> bool {
        TaskFlags::get(&self.flags.remote)
    }

    pub fn set_remote(&self) {
        TaskFlags::set(&self.flags.remote, true);
    }

    pub fn is_flush(&self) -> bool {
        TaskFlags::get(&self.flags.flush)
    }

    pub fn set_flush(&self) {
        TaskFlags::set(&self.flags.flush, true);
    }

    pub fn set_blocked(&self, count: usize) {
        self.ctx.lock().block_count = count;
        TaskFlags::set(&self.flags.blocked, true);
    }

    pub fn unset_blocked(&self) {
        self.ctx.lock().block_count = 0;
        TaskFlags::set(&self.flags.blocked, false);
    }

    pub fn is_blocked(&self) -> bool {
        TaskFlags::get(&self.flags.blocked)
    }

    pub fn set_started(&self) {
        TaskFlags::set(&self.flags.started, true);
    }

    pub fn is_started(&self) -> bool {
        TaskFlags::get(&self.flags.started)
    }

    pub fn set_signal_remote_complete(&self) {
        TaskFlags::set(&self.flags.signal_remote_complete, true);
    }

    pub fn should_signal_remote_complete(&self) -> bool {
        TaskFlags::get(&self.flags.signal_remote_complete)
    }

    // ------------------------------------------------------------------
    // Periodic execution
    // ------------------------------------------------------------------

    /// Set the re-execution period of a long-running task.
    pub fn set_period(&self, period: Duration) {
        self.period.lock().period = Some(period);
    }

    pub fn period(&self) -> Option<Duration> {
        self.period.lock().period
    }

    /// Whether a (possibly periodic) task is due to run.
    ///
    /// Non-long-running tasks always run. Long-running tasks run on first
    /// visit, unconditionally while flushing, and otherwise only once the
    /// period has elapsed since the last run. Records the run time.
    pub fn should_run(&self, now: Instant, flushing: bool) -> bool {
        if !self.is_long_running() {
            return true;
        }
        let mut state = self.period.lock();
        if !self.is_started() || flushing {
            state.last_run = Some(now);
            return true;
        }
        let due = match (state.period, state.last_run) {
            (Some(period), Some(last)) => now.duration_since(last) >= period,
            _ => true,
        };
        if due {
            state.last_run = Some(now);
        }
        due
    }

    // ------------------------------------------------------------------
    // Waiting
    // ------------------------------------------------------------------

    /// Wait until the flag mask is satisfied (default: module-complete).
    ///
    /// Inside the runtime this yields cooperatively to the worker loop;
    /// the awaiting continuation is resumed exactly where it suspended.
    pub async fn wait(&self) {
        self.wait_mask(WAIT_MODULE_COMPLETE).await;
    }

    /// Wait for an explicit flag mask.
    pub async fn wait_mask(&self, mask: u8) {
        loop {
            let notified = self.notify.notified();
            if self.flags.satisfies(mask) {
                return;
            }
            notified.await;
        }
    }

    /// Wait for a set of sub-tasks, marking this task blocked meanwhile.
    pub async fn wait_subtasks(&self, subtasks: &[Arc<Task>], mask: u8) {
        self.set_blocked(subtasks.len());
        for sub in subtasks {
            sub.wait_mask(mask).await;
        }
        self.unset_blocked();
    }

    /// Spin-poll the flag mask from outside the runtime.
    ///
    /// Used by callers that are not themselves tasks; pairs a seq-cst fence
    /// with the flag load so a completion on a worker thread is observed.
    pub fn wait_sync(&self, mask: u8) {
        loop {
            std::sync::atomic::fence(Ordering::SeqCst);
            if self.flags.satisfies(mask) {
                return;
            }
            std::thread::yield_now();
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle accounting
    // ------------------------------------------------------------------

    /// Record one logical free of this task.
    ///
    /// Exactly one owner may free a task; in debug builds a second free is
    /// a fatal lifecycle violation.
    pub fn record_free(&self) {
        let count = self.delcnt.fetch_add(1, Ordering::SeqCst) + 1;
        if cfg!(debug_assertions) && count != 1 {
            tracing::error!(
                task = %self.node,
                pool = %self.pool,
                method = self.method,
                count,
                "Task freed more than once"
            );
            panic!("task {} freed {} times", self.node, count);
        }
    }

    /// Number of times this task was freed (test instrumentation).
    pub fn free_count(&self) -> i32 {
        self.delcnt.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("node", &self.node)
            .field("pool", &self.pool)
            .field("method", &self.method)
            .field("dom_query", &*self.dom_query.read())
            .finish()
    }
}
