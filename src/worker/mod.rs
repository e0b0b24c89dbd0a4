//! Workers and the work orchestrator.
//!
//! This module contains:
//! - `WorkerKind`: dedicated (continuously polling) vs overlapped (paced)
//! - the worker loop: pops tasks off bound lanes and drives module methods
//! - `WorkOrchestrator`: spawns workers, assigns lanes round-robin by
//!   latency class, and tracks per-worker load
//! - `comutex`: task-graph-aware reentrant locking for module state

pub mod comutex;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::lane::Lane;
use crate::pool::{ContainerBase, ContainerModule, ModuleRegistry};
use crate::task::{Task, TaskPrio};

/// Tasks popped from one lane per scheduling pass, bounding how long one
/// busy lane can starve its siblings on the same worker.
const LANE_BATCH: usize = 16;

/// How a worker spends idle cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Polls continuously; serves low-latency lanes.
    Dedicated,
    /// Sleeps between passes; serves high-latency lanes.
    Overlapped,
}

/// Shared execution context handed to every worker.
#[derive(Clone)]
struct WorkerCtx {
    registry: Arc<ModuleRegistry>,
    /// Completed remote-origin tasks, consumed by the remote completer.
    complete_tx: mpsc::UnboundedSender<Arc<Task>>,
    flushing: Arc<AtomicBool>,
    kill: Arc<AtomicBool>,
    /// Overlapped-worker idle sleep.
    idle: Duration,
    /// Re-poll interval for parked long-running tasks.
    poll: Duration,
}

struct WorkerHandle {
    id: u32,
    kind: WorkerKind,
    lane_tx: mpsc::UnboundedSender<Arc<Lane>>,
    /// Lanes assigned so far, kept for load accounting.
    lanes: parking_lot::Mutex<Vec<Arc<Lane>>>,
}

// ============================================================================
// Task execution
// ============================================================================

async fn exec_once(module: &Arc<dyn ContainerModule>, task: &Arc<Task>) {
    if let Err(err) = module.run(task.method, task).await {
        // A failed method still completes, so waiters are not stranded.
        warn!(
            task = %task.node,
            pool = %task.pool,
            method = task.method,
            error = %err,
            "Module method failed"
        );
        task.set_module_complete();
    }
}

fn finish(ctx: &WorkerCtx, module: &Arc<dyn ContainerModule>, task: Arc<Task>) {
    if task.should_signal_remote_complete() {
        // The remote completer ships outputs home and marks full completion.
        if ctx.complete_tx.send(task).is_err() {
            error!("Remote completer channel closed; dropping completion");
        }
        return;
    }
    task.set_complete();
    if task.is_fire_and_forget() {
        module.del(task.method, &task);
        task.record_free();
    }
}

/// Run a coroutine or long-running task off the lane, so the lane's other
/// tasks keep flowing while it suspends or waits out its period.
async fn run_detached(ctx: WorkerCtx, module: Arc<dyn ContainerModule>, task: Arc<Task>) {
    loop {
        let flushing = ctx.flushing.load(Ordering::Acquire);
        if task.should_run(Instant::now(), flushing) {
            exec_once(&module, &task).await;
            task.set_started();
        }
        if task.is_module_complete() || !task.is_long_running() || ctx.kill.load(Ordering::Acquire)
        {
            break;
        }
        tokio::time::sleep(ctx.poll).await;
    }
    if !task.is_module_complete() {
        task.set_module_complete();
    }
    finish(&ctx, &module, task);
}

async fn run_task(ctx: &WorkerCtx, worker_id: u32, lane: &Arc<Lane>, task: Arc<Task>) {
    let Some(container) = task.dom_query().container_id() else {
        error!(task = %task.node, "Task reached a worker with an unresolved query");
        task.set_complete();
        return;
    };
    let module = match ctx.registry.get_container(task.pool, container).await {
        Ok(module) => module,
        Err(err) => {
            warn!(task = %task.node, error = %err, "No container for task");
            task.set_complete();
            return;
        }
    };
    task.ctx().worker_id = Some(worker_id);

    if task.is_coroutine() || task.is_long_running() {
        // Detached tasks do not hold the lane and do not count toward
        // flushable load.
        tokio::spawn(run_detached(ctx.clone(), module, task));
        return;
    }

    lane.set_active(task.node.root);
    task.set_started();
    exec_once(&module, &task).await;
    if !task.is_module_complete() {
        task.set_module_complete();
    }
    lane.unset_active(task.node.root);
    finish(ctx, &module, task);
}

async fn worker_loop(
    id: u32,
    kind: WorkerKind,
    ctx: WorkerCtx,
    mut lane_rx: mpsc::UnboundedReceiver<Arc<Lane>>,
) {
    let mut lanes: Vec<Arc<Lane>> = Vec::new();
    info!(worker = id, ?kind, "Worker started");
    loop {
        while let Ok(lane) = lane_rx.try_recv() {
            lane.bind_worker(id);
            lanes.push(lane);
        }
        let mut did_work = false;
        for lane in &lanes {
            for _ in 0..LANE_BATCH {
                let Some(task) = lane.try_pop() else { break };
                did_work = true;
                run_task(&ctx, id, lane, task).await;
            }
        }
        if did_work {
            tokio::task::yield_now().await;
            continue;
        }
        if ctx.kill.load(Ordering::Acquire) {
            break;
        }
        match kind {
            WorkerKind::Dedicated => tokio::task::yield_now().await,
            WorkerKind::Overlapped => tokio::time::sleep(ctx.idle).await,
        }
    }
    info!(worker = id, "Worker stopped");
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Spawns the worker set and assigns lanes to workers.
///
/// Low-latency lanes go to dedicated workers, high-latency lanes to
/// overlapped workers, each round-robin so container lanes spread evenly.
pub struct WorkOrchestrator {
    workers: Vec<WorkerHandle>,
    dedicated: Vec<usize>,
    overlapped: Vec<usize>,
    rr_low: AtomicUsize,
    rr_high: AtomicUsize,
    kill: Arc<AtomicBool>,
    flushing: Arc<AtomicBool>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkOrchestrator {
    /// Spawn workers per the config and return the orchestrator.
    pub fn spawn(
        config: &WorkerConfig,
        registry: Arc<ModuleRegistry>,
        complete_tx: mpsc::UnboundedSender<Arc<Task>>,
    ) -> Self {
        let kill = Arc::new(AtomicBool::new(false));
        let flushing = Arc::new(AtomicBool::new(false));
        let ctx = WorkerCtx {
            registry,
            complete_tx,
            flushing: Arc::clone(&flushing),
            kill: Arc::clone(&kill),
            idle: config.idle_sleep(),
            poll: config.poll_interval(),
        };

        let mut workers = Vec::new();
        let mut dedicated = Vec::new();
        let mut overlapped = Vec::new();
        let mut handles = Vec::new();
        let total = config.dedicated + config.overlapped;
        for id in 0..total {
            let kind = if (id as usize) < config.dedicated as usize {
                WorkerKind::Dedicated
            } else {
                WorkerKind::Overlapped
            };
            let (lane_tx, lane_rx) = mpsc::unbounded_channel();
            match kind {
                WorkerKind::Dedicated => dedicated.push(workers.len()),
                WorkerKind::Overlapped => overlapped.push(workers.len()),
            }
            workers.push(WorkerHandle {
                id,
                kind,
                lane_tx,
                lanes: parking_lot::Mutex::new(Vec::new()),
            });
            handles.push(tokio::spawn(worker_loop(id, kind, ctx.clone(), lane_rx)));
        }
        info!(
            dedicated = dedicated.len(),
            overlapped = overlapped.len(),
            "Spawned workers"
        );
        Self {
            workers,
            dedicated,
            overlapped,
            rr_low: AtomicUsize::new(0),
            rr_high: AtomicUsize::new(0),
            kill,
            flushing,
            handles: parking_lot::Mutex::new(handles),
        }
    }

    fn pick(&self, prio: TaskPrio) -> &WorkerHandle {
        let (set, rr) = match prio {
            TaskPrio::LowLatency if !self.dedicated.is_empty() => (&self.dedicated, &self.rr_low),
            TaskPrio::HighLatency if !self.overlapped.is_empty() => {
                (&self.overlapped, &self.rr_high)
            }
            // Fall back to whichever kind exists.
            _ if !self.dedicated.is_empty() => (&self.dedicated, &self.rr_low),
            _ => (&self.overlapped, &self.rr_high),
        };
        let idx = rr.fetch_add(1, Ordering::Relaxed) % set.len();
        &self.workers[set[idx]]
    }

    /// Assign a lane to a worker of the matching kind, round-robin.
    pub fn register_lane(&self, lane: Arc<Lane>) {
        let worker = self.pick(lane.prio());
        worker.lanes.lock().push(Arc::clone(&lane));
        debug!(lane = lane.id(), worker = worker.id, "Assigned lane");
        if worker.lane_tx.send(lane).is_err() {
            error!(worker = worker.id, "Worker is gone; lane not scheduled");
        }
    }

    /// Assign every lane of a freshly created container.
    pub fn register_container(&self, base: &ContainerBase) {
        for lane in base.all_lanes() {
            self.register_lane(Arc::clone(lane));
        }
    }

    /// Outstanding work across the lanes assigned to one worker.
    pub fn calculate_load(&self, worker_id: u32) -> usize {
        self.workers
            .iter()
            .find(|w| w.id == worker_id)
            .map(|w| w.lanes.lock().iter().map(|lane| lane.load()).sum())
            .unwrap_or(0)
    }

    /// Outstanding work across every assigned lane.
    pub fn total_load(&self) -> usize {
        self.workers
            .iter()
            .map(|w| w.lanes.lock().iter().map(|lane| lane.load()).sum::<usize>())
            .sum()
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn set_flushing(&self, on: bool) {
        self.flushing.store(on, Ordering::Release);
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    /// Signal workers to stop once their lanes drain, and wait for them.
    pub async fn join(&self) {
        self.kill.store(true, Ordering::Release);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "Worker task panicked");
            }
        }
        info!("All workers joined");
    }
}

#[cfg(test)]
mod tests;
