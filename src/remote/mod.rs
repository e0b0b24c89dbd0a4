//! Cross-node task replication.
//!
//! This module contains:
//! - `PendingTable`: completion tokens for replicas awaiting remote results
//! - `RemoteQueue`: the submitter/completer pair batching task archives
//!   per destination node
//! - the `task_submit` / `task_complete` RPC handlers
//!
//! Replication is origin-driven: the origin builds one replica per resolved
//! destination, ships inputs, waits for the full replica set, then folds
//! outputs back through the module's aggregation callback.

pub mod archive;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::RemoteConfig;
use crate::domain::ResolvedDomainQuery;
use crate::pool::{self, ModuleRegistry, MonitorMode, PoolError};
use crate::task::{NodeId, Task, WAIT_MODULE_COMPLETE};
use crate::transport::{Transport, TransportError};

use archive::{CompleteArchive, CompleteEntry, SubmitArchive, SubmitEntry};

/// Result type for replication operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Archive encode failure: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Archive decode failure: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Submitter is not running")]
    SubmitterGone,
}

/// RPC exposing task submission on every node.
pub const RPC_SUBMIT: &str = "task_submit";
/// RPC shipping finished task outputs back to their origin.
pub const RPC_COMPLETE: &str = "task_complete";

// ============================================================================
// Pending table
// ============================================================================

/// Maps completion tokens to the replicas awaiting remote results.
///
/// Tokens replace raw pointers on the wire: a stale or malformed token from
/// a peer is a warning, never a wild access.
#[derive(Default)]
struct PendingTable {
    next: AtomicU64,
    map: parking_lot::Mutex<HashMap<u64, Arc<Task>>>,
}

impl PendingTable {
    fn insert(&self, task: Arc<Task>) -> u64 {
        let token = self.next.fetch_add(1, Ordering::Relaxed);
        self.map.lock().insert(token, task);
        token
    }

    fn remove(&self, token: u64) -> Option<Arc<Task>> {
        self.map.lock().remove(&token)
    }

    fn len(&self) -> usize {
        self.map.lock().len()
    }
}

struct Outbound {
    dest: NodeId,
    entry: SubmitEntry,
}

// ============================================================================
// Remote queue
// ============================================================================

/// The replication engine of one node.
pub struct RemoteQueue {
    transport: Arc<dyn Transport>,
    registry: Arc<ModuleRegistry>,
    pending: PendingTable,
    submit_tx: mpsc::UnboundedSender<Outbound>,
    submit_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    complete_tx: mpsc::UnboundedSender<Arc<Task>>,
    complete_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Arc<Task>>>>,
    /// Submissions queued or on the wire.
    outbound: AtomicUsize,
    /// Tasks executing locally on behalf of peers, until their outputs ship.
    inflight_remote: AtomicUsize,
    /// Tasks that entered replication on this node (instrumentation).
    remote_submits: AtomicU64,
    max_batch: usize,
}

impl RemoteQueue {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<ModuleRegistry>,
        config: &RemoteConfig,
    ) -> Arc<Self> {
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let (complete_tx, complete_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            transport,
            registry,
            pending: PendingTable::default(),
            submit_tx,
            submit_rx: parking_lot::Mutex::new(Some(submit_rx)),
            complete_tx,
            complete_rx: parking_lot::Mutex::new(Some(complete_rx)),
            outbound: AtomicUsize::new(0),
            inflight_remote: AtomicUsize::new(0),
            remote_submits: AtomicU64::new(0),
            max_batch: config.max_batch,
        })
    }

    /// Register the RPC handlers and spawn the submitter and completer.
    pub fn start(self: &Arc<Self>) {
        let me = Arc::clone(self);
        self.transport.register_rpc(
            RPC_SUBMIT,
            Arc::new(move |origin, bytes| {
                let me = Arc::clone(&me);
                Box::pin(async move { me.handle_submit(origin, bytes).await })
            }),
        );
        let me = Arc::clone(self);
        self.transport.register_rpc(
            RPC_COMPLETE,
            Arc::new(move |origin, bytes| {
                let me = Arc::clone(&me);
                Box::pin(async move { me.handle_complete(origin, bytes).await })
            }),
        );

        let submit_rx = self
            .submit_rx
            .lock()
            .take()
            .expect("remote queue started twice");
        let complete_rx = self
            .complete_rx
            .lock()
            .take()
            .expect("remote queue started twice");
        tokio::spawn(Arc::clone(self).submitter(submit_rx));
        tokio::spawn(Arc::clone(self).completer(complete_rx));
        info!(node = self.transport.node_id(), "Remote queue started");
    }

    /// Sender workers use to hand back finished remote-origin tasks.
    pub fn complete_sender(&self) -> mpsc::UnboundedSender<Arc<Task>> {
        self.complete_tx.clone()
    }

    /// Replication work not yet settled, for flush accounting.
    pub fn inflight(&self) -> usize {
        self.pending.len()
            + self.outbound.load(Ordering::Acquire)
            + self.inflight_remote.load(Ordering::Acquire)
    }

    /// Number of tasks that entered replication on this node.
    pub fn remote_submits(&self) -> u64 {
        self.remote_submits.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Origin side
    // ------------------------------------------------------------------

    /// Replicate a task across its resolved destinations and wait for the
    /// whole replica set before aggregating.
    pub async fn push_submit(
        &self,
        task: Arc<Task>,
        resolved: Vec<ResolvedDomainQuery>,
    ) -> Result<()> {
        self.remote_submits.fetch_add(1, Ordering::Relaxed);
        let proto = self.registry.get_proto(task.pool).await?;

        // The origin owns the task until aggregation; suspend fire-and-forget
        // so no replica reclaims it early.
        let was_ff = task.is_fire_and_forget();
        task.unset_fire_and_forget();

        let fanout = resolved.len();
        let deep = fanout > 1 && task.is_data_owner();
        let mut replicas = Vec::with_capacity(fanout);
        for dest in &resolved {
            let replica = if fanout == 1 {
                task.set_dom_query(dest.query);
                Arc::clone(&task)
            } else {
                pool::new_copy(proto.as_ref(), &task, dest.query, deep)?
            };
            replica.unset_fire_and_forget();
            replicas.push(replica);
        }
        debug!(task = %task.node, fanout, "Replicating task");

        if fanout > 1 {
            proto
                .monitor(MonitorMode::ReplicaStart, task.method, &task, &replicas)
                .await?;
        }

        for (dest, replica) in resolved.iter().zip(&replicas) {
            if dest.node == self.transport.node_id() {
                self.registry.dispatch_local(Arc::clone(replica)).await?;
            } else {
                let payload = proto.save_start(replica.method, replica)?;
                let token = self.pending.insert(Arc::clone(replica));
                let entry = SubmitEntry {
                    pool: replica.pool,
                    method: replica.method,
                    node: replica.node,
                    prio: replica.prio,
                    flags: replica.flags.snapshot(),
                    query: dest.query,
                    token,
                    payload,
                };
                self.outbound.fetch_add(1, Ordering::AcqRel);
                self.submit_tx
                    .send(Outbound {
                        dest: dest.node,
                        entry,
                    })
                    .map_err(|_| RemoteError::SubmitterGone)?;
            }
        }

        task.wait_subtasks(&replicas, WAIT_MODULE_COMPLETE).await;

        if fanout > 1 {
            proto
                .monitor(MonitorMode::ReplicaAgg, task.method, &task, &replicas)
                .await?;
            for replica in &replicas {
                proto.del(replica.method, replica);
                replica.record_free();
            }
            task.set_module_complete();
        }

        if was_ff {
            task.set_fire_and_forget();
        }
        task.set_complete();
        if was_ff {
            proto.del(task.method, &task);
            task.record_free();
        }
        Ok(())
    }

    /// Drains the submit channel, batching entries per destination node.
    async fn submitter(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
        while let Some(first) = rx.recv().await {
            let mut batches: HashMap<NodeId, Vec<SubmitEntry>> = HashMap::new();
            batches.entry(first.dest).or_default().push(first.entry);
            let mut count = 1;
            while count < self.max_batch {
                let Ok(next) = rx.try_recv() else { break };
                batches.entry(next.dest).or_default().push(next.entry);
                count += 1;
            }
            for (dest, entries) in batches {
                let sent = entries.len();
                let archive = SubmitArchive {
                    origin: self.transport.node_id(),
                    entries,
                };
                match archive::encode(&archive) {
                    Ok(bytes) => {
                        debug!(dest, tasks = sent, "Shipping submit archive");
                        if let Err(err) = self.transport.call(dest, RPC_SUBMIT, bytes).await {
                            // Best effort: the batch is dropped and its
                            // origin tasks keep waiting.
                            error!(dest, error = %err, "Submit archive failed");
                        }
                    }
                    Err(err) => error!(dest, error = %err, "Submit archive encode failed"),
                }
                self.outbound.fetch_sub(sent, Ordering::AcqRel);
            }
        }
    }

    // ------------------------------------------------------------------
    // Executing side
    // ------------------------------------------------------------------

    /// `task_submit` handler: reconstruct each task and schedule it locally.
    async fn handle_submit(
        &self,
        origin: NodeId,
        bytes: Vec<u8>,
    ) -> crate::transport::Result<Vec<u8>> {
        let archive: SubmitArchive = archive::decode(&bytes)
            .map_err(|err| TransportError::Remote(RPC_SUBMIT.into(), err.to_string()))?;
        debug!(origin, tasks = archive.entries.len(), "Received submit archive");
        for entry in archive.entries {
            if let Err(err) = self.admit(origin, entry).await {
                // A bad entry is logged and skipped; its origin keeps waiting.
                error!(origin, error = %err, "Failed to admit remote task");
            }
        }
        Ok(Vec::new())
    }

    async fn admit(&self, origin: NodeId, entry: SubmitEntry) -> Result<()> {
        let proto = self.registry.get_proto(entry.pool).await?;
        let task = Task::with_prio(entry.node, entry.pool, entry.method, entry.query, entry.prio);
        task.flags.restore(&entry.flags);
        // The shell owns its deserialized buffers and must report home; it
        // is never reclaimed or re-run on its own.
        task.set_remote();
        task.set_data_owner();
        task.unset_fire_and_forget();
        task.unset_long_running();
        task.set_signal_remote_complete();
        {
            let mut ctx = task.ctx();
            ctx.ret_token = Some(entry.token);
            ctx.ret_node = Some(origin);
        }
        proto.load_start(entry.method, &task, &entry.payload)?;
        self.inflight_remote.fetch_add(1, Ordering::AcqRel);
        if let Err(err) = self.registry.dispatch_local(task).await {
            self.inflight_remote.fetch_sub(1, Ordering::AcqRel);
            return Err(err.into());
        }
        Ok(())
    }

    /// Drains finished remote-origin tasks, shipping their outputs home.
    async fn completer(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Arc<Task>>) {
        while let Some(first) = rx.recv().await {
            let mut done = vec![first];
            while done.len() < self.max_batch {
                let Ok(next) = rx.try_recv() else { break };
                done.push(next);
            }

            let mut batches: HashMap<NodeId, Vec<CompleteEntry>> = HashMap::new();
            let mut shells = Vec::with_capacity(done.len());
            for task in done {
                let (ret_node, ret_token) = {
                    let ctx = task.ctx();
                    (ctx.ret_node, ctx.ret_token)
                };
                let (Some(node), Some(token)) = (ret_node, ret_token) else {
                    error!(task = %task.node, "Completed remote task without a return address");
                    continue;
                };
                let payload = match self.registry.get_proto(task.pool).await {
                    Ok(proto) => match proto.save_end(task.method, &task) {
                        Ok(payload) => payload,
                        Err(err) => {
                            error!(task = %task.node, error = %err, "Output serialization failed");
                            Vec::new()
                        }
                    },
                    Err(err) => {
                        error!(task = %task.node, error = %err, "Pool vanished before completion");
                        Vec::new()
                    }
                };
                batches
                    .entry(node)
                    .or_default()
                    .push(CompleteEntry { token, payload });
                shells.push(task);
            }

            for (dest, entries) in batches {
                let archive = CompleteArchive {
                    origin: self.transport.node_id(),
                    entries,
                };
                match archive::encode(&archive) {
                    Ok(bytes) => {
                        if let Err(err) = self.transport.call(dest, RPC_COMPLETE, bytes).await {
                            error!(dest, error = %err, "Complete archive failed");
                        }
                    }
                    Err(err) => error!(dest, error = %err, "Complete archive encode failed"),
                }
            }

            // Outputs are on the wire; retire the local shells.
            for task in shells {
                task.set_complete();
                if let Ok(proto) = self.registry.get_proto(task.pool).await {
                    proto.del(task.method, &task);
                }
                task.record_free();
                self.inflight_remote.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// `task_complete` handler: apply outputs to the pending replicas.
    async fn handle_complete(
        &self,
        origin: NodeId,
        bytes: Vec<u8>,
    ) -> crate::transport::Result<Vec<u8>> {
        let archive: CompleteArchive = archive::decode(&bytes)
            .map_err(|err| TransportError::Remote(RPC_COMPLETE.into(), err.to_string()))?;
        debug!(origin, tasks = archive.entries.len(), "Received complete archive");
        for entry in archive.entries {
            let Some(replica) = self.pending.remove(entry.token) else {
                warn!(origin, token = entry.token, "Unknown completion token");
                continue;
            };
            match self.registry.get_proto(replica.pool).await {
                Ok(proto) => {
                    if let Err(err) = proto.load_end(replica.method, &replica, &entry.payload) {
                        error!(task = %replica.node, error = %err, "Output apply failed");
                    }
                }
                Err(err) => error!(task = %replica.node, error = %err, "Pool vanished"),
            }
            replica.set_module_complete();
        }
        Ok(Vec::new())
    }
}
