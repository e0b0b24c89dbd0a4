//! Runtime assembly and administration.
//!
//! `Runtime` wires one node's components together (registry, domain table,
//! workers, replication) and exposes the admin operations: pool lifecycle,
//! domain updates, flush, and shutdown. Admin operations are cluster-wide;
//! each is applied locally and broadcast to peers over dedicated RPCs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::alloc::BufferAllocator;
use crate::config::RuntimeConfig;
use crate::domain::{DomainError, DomainQuery, DomainTable, DomainUpdate, SubDomain};
use crate::pool::{ModuleRegistry, MonitorMode, PoolError};
use crate::remote::{archive, RemoteError, RemoteQueue};
use crate::task::{
    ContainerId, MethodId, NodeId, PoolId, Task, TaskId, TaskNode, METHOD_CREATE, METHOD_DESTROY,
    METHOD_FLUSH, WAIT_MODULE_COMPLETE,
};
use crate::transport::{Transport, TransportError};
use crate::worker::WorkOrchestrator;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Admin encode failure: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Admin decode failure: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Runtime is stopping")]
    Stopping,
}

const RPC_POOL_CREATE: &str = "pool_create";
const RPC_POOL_DESTROY: &str = "pool_destroy";
const RPC_DOMAIN_UPDATE: &str = "domain_update";
const RPC_FLUSH: &str = "flush_sweep";
const RPC_STOP: &str = "stop_runtime";

/// Cluster-wide pool creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PoolCreate {
    module: String,
    name: String,
    pool: PoolId,
    assignments: Vec<(ContainerId, NodeId)>,
}

/// Cluster-wide domain map change.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DomainOps {
    pool: PoolId,
    ops: Vec<DomainUpdate>,
}

/// One node of the task runtime.
pub struct Runtime {
    config: RuntimeConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<ModuleRegistry>,
    domains: Arc<DomainTable>,
    remote: Arc<RemoteQueue>,
    orchestrator: WorkOrchestrator,
    allocator: BufferAllocator,
    unique: AtomicU64,
    stopping: AtomicBool,
}

impl Runtime {
    /// Assemble and start a node: registry, replication, workers, admin RPCs.
    pub fn start(config: RuntimeConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let node = transport.node_id();
        let registry = Arc::new(ModuleRegistry::new(
            node,
            config.queue.lanes_per_container,
            config.queue.depth,
        ));
        let domains = Arc::new(DomainTable::new(node));
        let remote = RemoteQueue::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
            &config.remote,
        );
        remote.start();
        let orchestrator = WorkOrchestrator::spawn(
            &config.workers,
            Arc::clone(&registry),
            remote.complete_sender(),
        );

        let runtime = Arc::new(Self {
            config,
            transport,
            registry,
            domains,
            remote,
            orchestrator,
            allocator: BufferAllocator::unbounded(),
            unique: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
        });
        runtime.register_admin_rpcs();
        info!(node, "Runtime started");
        runtime
    }

    pub fn node_id(&self) -> NodeId {
        self.transport.node_id()
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn domains(&self) -> &Arc<DomainTable> {
        &self.domains
    }

    pub fn remote(&self) -> &Arc<RemoteQueue> {
        &self.remote
    }

    pub fn allocator(&self) -> &BufferAllocator {
        &self.allocator
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Next node-unique id, for tasks and pools minted here.
    pub fn next_unique(&self) -> u64 {
        self.unique.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Resolve a task's domain query and schedule it.
    ///
    /// A single-destination local resolution dispatches straight onto the
    /// container's lane; everything else goes through replication.
    pub async fn schedule(&self, task: Arc<Task>) -> Result<()> {
        if self.is_stopping() {
            return Err(RuntimeError::Stopping);
        }
        let resolved = match self.domains.resolve(task.pool, &task.dom_query()).await {
            Ok(resolved) => resolved,
            Err(err) => {
                // Complete without effect so a waiter is never stranded.
                warn!(task = %task.node, error = %err, "Domain resolution failed");
                task.set_complete();
                return Err(err.into());
            }
        };
        if self.domains.is_local_fast_path(&resolved) {
            task.set_dom_query(resolved[0].query);
            self.registry.dispatch_local(task).await?;
            return Ok(());
        }
        let remote = Arc::clone(&self.remote);
        tokio::spawn(async move {
            if let Err(err) = remote.push_submit(task, resolved).await {
                error!(error = %err, "Replication failed");
            }
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pool lifecycle
    // ------------------------------------------------------------------

    /// Create a pool cluster-wide, get-or-create by name.
    ///
    /// Containers are assigned round-robin across the nodes currently in
    /// the cluster; every node constructs its share and runs each
    /// container's constructor method before this returns locally.
    pub async fn create_pool(&self, module: &str, name: &str, containers: u32) -> Result<PoolId> {
        if let Some(existing) = self.registry.lookup_pool(name).await {
            return Ok(existing);
        }
        let pool = PoolId::new(self.node_id(), self.next_unique());
        let nodes = self.transport.nodes();
        let assignments: Vec<(ContainerId, NodeId)> = (0..containers)
            .map(|c| (c, nodes[c as usize % nodes.len()]))
            .collect();
        let req = PoolCreate {
            module: module.to_string(),
            name: name.to_string(),
            pool,
            assignments,
        };
        let bytes = archive::encode(&req)?;
        for peer in nodes.iter().filter(|n| **n != self.node_id()) {
            self.transport
                .call(*peer, RPC_POOL_CREATE, bytes.clone())
                .await?;
        }
        self.apply_pool_create(req).await?;
        info!(pool = %pool, name, containers, "Created pool");
        Ok(pool)
    }

    async fn apply_pool_create(&self, req: PoolCreate) -> Result<()> {
        self.registry
            .register_pool(&req.module, &req.name, req.pool)
            .await?;
        let updates: Vec<DomainUpdate> = req
            .assignments
            .iter()
            .map(|(container, node)| DomainUpdate::Assign {
                container: *container,
                node: *node,
            })
            .collect();
        self.domains.update_domains(req.pool, &updates).await;
        for (container, node) in &req.assignments {
            if *node == self.node_id() {
                self.construct_container(req.pool, *container).await?;
            }
        }
        Ok(())
    }

    /// Build a local container, hand its lanes to workers, and run its
    /// constructor through the normal scheduling path.
    async fn construct_container(&self, pool: PoolId, container: ContainerId) -> Result<()> {
        let module = self.registry.create_container(pool, container).await?;
        self.orchestrator.register_container(module.base());
        let task = self.admin_task(pool, METHOD_CREATE, container);
        self.registry.dispatch_local(Arc::clone(&task)).await?;
        task.wait_mask(WAIT_MODULE_COMPLETE).await;
        Ok(())
    }

    fn admin_task(&self, pool: PoolId, method: MethodId, container: ContainerId) -> Arc<Task> {
        Task::new(
            TaskNode::root(TaskId::new(self.node_id(), self.next_unique())),
            pool,
            method,
            DomainQuery::local_id(container),
        )
    }

    /// Destroy a pool cluster-wide, running each local container's
    /// destructor method first.
    pub async fn destroy_pool(&self, pool: PoolId) -> Result<()> {
        let bytes = archive::encode(&pool)?;
        for peer in self
            .transport
            .nodes()
            .into_iter()
            .filter(|n| *n != self.node_id())
        {
            self.transport.call(peer, RPC_POOL_DESTROY, bytes.clone()).await?;
        }
        self.apply_pool_destroy(pool).await
    }

    async fn apply_pool_destroy(&self, pool: PoolId) -> Result<()> {
        let containers = self.domains.local_containers(pool).await.unwrap_or_default();
        for container in containers {
            let task = self.admin_task(pool, METHOD_DESTROY, container);
            if self.registry.dispatch_local(Arc::clone(&task)).await.is_ok() {
                task.wait_mask(WAIT_MODULE_COMPLETE).await;
            }
        }
        self.registry.destroy_pool(pool).await?;
        self.domains.remove_pool(pool).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Domain administration
    // ------------------------------------------------------------------

    /// Apply domain updates cluster-wide. Peers that gain a container
    /// construct it before acknowledging.
    pub async fn update_domains(&self, pool: PoolId, ops: Vec<DomainUpdate>) -> Result<()> {
        let req = DomainOps { pool, ops };
        let bytes = archive::encode(&req)?;
        for peer in self
            .transport
            .nodes()
            .into_iter()
            .filter(|n| *n != self.node_id())
        {
            self.transport.call(peer, RPC_DOMAIN_UPDATE, bytes.clone()).await?;
        }
        self.apply_domain_ops(req).await
    }

    async fn apply_domain_ops(&self, req: DomainOps) -> Result<()> {
        self.domains.update_domains(req.pool, &req.ops).await;
        for op in &req.ops {
            if let DomainUpdate::Assign { container, node } = op {
                if *node == self.node_id()
                    && self.registry.get_container(req.pool, *container).await.is_err()
                {
                    self.construct_container(req.pool, *container).await?;
                }
            }
        }
        Ok(())
    }

    /// Number of containers a pool places in the named subdomain, answered
    /// from the local (replicated) domain table.
    pub async fn get_domain_size(&self, pool: PoolId, sub: SubDomain) -> Result<usize> {
        Ok(self.domains.domain_size(pool, sub).await?)
    }

    // ------------------------------------------------------------------
    // Flush and shutdown
    // ------------------------------------------------------------------

    /// Wait until the cluster holds no outstanding finite work: lanes
    /// empty, no tasks in flight, and no replication traffic pending on any
    /// node. Each sweep probes every node and sums their loads; two
    /// consecutive idle sweeps of the cluster-wide sum are required before
    /// returning.
    pub async fn flush(&self) {
        let peers: Vec<NodeId> = self
            .transport
            .nodes()
            .into_iter()
            .filter(|n| *n != self.node_id())
            .collect();
        let mut idle_sweeps = 0;
        while idle_sweeps < 2 {
            let mut load = self.flush_sweep().await;
            for &peer in &peers {
                match self.transport.call(peer, RPC_FLUSH, Vec::new()).await {
                    Ok(bytes) => match archive::decode::<u64>(&bytes) {
                        Ok(peer_load) => load += peer_load,
                        Err(err) => warn!(peer, error = %err, "Bad flush report"),
                    },
                    Err(err) => warn!(peer, error = %err, "Peer flush sweep failed"),
                }
            }
            if load == 0 {
                idle_sweeps += 1;
            } else {
                idle_sweeps = 0;
            }
            tokio::time::sleep(self.config.remote.flush_poll()).await;
        }
        self.orchestrator.set_flushing(false);
    }

    /// One node-local flush sweep: force periodic tasks runnable, visit
    /// every container's flush monitor, then report the outstanding load.
    async fn flush_sweep(&self) -> u64 {
        self.orchestrator.set_flushing(true);
        for module in self.registry.local_containers().await {
            let base = module.base();
            let probe = self.admin_task(base.pool, METHOD_FLUSH, base.container);
            probe.set_flush();
            if let Err(err) = module
                .monitor(MonitorMode::Flush, probe.method, &probe, &[])
                .await
            {
                warn!(pool = %base.pool, error = %err, "Flush monitor failed");
            }
        }
        let load = (self.registry.total_load().await + self.remote.inflight()) as u64;
        if load == 0 {
            self.orchestrator.set_flushing(false);
        }
        load
    }

    /// Stop the cluster: drain outstanding work everywhere, then stop
    /// peers, then this node's workers.
    pub async fn stop_runtime(&self) {
        self.flush().await;
        for peer in self
            .transport
            .nodes()
            .into_iter()
            .filter(|n| *n != self.node_id())
        {
            if let Err(err) = self.transport.call(peer, RPC_STOP, Vec::new()).await {
                warn!(peer, error = %err, "Peer did not acknowledge stop");
            }
        }
        self.shutdown_local().await;
    }

    async fn shutdown_local(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.orchestrator.join().await;
        info!(node = self.node_id(), "Runtime stopped");
    }

    // ------------------------------------------------------------------
    // Admin RPC plumbing
    // ------------------------------------------------------------------

    fn register_admin_rpcs(self: &Arc<Self>) {
        self.admin_rpc(RPC_POOL_CREATE, |rt, bytes| async move {
            let req: PoolCreate = archive::decode(&bytes)
                .map_err(|e| TransportError::Remote(RPC_POOL_CREATE.into(), e.to_string()))?;
            rt.apply_pool_create(req)
                .await
                .map_err(|e| TransportError::Remote(RPC_POOL_CREATE.into(), e.to_string()))?;
            Ok(Vec::new())
        });
        self.admin_rpc(RPC_POOL_DESTROY, |rt, bytes| async move {
            let pool: PoolId = archive::decode(&bytes)
                .map_err(|e| TransportError::Remote(RPC_POOL_DESTROY.into(), e.to_string()))?;
            rt.apply_pool_destroy(pool)
                .await
                .map_err(|e| TransportError::Remote(RPC_POOL_DESTROY.into(), e.to_string()))?;
            Ok(Vec::new())
        });
        self.admin_rpc(RPC_DOMAIN_UPDATE, |rt, bytes| async move {
            let req: DomainOps = archive::decode(&bytes)
                .map_err(|e| TransportError::Remote(RPC_DOMAIN_UPDATE.into(), e.to_string()))?;
            rt.apply_domain_ops(req)
                .await
                .map_err(|e| TransportError::Remote(RPC_DOMAIN_UPDATE.into(), e.to_string()))?;
            Ok(Vec::new())
        });
        self.admin_rpc(RPC_FLUSH, |rt, _bytes| async move {
            let load = rt.flush_sweep().await;
            archive::encode(&load)
                .map_err(|e| TransportError::Remote(RPC_FLUSH.into(), e.to_string()))
        });
        self.admin_rpc(RPC_STOP, |rt, _bytes| async move {
            // Ack immediately; draining happens off the RPC path.
            tokio::spawn(async move { rt.shutdown_local().await });
            Ok(Vec::new())
        });
    }

    fn admin_rpc<F, Fut>(self: &Arc<Self>, name: &'static str, apply: F)
    where
        F: Fn(Arc<Runtime>, Vec<u8>) -> Fut + Send + Sync + Copy + 'static,
        Fut: std::future::Future<Output = crate::transport::Result<Vec<u8>>> + Send + 'static,
    {
        let weak: Weak<Runtime> = Arc::downgrade(self);
        self.transport.register_rpc(
            name,
            Arc::new(move |_origin, bytes| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(runtime) = weak.upgrade() else {
                        return Err(TransportError::Remote(name.into(), "runtime gone".into()));
                    };
                    apply(runtime, bytes).await
                })
            }),
        );
    }
}
