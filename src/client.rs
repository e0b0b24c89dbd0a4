//! Client handle for building, submitting, and reclaiming tasks.

use std::sync::Arc;

use crate::domain::{DomainQuery, SubDomain};
use crate::runtime::{Result, Runtime};
use crate::task::{MethodId, NodeId, PoolId, Task, TaskId, TaskNode, WAIT_MODULE_COMPLETE};

/// A cheap, cloneable handle onto one node's runtime.
#[derive(Clone)]
pub struct Client {
    runtime: Arc<Runtime>,
}

impl Client {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn node_id(&self) -> NodeId {
        self.runtime.node_id()
    }

    // ------------------------------------------------------------------
    // Task construction
    // ------------------------------------------------------------------

    /// Build a new root task addressed to `(pool, method)`.
    pub fn new_task(&self, pool: PoolId, method: MethodId, query: DomainQuery) -> Arc<Task> {
        Task::new(
            TaskNode::root(TaskId::new(self.node_id(), self.runtime.next_unique())),
            pool,
            method,
            query,
        )
    }

    /// Build a sub-task of `parent`, one level deeper in its graph.
    pub fn new_subtask(
        &self,
        parent: &Task,
        pool: PoolId,
        method: MethodId,
        query: DomainQuery,
    ) -> Arc<Task> {
        Task::new(parent.node.child(), pool, method, query)
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Schedule a task; returns once it is queued (or replicating).
    pub async fn submit(&self, task: &Arc<Task>) -> Result<()> {
        self.runtime.schedule(Arc::clone(task)).await
    }

    /// Schedule a task and wait for its module to complete it.
    pub async fn submit_and_wait(&self, task: &Arc<Task>) -> Result<()> {
        self.submit(task).await?;
        task.wait_mask(WAIT_MODULE_COMPLETE).await;
        Ok(())
    }

    /// Free a task the caller owns. Exactly one free per task; module
    /// resources attached to it are released first.
    pub async fn del_task(&self, task: Arc<Task>) -> Result<()> {
        let proto = self.runtime.registry().get_proto(task.pool).await?;
        proto.del(task.method, &task);
        task.record_free();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    /// Get-or-create a pool by name with `containers` shards cluster-wide.
    pub async fn create_pool(&self, module: &str, name: &str, containers: u32) -> Result<PoolId> {
        self.runtime.create_pool(module, name, containers).await
    }

    pub async fn destroy_pool(&self, pool: PoolId) -> Result<()> {
        self.runtime.destroy_pool(pool).await
    }

    pub async fn get_domain_size(&self, pool: PoolId, sub: SubDomain) -> Result<usize> {
        self.runtime.get_domain_size(pool, sub).await
    }

    /// Drain every queue on this node.
    pub async fn flush(&self) {
        self.runtime.flush().await
    }

    /// Stop the whole cluster.
    pub async fn stop_runtime(&self) {
        self.runtime.stop_runtime().await
    }
}
