use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::domain::SubDomain;
use crate::task::{TaskId, TaskNode, METHOD_USER};

struct CounterContainer {
    base: ContainerBase,
    hits: AtomicUsize,
}

#[async_trait]
impl ContainerModule for CounterContainer {
    fn base(&self) -> &ContainerBase {
        &self.base
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn run(&self, _method: MethodId, task: &Arc<Task>) -> Result<()> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        task.set_module_complete();
        Ok(())
    }

    fn copy_start(&self, _method: MethodId, _from: &Task, _to: &Task, _deep: bool) -> Result<()> {
        Ok(())
    }

    fn save_start(&self, _method: MethodId, _task: &Task) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn load_start(&self, _method: MethodId, _task: &Task, _bytes: &[u8]) -> Result<()> {
        Ok(())
    }

    fn save_end(&self, _method: MethodId, _task: &Task) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn load_end(&self, _method: MethodId, _task: &Task, _bytes: &[u8]) -> Result<()> {
        Ok(())
    }
}

inventory::submit! {
    RegisteredModule {
        name: "test_counter",
        construct: |base| Arc::new(CounterContainer { base, hits: AtomicUsize::new(0) }),
    }
}

fn registry() -> ModuleRegistry {
    ModuleRegistry::new(1, 4, 64)
}

fn pool() -> PoolId {
    PoolId::new(1, 20)
}

fn local_task(container: ContainerId) -> Arc<Task> {
    Task::new(
        TaskNode::root(TaskId::new(1, 1)),
        pool(),
        METHOD_USER,
        DomainQuery::local_id(container),
    )
}

#[tokio::test]
async fn test_register_and_create_container() {
    let registry = registry();
    registry.register_pool("test_counter", "counters", pool()).await.unwrap();
    let module = registry.create_container(pool(), 0).await.unwrap();

    assert_eq!(module.base().pool, pool());
    assert_eq!(module.base().container, 0);
    assert_eq!(module.base().name, "counters");
    assert_eq!(module.base().lane_group(TaskPrio::LowLatency).len(), 4);

    assert_eq!(registry.lookup_pool("counters").await, Some(pool()));
    assert!(registry.get_container(pool(), 0).await.is_ok());
}

#[tokio::test]
async fn test_nil_pool_id_rejected() {
    let registry = registry();
    let err = registry
        .register_pool("test_counter", "counters", PoolId::nil())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::NilPoolId));
}

#[tokio::test]
async fn test_unknown_module_rejected() {
    let registry = registry();
    let err = registry
        .register_pool("no_such_module", "x", pool())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::UnknownModule(_)));
}

#[tokio::test]
async fn test_duplicate_pool_rejected() {
    let registry = registry();
    registry.register_pool("test_counter", "counters", pool()).await.unwrap();
    let err = registry
        .register_pool("test_counter", "counters2", pool())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::DuplicatePool(_)));
}

#[tokio::test]
async fn test_dispatch_local_lands_on_container_lane() {
    let registry = registry();
    registry.register_pool("test_counter", "counters", pool()).await.unwrap();
    let module = registry.create_container(pool(), 3).await.unwrap();

    let task = local_task(3);
    let lane = registry.dispatch_local(Arc::clone(&task)).await.unwrap();

    assert_eq!(lane.pool(), pool());
    assert_eq!(lane.container(), 3);
    // Hash routing is stable: the lane the registry picked is the lane the
    // module routes the same task to.
    assert_eq!(module.route(&task).id(), lane.id());
    assert_eq!(lane.try_pop().unwrap().node, task.node);
}

#[tokio::test]
async fn test_dispatch_to_absent_container_fails() {
    let registry = registry();
    registry.register_pool("test_counter", "counters", pool()).await.unwrap();
    registry.create_container(pool(), 0).await.unwrap();

    let err = registry.dispatch_local(local_task(7)).await.unwrap_err();
    assert!(matches!(err, PoolError::UnknownContainer { container: 7, .. }));
}

#[tokio::test]
async fn test_dispatch_unresolved_query_rejected() {
    let registry = registry();
    registry.register_pool("test_counter", "counters", pool()).await.unwrap();
    registry.create_container(pool(), 0).await.unwrap();

    let task = Task::new(
        TaskNode::root(TaskId::new(1, 1)),
        pool(),
        METHOD_USER,
        DomainQuery::direct_hash(SubDomain::GlobalContainers, 9),
    );
    assert!(registry.dispatch_local(task).await.is_err());
}

#[tokio::test]
async fn test_subtask_avoids_lane_running_its_graph() {
    let registry = registry();
    registry.register_pool("test_counter", "counters", pool()).await.unwrap();
    let module = registry.create_container(pool(), 0).await.unwrap();

    let parent = local_task(0);
    let parent_lane = module.route(&parent);
    parent_lane.set_active(parent.node.root);

    // A sub-task of the executing graph hashes onto the same lane; the
    // dispatcher steers it to a lane free of the graph instead.
    let sub = Task::new(parent.node.child(), pool(), METHOD_USER, DomainQuery::local_id(0));
    let lane = registry.dispatch_local(Arc::clone(&sub)).await.unwrap();
    assert_ne!(lane.id(), parent_lane.id());
    assert_eq!(lane.try_pop().unwrap().node, sub.node);

    // An unrelated task keeps its hashed lane
    parent_lane.unset_active(parent.node.root);
    let other = local_task(0);
    let routed = registry.dispatch_local(Arc::clone(&other)).await.unwrap();
    assert_eq!(routed.id(), parent_lane.id());
}

#[tokio::test]
async fn test_destroy_pool_unregisters() {
    let registry = registry();
    registry.register_pool("test_counter", "counters", pool()).await.unwrap();
    registry.create_container(pool(), 0).await.unwrap();

    registry.destroy_pool(pool()).await.unwrap();
    assert_eq!(registry.lookup_pool("counters").await, None);
    assert!(matches!(
        registry.get_container(pool(), 0).await.unwrap_err(),
        PoolError::UnknownPool(_)
    ));
}

#[tokio::test]
async fn test_total_load_sums_lanes() {
    let registry = registry();
    registry.register_pool("test_counter", "counters", pool()).await.unwrap();
    registry.create_container(pool(), 0).await.unwrap();

    assert_eq!(registry.total_load().await, 0);
    registry.dispatch_local(local_task(0)).await.unwrap();
    registry.dispatch_local(local_task(0)).await.unwrap();
    assert_eq!(registry.total_load().await, 2);
}

#[tokio::test]
async fn test_new_copy_preserves_wire_flags() {
    let registry = registry();
    registry.register_pool("test_counter", "counters", pool()).await.unwrap();
    let module = registry.create_container(pool(), 0).await.unwrap();

    let from = local_task(0);
    from.set_data_owner();
    from.set_fire_and_forget();
    from.set_started();

    let shallow = new_copy(module.as_ref(), &from, DomainQuery::local_id(1), false).unwrap();
    assert_eq!(shallow.pool, from.pool);
    assert_eq!(shallow.method, from.method);
    assert_eq!(shallow.node, from.node);
    assert!(shallow.is_fire_and_forget());
    // Shared buffers get exactly one owner
    assert!(!shallow.is_data_owner());
    // Run state does not travel to the copy
    assert!(!shallow.is_started());
    assert_eq!(shallow.dom_query().container_id(), Some(1));

    let deep = new_copy(module.as_ref(), &from, DomainQuery::local_id(2), true).unwrap();
    assert!(deep.is_data_owner());
}
