use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::timeout;

use super::comutex::{CoMutex, CoMutexTable};
use super::*;
use crate::config::RuntimeConfig;
use crate::domain::DomainQuery;
use crate::pool::RegisteredModule;
use crate::task::{MethodId, PoolId, TaskId, TaskNode, METHOD_USER, WAIT_COMPLETE};

// ============================================================================
// CoMutex
// ============================================================================

fn graph(unique: u64) -> TaskNode {
    TaskNode::root(TaskId::new(1, unique))
}

#[tokio::test]
async fn test_comutex_reentrant_within_graph() {
    let mutex = CoMutex::new();
    let root = graph(1);
    let sub = root.child();

    mutex.lock(&root).await;
    // A sub-task of the same graph acquires without blocking
    mutex.lock(&sub).await;
    assert_eq!(mutex.holder(), Some(root.root));

    mutex.unlock(&sub);
    assert_eq!(mutex.holder(), Some(root.root));
    mutex.unlock(&root);
    assert_eq!(mutex.holder(), None);
}

#[tokio::test]
async fn test_comutex_excludes_other_graphs() {
    let mutex = Arc::new(CoMutex::new());
    let a = graph(1);
    let b = graph(2);

    mutex.lock(&a).await;
    assert!(!mutex.try_lock(&b));

    let contender = Arc::clone(&mutex);
    let handle = tokio::spawn(async move {
        contender.lock(&b).await;
        contender.unlock(&b);
    });
    tokio::task::yield_now().await;
    assert!(!handle.is_finished());

    mutex.unlock(&a);
    timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_comutex_admits_whole_graph_at_once() {
    let mutex = Arc::new(CoMutex::new());
    let a = graph(1);
    let b = graph(2);

    mutex.lock(&a).await;

    // Two tasks of graph B park while A holds
    let mut handles = Vec::new();
    for _ in 0..2 {
        let m = Arc::clone(&mutex);
        handles.push(tokio::spawn(async move {
            m.lock(&b).await;
        }));
    }
    tokio::task::yield_now().await;

    mutex.unlock(&a);
    for handle in handles {
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
    // Both members were admitted together: two holds outstanding
    assert_eq!(mutex.holder(), Some(b.root));
    assert!(!mutex.try_lock(&graph(3)));
    mutex.unlock(&b);
    mutex.unlock(&b);
    assert_eq!(mutex.holder(), None);
}

#[tokio::test]
async fn test_comutex_table_creates_on_first_use() {
    let table: CoMutexTable<u32> = CoMutexTable::new();
    assert!(table.is_empty());

    let lock = table.get(&7);
    lock.lock(&graph(1)).await;
    assert_eq!(table.len(), 1);
    // Same key yields the same mutex
    assert_eq!(table.get(&7).holder(), Some(TaskId::new(1, 1)));
    lock.unlock(&graph(1));
}

// ============================================================================
// Workers
// ============================================================================

const METHOD_FOREVER: MethodId = METHOD_USER + 1;

struct SpinContainer {
    base: ContainerBase,
}

#[async_trait::async_trait]
impl ContainerModule for SpinContainer {
    fn base(&self) -> &ContainerBase {
        &self.base
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn run(&self, method: MethodId, task: &Arc<Task>) -> crate::pool::Result<()> {
        task.with_payload::<Arc<AtomicUsize>, _>(|runs| {
            runs.fetch_add(1, Ordering::SeqCst);
        });
        if method == METHOD_USER {
            task.set_module_complete();
        }
        // METHOD_FOREVER never completes itself; the test stops it.
        Ok(())
    }

    fn copy_start(
        &self,
        _method: MethodId,
        _from: &Task,
        _to: &Task,
        _deep: bool,
    ) -> crate::pool::Result<()> {
        Ok(())
    }

    fn save_start(&self, _method: MethodId, _task: &Task) -> crate::pool::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn load_start(&self, _method: MethodId, _task: &Task, _bytes: &[u8]) -> crate::pool::Result<()> {
        Ok(())
    }

    fn save_end(&self, _method: MethodId, _task: &Task) -> crate::pool::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn load_end(&self, _method: MethodId, _task: &Task, _bytes: &[u8]) -> crate::pool::Result<()> {
        Ok(())
    }
}

inventory::submit! {
    RegisteredModule {
        name: "test_spin",
        construct: |base| Arc::new(SpinContainer { base }),
    }
}

struct Rig {
    registry: Arc<ModuleRegistry>,
    orchestrator: WorkOrchestrator,
    module: Arc<dyn ContainerModule>,
}

fn pool() -> PoolId {
    PoolId::new(1, 30)
}

async fn rig() -> Rig {
    let config = RuntimeConfig::default();
    let registry = Arc::new(ModuleRegistry::new(1, 2, 64));
    let (complete_tx, _complete_rx) = mpsc::unbounded_channel();
    let orchestrator = WorkOrchestrator::spawn(&config.workers, Arc::clone(&registry), complete_tx);

    registry.register_pool("test_spin", "spinners", pool()).await.unwrap();
    let module = registry.create_container(pool(), 0).await.unwrap();
    orchestrator.register_container(module.base());
    Rig {
        registry,
        orchestrator,
        module,
    }
}

fn user_task(unique: u64, method: MethodId) -> (Arc<Task>, Arc<AtomicUsize>) {
    let task = Task::new(
        TaskNode::root(TaskId::new(1, unique)),
        pool(),
        method,
        DomainQuery::local_id(0),
    );
    let runs = Arc::new(AtomicUsize::new(0));
    task.set_payload(Arc::clone(&runs));
    (task, runs)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tasks_execute_to_completion() {
    let rig = rig().await;
    let mut tasks = Vec::new();
    for i in 0..10 {
        let (task, runs) = user_task(i, METHOD_USER);
        rig.registry.dispatch_local(Arc::clone(&task)).await.unwrap();
        tasks.push((task, runs));
    }
    for (task, runs) in &tasks {
        timeout(Duration::from_secs(2), task.wait_mask(WAIT_COMPLETE))
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
    rig.orchestrator.join().await;
    assert_eq!(rig.orchestrator.total_load(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fire_and_forget_is_reclaimed() {
    let rig = rig().await;
    let (task, _runs) = user_task(1, METHOD_USER);
    task.set_fire_and_forget();
    rig.registry.dispatch_local(Arc::clone(&task)).await.unwrap();

    timeout(Duration::from_secs(2), task.wait_mask(WAIT_COMPLETE))
        .await
        .unwrap();
    // The runtime, not the caller, freed the task exactly once
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while task.free_count() == 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(task.free_count(), 1);
    rig.orchestrator.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_long_running_task_reruns_periodically() {
    let rig = rig().await;
    let (task, runs) = user_task(1, METHOD_FOREVER);
    task.set_long_running();
    task.set_period(Duration::from_millis(5));
    rig.registry.dispatch_local(Arc::clone(&task)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(runs.load(Ordering::SeqCst) >= 2);

    // Stopping the task completes it through the normal path
    task.set_module_complete();
    timeout(Duration::from_secs(2), task.wait_mask(WAIT_COMPLETE))
        .await
        .unwrap();
    rig.orchestrator.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_long_running_tasks_do_not_hold_load() {
    let rig = rig().await;
    let (task, _runs) = user_task(1, METHOD_FOREVER);
    task.set_long_running();
    task.set_period(Duration::from_millis(5));
    rig.registry.dispatch_local(Arc::clone(&task)).await.unwrap();

    // Once the worker detaches the task, lane load drops to zero even
    // though the task keeps running.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while rig.orchestrator.total_load() != 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    task.set_module_complete();
    rig.orchestrator.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lanes_spread_across_workers() {
    let rig = rig().await;
    let lanes = rig.module.base().lane_group(TaskPrio::LowLatency).lanes().to_vec();
    assert_eq!(lanes.len(), 2);

    // Workers bind lanes as they drain their assignment channels
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while lanes.iter().any(|lane| lane.worker().is_none()) {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let mut workers: Vec<u32> = lanes.iter().filter_map(|lane| lane.worker()).collect();
    workers.sort_unstable();
    workers.dedup();
    // Round-robin put the two low-latency lanes on two dedicated workers
    assert_eq!(workers.len(), 2);
    rig.orchestrator.join().await;
}
