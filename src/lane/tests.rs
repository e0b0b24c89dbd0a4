use super::*;
use crate::domain::{DomainQuery, SubDomain};
use crate::task::{TaskNode, METHOD_USER};

fn lane(depth: usize) -> Arc<Lane> {
    Lane::new(0, PoolId::new(1, 1), 0, TaskPrio::LowLatency, depth)
}

fn make_task(unique: u64) -> Arc<Task> {
    Task::new(
        TaskNode::root(TaskId::new(1, unique)),
        PoolId::new(1, 1),
        METHOD_USER,
        DomainQuery::direct_id(SubDomain::LocalContainers, 0),
    )
}

#[test]
fn test_emplace_pop_is_fifo() {
    let lane = lane(8);
    for i in 0..4 {
        lane.emplace(make_task(i)).unwrap();
    }
    assert_eq!(lane.num_queued(), 4);

    for i in 0..4 {
        let task = lane.try_pop().unwrap();
        assert_eq!(task.node.root.unique, i);
    }
    assert!(lane.try_pop().is_none());
    assert_eq!(lane.num_queued(), 0);
}

#[test]
fn test_full_lane_rejects() {
    let lane = lane(2);
    lane.emplace(make_task(0)).unwrap();
    lane.emplace(make_task(1)).unwrap();
    assert!(matches!(lane.emplace(make_task(2)), Err(LaneError::Full(0))));

    // Draining makes room again
    lane.try_pop().unwrap();
    lane.emplace(make_task(2)).unwrap();
}

#[test]
fn test_plugged_lane_retains_entries() {
    let lane = lane(8);
    lane.emplace(make_task(0)).unwrap();

    lane.plug();
    assert!(lane.is_plugged());
    assert!(lane.try_pop().is_none());
    assert_eq!(lane.num_queued(), 1);

    lane.unplug();
    assert!(!lane.is_plugged());
    assert!(lane.try_pop().is_some());
}

#[test]
fn test_active_refcounts_are_reentrant() {
    let lane = lane(8);
    let id = TaskId::new(1, 5);

    lane.set_active(id);
    lane.set_active(id);
    assert!(lane.is_active(id));
    assert_eq!(lane.num_active(), 1);

    lane.unset_active(id);
    assert!(lane.is_active(id));
    lane.unset_active(id);
    assert!(!lane.is_active(id));
}

#[test]
fn test_load_counts_queued_and_active() {
    let lane = lane(8);
    lane.emplace(make_task(0)).unwrap();
    lane.emplace(make_task(1)).unwrap();
    lane.set_active(TaskId::new(1, 9));
    assert_eq!(lane.load(), 3);

    lane.try_pop().unwrap();
    lane.unset_active(TaskId::new(1, 9));
    assert_eq!(lane.load(), 1);
}

#[test]
fn test_group_hash_selection_is_stable() {
    let group = LaneGroup::new(PoolId::new(1, 1), 0, 4, TaskPrio::LowLatency, 8);
    assert_eq!(group.len(), 4);
    assert_eq!(group.by_hash(7).id(), group.by_hash(7).id());
    assert_eq!(group.by_hash(7).id(), 3);
    assert_eq!(group.by_hash(8).id(), 0);
}

#[test]
fn test_group_least_loaded() {
    let group = LaneGroup::new(PoolId::new(1, 1), 0, 2, TaskPrio::LowLatency, 8);
    group.lanes()[0].emplace(make_task(0)).unwrap();
    group.lanes()[0].emplace(make_task(1)).unwrap();
    group.lanes()[1].emplace(make_task(2)).unwrap();

    assert_eq!(group.least_loaded().id(), 1);
    assert_eq!(group.load(), 3);
}

#[tokio::test]
async fn test_emplace_yielding_waits_for_room() {
    let lane = lane(1);
    lane.emplace(make_task(0)).unwrap();

    let producer = Arc::clone(&lane);
    let handle = tokio::spawn(async move { producer.emplace_yielding(make_task(1)).await });

    tokio::task::yield_now().await;
    lane.try_pop().unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(lane.try_pop().unwrap().node.root.unique, 1);
}
