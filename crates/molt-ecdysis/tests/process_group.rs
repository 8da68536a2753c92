//! End-to-end process group lifecycle over the in-memory transport.

mod common;

use std::time::Duration;

use common::{fast_policy, init_tracing, wait_until, Group, FIRST_CHILD_PID};
use molt_ecdysis::{LoopExit, Operation};

/// Full lifecycle: start, registration, heartbeats, the child's shutdown and
/// departure, and the main exiting once its registry is empty again.
#[tokio::test]
async fn test_group_start_heartbeat_and_departure() {
    init_tracing();
    let group = Group::start(fast_policy());

    // The main spawns one child, which starts serving and announces itself.
    wait_until("child registered", || group.registry.contains(FIRST_CHILD_PID)).await;
    assert_eq!(group.registry.size(), 1);
    assert!(!group.registry.has_pending());

    let child = group.spawner.child(FIRST_CHILD_PID);
    assert!(child.host.started_with().unwrap().is_empty());
    assert_eq!(child.host.listeners().len(), 1);

    // Heartbeats from the main keep moving the child's contact time.
    let before = child.contact.last_contact_ms();
    tokio::time::sleep(Duration::from_millis(100)).await;
    wait_until("parent contact advanced", || {
        child.contact.last_contact_ms() > before
    })
    .await;

    // The child is told to stop: it drains and reports its removal.
    assert!(child.local.inject(Operation::Shutdown, Vec::new()));
    assert_eq!(child.join().await, LoopExit::Shutdown);
    assert!(child.host.listeners().iter().all(|l| l.was_drained()));

    let registry = group.registry.clone();
    wait_until("child removed", || registry.is_empty()).await;
    assert_eq!(group.join().await, LoopExit::AllChildrenGone);
    assert_eq!(registry.size(), 0);
    assert!(registry.is_settled_empty());
}

/// A group shutdown ends the main at once; children drain on their own.
#[tokio::test]
async fn test_group_shutdown_forwards_to_child() {
    init_tracing();
    let group = Group::start(fast_policy());
    wait_until("child registered", || group.registry.contains(FIRST_CHILD_PID)).await;

    let child = group.spawner.child(FIRST_CHILD_PID);
    assert!(group.local.inject(Operation::Shutdown, Vec::new()));
    assert_eq!(group.join().await, LoopExit::Shutdown);
    assert_eq!(child.join().await, LoopExit::Shutdown);
    assert!(child.host.listeners().iter().all(|l| l.was_drained()));
}

#[tokio::test]
async fn test_main_evicts_vanished_child() {
    init_tracing();
    let group = Group::start(fast_policy());
    wait_until("child registered", || group.registry.contains(FIRST_CHILD_PID)).await;

    // The child dies without a word: its endpoint disappears.
    let child = group.spawner.child(FIRST_CHILD_PID);
    group.network.disconnect(FIRST_CHILD_PID);

    let registry = group.registry.clone();
    assert_eq!(group.join().await, LoopExit::AllChildrenGone);
    assert!(registry.is_empty());
    assert_eq!(child.join().await, LoopExit::TransportClosed);
}

#[tokio::test]
async fn test_duplicate_start_is_ignored() {
    init_tracing();
    let group = Group::start(fast_policy());
    wait_until("child registered", || group.registry.contains(FIRST_CHILD_PID)).await;

    let child = group.spawner.child(FIRST_CHILD_PID);
    assert!(child.local.inject(Operation::Start, Vec::new()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(group.spawner.spawned(), 1);
    assert_eq!(child.host.listeners().len(), 1);

    assert!(group.local.inject(Operation::Shutdown, Vec::new()));
    assert_eq!(group.join().await, LoopExit::Shutdown);
    assert_eq!(child.join().await, LoopExit::Shutdown);
}
