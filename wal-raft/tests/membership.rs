use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;

use fixtures::RaftRouter;
use wal_raft::Role;

mod fixtures;

/// Membership change test.
///
/// What does this test do?
///
/// - brings 3 nodes online and waits for a leader.
/// - removes one follower via a single-step change and asserts the survivors converge on the
///   new membership.
/// - then removes the leader itself and asserts it stops once the change commits, leaving the
///   last member to elect itself.
///
/// RUST_LOG=wal_raft,membership=trace cargo test -p wal-raft --test membership
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_step_removals_down_to_one_node() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    let members = btreeset![0, 1, 2];
    for id in 0..3u64 {
        router.new_raft_node(id, members.clone()).await;
    }
    let leader = router.wait_for_leader(Duration::from_secs(5)).await?;
    router
        .wait_for_metrics(leader, |m| m.last_applied >= 1, Duration::from_secs(2), "gate opens")
        .await?;

    // Remove one follower.
    let removed = (0..3u64).find(|id| *id != leader).unwrap();
    let mut remaining = members.clone();
    remaining.remove(&removed);

    let node = router.get_node(leader).await?;
    node.change_membership(remaining.clone()).await.expect("removal should commit");
    let metrics = router.metrics(leader).await?;
    assert_eq!(metrics.members, remaining);

    // The removed node no longer receives heartbeats; cut it off so its campaigns cannot
    // disturb the remaining pair.
    router.isolate_node(removed).await;

    let survivor = (0..3u64).find(|id| *id != leader && *id != removed).unwrap();
    router
        .wait_for_metrics(
            survivor,
            |m| m.members == remaining,
            Duration::from_secs(2),
            "survivor adopts the new membership",
        )
        .await?;

    // Now the leader removes itself: it keeps replicating until the change commits, then
    // stops, and the survivor takes over as a cluster of one.
    let solo = btreeset![survivor];
    node.change_membership(solo.clone()).await.expect("self-removal should commit");
    router
        .wait_for_metrics(leader, |m| m.role == Role::Stop, Duration::from_secs(2), "removed leader stops")
        .await?;

    router
        .wait_for_metrics(
            survivor,
            |m| m.role == Role::Leader && m.members == solo,
            Duration::from_secs(5),
            "survivor elects itself in the singleton cluster",
        )
        .await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_step_changes_are_rejected() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    let members = btreeset![0, 1, 2];
    for id in 0..3u64 {
        router.new_raft_node(id, members.clone()).await;
    }
    let leader = router.wait_for_leader(Duration::from_secs(5)).await?;
    router
        .wait_for_metrics(leader, |m| m.last_applied >= 1, Duration::from_secs(2), "gate opens")
        .await?;

    let node = router.get_node(leader).await?;
    let res = node.change_membership(btreeset![0]).await;
    assert!(matches!(res, Err(wal_raft::ChangeConfigError::NotSingleStep)), "got {:?}", res);

    let res = node.change_membership(btreeset![]).await;
    assert!(matches!(res, Err(wal_raft::ChangeConfigError::InoperableConfig)), "got {:?}", res);
    Ok(())
}
