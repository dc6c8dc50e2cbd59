use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;

use fixtures::RaftRouter;
use wal_raft::Role;

mod fixtures;

/// Cluster election test.
///
/// What does this test do?
///
/// - brings 3 nodes online, all knowing the same initial membership.
/// - asserts that exactly one of them wins the election for the highest term in use.
/// - asserts that the new leader commits and applies its noop.
/// - asserts that the remaining nodes settle as followers behind that leader.
///
/// RUST_LOG=wal_raft,election=trace cargo test -p wal-raft --test election
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_cluster_elects_a_single_leader() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    let members = btreeset![0, 1, 2];
    for id in 0..3u64 {
        router.new_raft_node(id, members.clone()).await;
    }

    let leader = router.wait_for_leader(Duration::from_secs(5)).await?;

    // The leader's noop for its term must commit and apply.
    router
        .wait_for_metrics(
            leader,
            |m| m.last_applied >= 1 && m.commit_index >= 1,
            Duration::from_secs(2),
            "leader noop applied",
        )
        .await?;

    router.assert_single_leader().await?;

    for id in 0..3u64 {
        if id == leader {
            continue;
        }
        let metrics = router
            .wait_for_metrics(
                id,
                |m| m.current_leader == Some(leader) && m.role == Role::Follower,
                Duration::from_secs(2),
                "follower settles behind the leader",
            )
            .await?;
        assert_eq!(metrics.members, members);
    }
    Ok(())
}

/// A cluster of one elects itself without any peers.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_node_cluster_becomes_leader() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    router.new_raft_node(0, btreeset![0]).await;

    let leader = router.wait_for_leader(Duration::from_secs(5)).await?;
    assert_eq!(leader, 0);
    router
        .wait_for_metrics(0, |m| m.last_applied >= 1, Duration::from_secs(2), "noop applied on its own")
        .await?;
    Ok(())
}

/// An isolated leader abdicates once it reconnects and sees the new term.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partitioned_leader_steps_down_on_reconnect() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    let members = btreeset![0, 1, 2];
    for id in 0..3u64 {
        router.new_raft_node(id, members.clone()).await;
    }
    let old_leader = router.wait_for_leader(Duration::from_secs(5)).await?;
    let old_term = router.metrics(old_leader).await?.current_term;

    router.isolate_node(old_leader).await;

    // The remaining majority elects a replacement at a higher term.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let new_leader = loop {
        let mut found = None;
        for id in (0..3u64).filter(|id| *id != old_leader) {
            let m = router.metrics(id).await?;
            if m.role == Role::Leader && m.current_term > old_term {
                found = Some(id);
            }
        }
        if let Some(id) = found {
            break id;
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("no replacement leader elected");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    router.restore_node(old_leader).await;
    router
        .wait_for_metrics(
            old_leader,
            |m| m.role == Role::Follower && m.current_leader == Some(new_leader),
            Duration::from_secs(2),
            "old leader steps down behind the new one",
        )
        .await?;
    Ok(())
}
