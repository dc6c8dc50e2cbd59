use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use memlog::ClientRequest;
use memlog::ClientResponse;

use fixtures::RaftRouter;
use wal_raft::ClientWriteError;

mod fixtures;

/// Client interaction test.
///
/// What does this test do?
///
/// - brings 3 nodes online and waits for a leader.
/// - writes through the leader, asserting the state-machine response reflects prior state.
/// - asserts that writes replicate and apply on every member.
/// - reads back through a consistent query.
/// - asserts that writes against a follower are redirected to the leader.
///
/// RUST_LOG=wal_raft,client_writes=trace cargo test -p wal-raft --test client_writes
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn writes_replicate_apply_and_read_back() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    let members = btreeset![0, 1, 2];
    for id in 0..3u64 {
        router.new_raft_node(id, members.clone()).await;
    }
    let leader = router.wait_for_leader(Duration::from_secs(5)).await?;

    // First status write for this client: no previous value.
    let resp = router.client_write(leader, "client-1", 0, "ready").await.expect("write should succeed");
    assert_eq!(resp.data, Some(ClientResponse(None)));

    // Second write returns the previously recorded status.
    let resp = router.client_write(leader, "client-1", 1, "busy").await.expect("write should succeed");
    assert_eq!(resp.data, Some(ClientResponse(Some("ready".into()))));
    let applied_through = resp.log_id.index;

    // Every member applies the writes.
    for id in 0..3u64 {
        router
            .wait_for_metrics(
                id,
                |m| m.last_applied >= applied_through,
                Duration::from_secs(2),
                "write applied on every member",
            )
            .await?;
    }

    // A consistent quorum read observes the latest status.
    let node = router.get_node(leader).await?;
    let read = node
        .client_query(Arc::new(|m| ClientResponse(m.client_status.get("client-1").cloned())))
        .await
        .expect("query should succeed");
    assert_eq!(read, Some(ClientResponse(Some("busy".into()))));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_redirects_writes_to_the_leader() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    let members = btreeset![0, 1, 2];
    for id in 0..3u64 {
        router.new_raft_node(id, members.clone()).await;
    }
    let leader = router.wait_for_leader(Duration::from_secs(5)).await?;
    let follower = (0..3u64).find(|id| *id != leader).unwrap();

    // Let the follower hear from the leader before asserting the redirect target.
    router
        .wait_for_metrics(
            follower,
            |m| m.current_leader == Some(leader),
            Duration::from_secs(2),
            "follower learns the leader",
        )
        .await?;

    let res = router.client_write(follower, "client-1", 0, "ready").await;
    match res {
        Err(ClientWriteError::ForwardToLeader(hint)) => assert_eq!(hint, Some(leader)),
        other => panic!("expected ForwardToLeader, got {:?}", other),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn notify_mode_fires_after_consensus() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    let members = btreeset![0, 1];
    for id in 0..2u64 {
        router.new_raft_node(id, members.clone()).await;
    }
    let leader = router.wait_for_leader(Duration::from_secs(5)).await?;

    let node = router.get_node(leader).await?;
    let mut rx = node.client_write_notify(ClientRequest {
        client: "client-9".into(),
        serial: 0,
        status: "observed".into(),
    })?;

    let notice = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await?
        .expect("a notification must arrive");
    let resp = notice.expect("the write must commit");
    assert_eq!(resp.log_id().index, 2, "the noop occupies index 1");
    Ok(())
}
