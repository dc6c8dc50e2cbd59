//! Fixtures for testing Raft.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use memlog::client_apply_fn;
use memlog::ClientMachine;
use memlog::ClientRequest;
use memlog::ClientResponse;
use memlog::MemLog;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;
use wal_raft::async_trait::async_trait;
use wal_raft::metrics::NodeMetrics;
use wal_raft::raft::ClientWriteResponse;
use wal_raft::raft::PeerMessage;
use wal_raft::Config;
use wal_raft::ClientWriteError;
use wal_raft::NodeId;
use wal_raft::Raft;
use wal_raft::RaftNetwork;
use wal_raft::Role;

/// A concrete Raft type used during testing.
pub type MemRaft =
    Raft<ClientRequest, ClientResponse, ClientMachine, RaftRouter, MemLog<ClientRequest, ClientResponse, ClientMachine>>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A test config with short timers so elections settle quickly.
pub fn test_config() -> Arc<Config> {
    Arc::new(
        Config::build("test".into())
            .broadcast_interval(20)
            .await_condition_timeout(500)
            .validate()
            .expect("failed to build Raft config"),
    )
}

/// A type which emulates a network transport and implements the `RaftNetwork` trait.
pub struct RaftRouter {
    /// The Raft runtime config which all nodes are using.
    config: Arc<Config>,
    /// The table of all nodes currently known to this router instance.
    routing_table: RwLock<BTreeMap<NodeId, MemRaft>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<NodeId>>,
}

impl RaftRouter {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            routing_table: RwLock::new(BTreeMap::new()),
            isolated_nodes: RwLock::new(HashSet::new()),
        }
    }

    /// Create and register a new Raft node bearing the given ID, part of `members`.
    pub async fn new_raft_node(self: &Arc<Self>, id: NodeId, members: BTreeSet<NodeId>) {
        let (log, log_events) = MemLog::new();
        let raft = Raft::new(
            id,
            self.config.clone(),
            self.clone(),
            log,
            log_events,
            ClientMachine::default(),
            client_apply_fn(),
            members,
        );
        self.routing_table.write().await.insert(id, raft);
    }

    /// Get a handle to the node with the given ID.
    pub async fn get_node(&self, id: NodeId) -> Result<MemRaft> {
        self.routing_table
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("node {} not found in routing table", id))
    }

    /// Isolate the network of the specified node.
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
    }

    /// Restore the network of the specified node.
    pub async fn restore_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.remove(&id);
    }

    /// The latest metrics snapshot of the given node.
    pub async fn metrics(&self, id: NodeId) -> Result<NodeMetrics> {
        Ok(self.get_node(id).await?.metrics().borrow().clone())
    }

    /// Wait (up to `timeout`) until some node reports itself leader, and return its ID.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let ids: Vec<NodeId> = self.routing_table.read().await.keys().copied().collect();
            for id in ids {
                let metrics = self.metrics(id).await?;
                if metrics.role == Role::Leader {
                    return Ok(id);
                }
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("no leader elected within {:?}", timeout));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Assert that exactly one live node holds the leader role for the highest term in use.
    pub async fn assert_single_leader(&self) -> Result<NodeId> {
        let table = self.routing_table.read().await;
        let mut leaders = Vec::new();
        let mut max_term = 0;
        for (id, raft) in table.iter() {
            let m = raft.metrics().borrow().clone();
            max_term = max_term.max(m.current_term);
            if m.role == Role::Leader {
                leaders.push((*id, m.current_term));
            }
        }
        let at_max: Vec<_> = leaders.iter().filter(|(_, term)| *term == max_term).collect();
        if at_max.len() != 1 {
            return Err(anyhow!("expected one leader at term {}, found {:?}", max_term, leaders));
        }
        Ok(at_max[0].0)
    }

    /// Send a client write to the given node.
    pub async fn client_write(
        &self,
        target: NodeId,
        client: &str,
        serial: u64,
        status: &str,
    ) -> Result<ClientWriteResponse<ClientResponse>, ClientWriteError> {
        let raft = self.get_node(target).await.map_err(|_| ClientWriteError::ForwardToLeader(None))?;
        raft.client_write(ClientRequest {
            client: client.into(),
            serial,
            status: status.into(),
        })
        .await
    }

    /// Wait until the node's metrics satisfy the given condition.
    pub async fn wait_for_metrics<T>(
        &self,
        id: NodeId,
        condition: T,
        timeout: Duration,
        msg: &str,
    ) -> Result<NodeMetrics>
    where
        T: Fn(&NodeMetrics) -> bool,
    {
        let raft = self.get_node(id).await?;
        Ok(raft.wait(Some(timeout)).metrics(condition, msg).await?)
    }
}

#[async_trait]
impl RaftNetwork<ClientRequest, ClientResponse, ClientMachine> for RaftRouter {
    async fn send(
        &self,
        target: NodeId,
        msg: PeerMessage<ClientRequest, ClientResponse, ClientMachine>,
    ) -> Result<()> {
        let source = match &msg {
            PeerMessage::AppendEntries(req) => req.leader_id,
            PeerMessage::RequestVote(req) => req.candidate_id,
            PeerMessage::InstallSnapshot(req) => req.leader_id,
            PeerMessage::AppendEntriesResult { from, .. }
            | PeerMessage::RequestVoteResult { from, .. }
            | PeerMessage::InstallSnapshotResult { from, .. } => *from,
        };
        {
            let isolated = self.isolated_nodes.read().await;
            if isolated.contains(&source) || isolated.contains(&target) {
                return Ok(());
            }
        }
        let raft = self.get_node(target).await?;
        raft.deliver(msg).map_err(|err| anyhow!("delivery to {} failed: {}", target, err))
    }
}
