//! Raft runtime configuration.

use rand::thread_rng;
use rand::Rng;

use crate::error::ConfigError;

/// Default broadcast (heartbeat) interval in milliseconds.
pub const DEFAULT_BROADCAST_INTERVAL: u64 = 50;
/// Default timeout for the await-condition role in milliseconds.
pub const DEFAULT_AWAIT_CONDITION_TIMEOUT: u64 = 30_000;
/// Default maximum number of entries per AppendEntries payload.
pub const DEFAULT_MAX_APPEND_ENTRIES: u64 = 300;

/// Log compaction policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotPolicy {
    /// A snapshot will be generated once the log has grown the specified number of logs since
    /// the last snapshot.
    LogsSinceLast(u64),
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self::LogsSinceLast(5000)
    }
}

/// The runtime configuration for a Raft node.
///
/// The election timeouts are derived from the broadcast interval, per the protocol's timing
/// requirement `broadcast << election_timeout`. A follower waits for twice the broadcast
/// interval plus a uniformly random one-to-four broadcast intervals before campaigning; a
/// candidate which failed to win waits slightly longer so that a contested election settles.
#[derive(Clone, Debug)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The interval at which leaders will send heartbeats to followers, in milliseconds.
    pub broadcast_interval: u64,
    /// The duration a node will wait in the await-condition role before giving up and
    /// reverting to follower, in milliseconds.
    pub await_condition_timeout: u64,
    /// The maximum number of entries per AppendEntries payload, and per apply-loop batch.
    pub max_append_entries: u64,
    /// The policy for when to emit a release-cursor hint (a safe snapshot point).
    pub snapshot_policy: SnapshotPolicy,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            broadcast_interval: None,
            await_condition_timeout: None,
            max_append_entries: None,
            snapshot_policy: None,
        }
    }

    /// Generate a new random election timeout for a follower, in milliseconds.
    pub fn new_follower_election_timeout(&self) -> u64 {
        let b = self.broadcast_interval;
        2 * b + thread_rng().gen_range(b..4 * b)
    }

    /// Generate a new random election timeout for a candidate, in milliseconds.
    pub fn new_candidate_election_timeout(&self) -> u64 {
        let b = self.broadcast_interval;
        4 * b + thread_rng().gen_range(b..4 * b)
    }
}

/// A configuration builder to ensure that runtime config is valid.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The interval at which leaders will send heartbeats to followers, in milliseconds.
    pub broadcast_interval: Option<u64>,
    /// The timeout for the await-condition role, in milliseconds.
    pub await_condition_timeout: Option<u64>,
    /// The maximum number of entries per AppendEntries payload.
    pub max_append_entries: Option<u64>,
    /// The snapshot policy.
    pub snapshot_policy: Option<SnapshotPolicy>,
}

impl ConfigBuilder {
    /// Set the desired value for `broadcast_interval`.
    pub fn broadcast_interval(mut self, val: u64) -> Self {
        self.broadcast_interval = Some(val);
        self
    }

    /// Set the desired value for `await_condition_timeout`.
    pub fn await_condition_timeout(mut self, val: u64) -> Self {
        self.await_condition_timeout = Some(val);
        self
    }

    /// Set the desired value for `max_append_entries`.
    pub fn max_append_entries(mut self, val: u64) -> Self {
        self.max_append_entries = Some(val);
        self
    }

    /// Set the desired value for `snapshot_policy`.
    pub fn snapshot_policy(mut self, val: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(val);
        self
    }

    /// Validate the state of this builder, returning a usable `Config` on success.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let broadcast_interval = self.broadcast_interval.unwrap_or(DEFAULT_BROADCAST_INTERVAL);
        if broadcast_interval == 0 {
            return Err(ConfigError::InvalidBroadcastInterval);
        }

        let await_condition_timeout = self.await_condition_timeout.unwrap_or(DEFAULT_AWAIT_CONDITION_TIMEOUT);
        if await_condition_timeout < broadcast_interval {
            return Err(ConfigError::InvalidAwaitConditionTimeout);
        }

        let max_append_entries = self.max_append_entries.unwrap_or(DEFAULT_MAX_APPEND_ENTRIES);
        if max_append_entries == 0 {
            return Err(ConfigError::MaxAppendEntriesTooSmall);
        }

        Ok(Config {
            cluster_name: self.cluster_name,
            broadcast_interval,
            await_condition_timeout,
            max_append_entries,
            snapshot_policy: self.snapshot_policy.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_with_defaults() {
        let cfg = Config::build("test".into()).validate().unwrap();
        assert_eq!(cfg.broadcast_interval, DEFAULT_BROADCAST_INTERVAL);
        assert_eq!(cfg.await_condition_timeout, DEFAULT_AWAIT_CONDITION_TIMEOUT);
        assert_eq!(cfg.max_append_entries, DEFAULT_MAX_APPEND_ENTRIES);
        assert_eq!(cfg.snapshot_policy, SnapshotPolicy::LogsSinceLast(5000));
    }

    #[test]
    fn follower_timeout_is_within_spec_range() {
        let cfg = Config::build("test".into()).broadcast_interval(100).validate().unwrap();
        for _ in 0..512 {
            let t = cfg.new_follower_election_timeout();
            assert!((300..600).contains(&t), "timeout {} out of range", t);
        }
    }

    #[test]
    fn candidate_timeout_is_within_spec_range() {
        let cfg = Config::build("test".into()).broadcast_interval(100).validate().unwrap();
        for _ in 0..512 {
            let t = cfg.new_candidate_election_timeout();
            assert!((500..800).contains(&t), "timeout {} out of range", t);
        }
    }

    #[test]
    fn reject_zero_broadcast_interval() {
        let res = Config::build("test".into()).broadcast_interval(0).validate();
        assert!(matches!(res, Err(ConfigError::InvalidBroadcastInterval)));
    }
}
