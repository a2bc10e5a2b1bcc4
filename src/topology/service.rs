/// Topology Service Interfaces
///
/// Async trait seams for the external collaborators the recovery engine
/// drives: the instance inventory / replication-topology service, the shard
/// lock service, the audit journal, the cluster KV distribution and the
/// operator hook subprocess runner. Production wiring binds these to the
/// real services; tests substitute in-memory mocks.

use crate::error::{RecoveryError, Result};
use crate::recovery::analysis::AnalysisEntry;
use crate::recovery::postponed::PostponedWork;
use crate::recovery::record::{BlockedRecovery, RecoverySnapshot, RecoveryStep};
use crate::topology::instance::{BinlogCoordinates, Instance, InstanceKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// GTID usage hint for repoint operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GtidHint {
    Deny,
    Neutral,
    Force,
}

/// Role a tablet currently serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletType {
    Primary,
    Replica,
    Drained,
}

/// A key-value pair published to the cluster KV distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    pub key: String,
    pub value: String,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Result of regrouping the replicas of a failed instance under one of them.
#[derive(Debug, Clone, Default)]
pub struct RegroupOutcome {
    /// Replicas that could not be brought under the promoted one
    pub lost_replicas: Vec<Instance>,
    /// Replicas already aligned with the promoted one
    pub equal_replicas: Vec<Instance>,
    /// Replicas unable to replicate from the promoted one at all
    pub cannot_replicate_replicas: Vec<Instance>,
    pub promoted: Option<Instance>,
}

/// Result of relocating a set of replicas under a new source.
#[derive(Debug, Clone, Default)]
pub struct RelocationOutcome {
    pub relocated: Vec<Instance>,
    /// The adoptive source, re-read after the relocation
    pub target: Option<Instance>,
    /// Per-replica failures; relocation is best-effort
    pub errors: Vec<String>,
}

/// Predicate consulted by GTID regrouping: is the picked replica already the
/// ideal promotion target? The second argument reports whether that replica
/// carries the best promotion rule among its siblings.
pub type IdealPromotionCheck<'a> = &'a (dyn Fn(&Instance, bool) -> bool + Send + Sync);

/// Instance inventory and replication-topology primitives.
///
/// All operations are individually non-idempotent; callers run each to
/// completion or failure and check cancellation only between steps.
#[async_trait]
pub trait Topology: Send + Sync {
    async fn read_instance(&self, key: &InstanceKey) -> Result<Option<Instance>>;
    async fn read_replica_instances(&self, key: &InstanceKey) -> Result<Vec<Instance>>;
    /// Like `read_replica_instances` but descending through binlog-relay nodes.
    async fn read_replica_instances_including_relays(
        &self,
        key: &InstanceKey,
    ) -> Result<Vec<Instance>>;
    async fn read_binlog_server_replica_instances(
        &self,
        key: &InstanceKey,
    ) -> Result<Vec<Instance>>;
    async fn read_cluster_candidate_instances(&self, cluster: &str) -> Result<Vec<Instance>>;
    async fn read_cluster_neutral_promotion_rule_instances(
        &self,
        cluster: &str,
    ) -> Result<Vec<Instance>>;
    async fn read_cluster_alias_instances(&self, alias: &str) -> Result<Vec<Instance>>;
    async fn read_cluster_primary(&self, cluster: &str) -> Result<Vec<Instance>>;

    async fn regroup_replicas_gtid(
        &self,
        failed_key: &InstanceKey,
        ignore_errors: bool,
        postponed: &PostponedWork,
        promoted_is_ideal: Option<IdealPromotionCheck<'_>>,
    ) -> Result<RegroupOutcome>;
    /// Position-based regroup, used when GTID is unavailable.
    async fn regroup_replicas(
        &self,
        failed_key: &InstanceKey,
        ignore_errors: bool,
    ) -> Result<RegroupOutcome>;
    /// Regroups binlog-relay nodes, returning the promoted relay.
    async fn regroup_replicas_binlog_servers(
        &self,
        failed_key: &InstanceKey,
    ) -> Result<Instance>;
    async fn get_candidate_replica_of_binlog_server_topology(
        &self,
        relay_key: &InstanceKey,
    ) -> Result<Instance>;

    async fn stop_replication(&self, key: &InstanceKey) -> Result<Instance>;
    async fn start_replication(&self, key: &InstanceKey) -> Result<Instance>;
    async fn restart_replication(&self, key: &InstanceKey) -> Result<()>;
    async fn stop_replicas_nicely(
        &self,
        replicas: &[Instance],
        timeout: Duration,
    ) -> Result<Vec<Instance>>;
    async fn start_replication_until_primary_coordinates(
        &self,
        key: &InstanceKey,
        coordinates: &BinlogCoordinates,
    ) -> Result<Instance>;
    async fn reset_replication(&self, key: &InstanceKey) -> Result<Instance>;

    async fn flush_binary_logs(&self, key: &InstanceKey, count: u32) -> Result<Instance>;
    async fn flush_binary_logs_to(&self, key: &InstanceKey, log_file: &str) -> Result<Instance>;
    async fn purge_binary_logs_to_latest(&self, key: &InstanceKey) -> Result<Instance>;
    async fn skip_to_next_binary_log(&self, key: &InstanceKey) -> Result<Instance>;

    async fn repoint(
        &self,
        key: &InstanceKey,
        parent: &InstanceKey,
        gtid_hint: GtidHint,
    ) -> Result<Instance>;
    async fn take_primary(&self, key: &InstanceKey, allow_co_primary: bool) -> Result<Instance>;
    async fn relocate_replicas(
        &self,
        from: &InstanceKey,
        to: &InstanceKey,
        pattern: &str,
    ) -> Result<RelocationOutcome>;
    async fn detach_replica_primary_host(&self, key: &InstanceKey) -> Result<()>;
    async fn change_primary_to(
        &self,
        key: &InstanceKey,
        new_primary: &InstanceKey,
        coordinates: &BinlogCoordinates,
        gtid_hint: GtidHint,
    ) -> Result<Instance>;
    async fn move_below_gtid(&self, key: &InstanceKey, below: &InstanceKey) -> Result<Instance>;
    async fn check_move_via_gtid(&self, instance: &Instance, below: &Instance) -> Result<()>;

    async fn set_read_only(&self, key: &InstanceKey, read_only: bool) -> Result<Instance>;
    async fn set_semi_sync_primary(&self, key: &InstanceKey, enabled: bool) -> Result<()>;
    /// Number of semi-sync replicas expected by the given primary.
    async fn primary_semi_sync(&self, key: &InstanceKey) -> u32;

    async fn wait_for_sql_thread_up_to_date(
        &self,
        key: &InstanceKey,
        overall_timeout: Option<Duration>,
        stale_timeout: Option<Duration>,
    ) -> Result<Instance>;
    async fn wait_for_exec_binlog_coordinates_to_reach(
        &self,
        key: &InstanceKey,
        coordinates: &BinlogCoordinates,
        timeout: Duration,
    ) -> Result<Instance>;

    async fn change_tablet_type(&self, key: &InstanceKey, tablet_type: TabletType) -> Result<()>;
    async fn tablet_demote_primary(&self, key: &InstanceKey) -> Result<()>;
    async fn tablet_undo_demote_primary(&self, key: &InstanceKey) -> Result<()>;
    async fn tablet_refresh(&self, key: &InstanceKey) -> Result<TabletType>;
    async fn shard_primary(&self, key: &InstanceKey) -> Result<InstanceKey>;

    async fn begin_downtime(
        &self,
        key: &InstanceKey,
        owner: &str,
        reason: &str,
        duration: Duration,
    ) -> Result<()>;
    async fn end_downtime(&self, key: &InstanceKey) -> Result<()>;
    async fn record_stale_binlog_coordinates(
        &self,
        key: &InstanceKey,
        coordinates: &BinlogCoordinates,
    ) -> Result<()>;

    async fn set_cluster_alias(&self, cluster_code: &str, alias: &str) -> Result<()>;
    async fn replace_alias_cluster_name(&self, before: &str, after: &str) -> Result<()>;
}

/// A held shard lock. Release records the guarded operation's final outcome.
#[async_trait]
pub trait ShardLock: Send + Sync {
    async fn unlock(self: Box<Self>, outcome: Option<&RecoveryError>);
}

/// Distributed lock service keyed by the shard a recovery targets.
#[async_trait]
pub trait ShardLocker: Send + Sync {
    async fn lock_shard(&self, key: &InstanceKey) -> Result<Box<dyn ShardLock>>;
}

/// Persistent audit / recovery log.
#[async_trait]
pub trait Journal: Send + Sync {
    async fn write_recovery(&self, recovery: &RecoverySnapshot) -> Result<()>;
    async fn write_recovery_step(&self, step: &RecoveryStep) -> Result<()>;
    async fn write_resolve_recovery(&self, recovery: &RecoverySnapshot) -> Result<()>;
    async fn write_blocked_recovery(&self, blocked: &BlockedRecovery) -> Result<()>;
    async fn write_failure_detection(
        &self,
        analysis: &AnalysisEntry,
        detection_id: u64,
    ) -> Result<()>;
}

/// Cluster key-value distribution.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put_kv_pair(&self, pair: &KvPair) -> Result<()>;
    async fn distribute_pairs(&self, pairs: &[KvPair]) -> Result<()>;
    async fn set_general_attribute(&self, domain: &str, value: &str) -> Result<()>;
}

/// Operator hook subprocess runner.
#[async_trait]
pub trait HookExecutor: Send + Sync {
    async fn command_run(&self, command: &str, env: &[String]) -> Result<()>;
}
