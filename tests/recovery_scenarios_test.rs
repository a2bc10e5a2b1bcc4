// Recovery Scenario Integration Tests
//
// These tests drive the full recovery engine against an in-memory mock
// topology: dead-primary failover, geographic vetoes, intermediate-primary
// relocation plans, primary election, concurrent detection and postponed
// work ordering.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use rusty_failover::config::RecoveryConfig;
use rusty_failover::error::{RecoveryError, Result};
use rusty_failover::recovery::analysis::{AnalysisCode, AnalysisEntry};
use rusty_failover::recovery::postponed::PostponedWork;
use rusty_failover::recovery::record::{BlockedRecovery, RecoverySnapshot, RecoveryStep};
use rusty_failover::recovery::RecoveryEngine;
use rusty_failover::topology::instance::{
    BinlogCoordinates, Instance, InstanceKey, PromotionRule,
};
use rusty_failover::topology::service::{
    GtidHint, HookExecutor, IdealPromotionCheck, Journal, KvPair, KvStore, RegroupOutcome,
    RelocationOutcome, ShardLock, ShardLocker, TabletType, Topology,
};

type EventLog = Arc<Mutex<Vec<String>>>;

// ---------------------------------------------------------------------------
// Mock collaborators
// ---------------------------------------------------------------------------

struct MockTopology {
    instances: Mutex<HashMap<InstanceKey, Instance>>,
    tablet_types: Mutex<HashMap<InstanceKey, TabletType>>,
    /// Replicas that drop off during any regroup
    lost_during_regroup: Mutex<HashSet<InstanceKey>>,
    /// Pairs that cannot be moved via GTID, in either given direction
    incompatible_pairs: Mutex<HashSet<(InstanceKey, InstanceKey)>>,
    events: EventLog,
}

impl MockTopology {
    fn new(events: EventLog) -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            tablet_types: Mutex::new(HashMap::new()),
            lost_during_regroup: Mutex::new(HashSet::new()),
            incompatible_pairs: Mutex::new(HashSet::new()),
            events,
        }
    }

    fn add(&self, instance: Instance) {
        self.instances.lock().insert(instance.key.clone(), instance);
    }

    fn get(&self, key: &InstanceKey) -> Option<Instance> {
        self.instances.lock().get(key).cloned()
    }

    fn log(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    fn replicas_of(&self, key: &InstanceKey) -> Vec<Instance> {
        let mut replicas: Vec<Instance> = self
            .instances
            .lock()
            .values()
            .filter(|instance| &instance.source_key == key)
            .cloned()
            .collect();
        replicas.sort_by(|a, b| a.key.cmp(&b.key));
        replicas
    }

    fn promotion_rank(rule: PromotionRule) -> u8 {
        match rule {
            PromotionRule::MustPromote => 0,
            PromotionRule::PreferPromote => 1,
            PromotionRule::Neutral => 2,
            PromotionRule::PreferNotPromote => 3,
            PromotionRule::MustNotPromote => 4,
        }
    }

    fn regroup(&self, failed_key: &InstanceKey) -> Result<RegroupOutcome> {
        let lost_keys = self.lost_during_regroup.lock().clone();
        let mut survivors = Vec::new();
        let mut lost = Vec::new();
        for replica in self.replicas_of(failed_key) {
            if lost_keys.contains(&replica.key) {
                lost.push(replica);
            } else {
                survivors.push(replica);
            }
        }
        survivors.retain(|replica| {
            replica.is_last_check_valid
                && replica.log_bin_enabled
                && !replica.is_binlog_server
                && replica.promotion_rule != PromotionRule::MustNotPromote
        });
        survivors.sort_by(|a, b| {
            Self::promotion_rank(a.promotion_rule)
                .cmp(&Self::promotion_rank(b.promotion_rule))
                .then_with(|| b.exec_binlog_coordinates.cmp(&a.exec_binlog_coordinates))
                .then_with(|| a.key.cmp(&b.key))
        });
        let Some(promoted) = survivors.first().cloned() else {
            return Err(RecoveryError::StepFailed(format!(
                "no replacement found for {}",
                failed_key
            )));
        };
        let equal: Vec<Instance> =
            survivors.iter().skip(1).cloned().collect();
        {
            let mut instances = self.instances.lock();
            if let Some(promoted) = instances.get_mut(&promoted.key) {
                promoted.source_key = InstanceKey::default();
            }
            for replica in &equal {
                if let Some(replica) = instances.get_mut(&replica.key) {
                    replica.source_key = promoted.key.clone();
                }
            }
        }
        Ok(RegroupOutcome {
            lost_replicas: lost,
            equal_replicas: equal,
            cannot_replicate_replicas: Vec::new(),
            promoted: Some(promoted),
        })
    }
}

#[async_trait]
impl Topology for MockTopology {
    async fn read_instance(&self, key: &InstanceKey) -> Result<Option<Instance>> {
        Ok(self.get(key))
    }

    async fn read_replica_instances(&self, key: &InstanceKey) -> Result<Vec<Instance>> {
        Ok(self.replicas_of(key))
    }

    async fn read_replica_instances_including_relays(
        &self,
        key: &InstanceKey,
    ) -> Result<Vec<Instance>> {
        Ok(self.replicas_of(key))
    }

    async fn read_binlog_server_replica_instances(
        &self,
        key: &InstanceKey,
    ) -> Result<Vec<Instance>> {
        Ok(self
            .replicas_of(key)
            .into_iter()
            .filter(|replica| replica.is_binlog_server)
            .collect())
    }

    async fn read_cluster_candidate_instances(&self, cluster: &str) -> Result<Vec<Instance>> {
        let mut candidates: Vec<Instance> = self
            .instances
            .lock()
            .values()
            .filter(|instance| instance.cluster_name == cluster && instance.is_candidate)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(candidates)
    }

    async fn read_cluster_neutral_promotion_rule_instances(
        &self,
        cluster: &str,
    ) -> Result<Vec<Instance>> {
        let mut neutral: Vec<Instance> = self
            .instances
            .lock()
            .values()
            .filter(|instance| {
                instance.cluster_name == cluster
                    && instance.promotion_rule == PromotionRule::Neutral
            })
            .cloned()
            .collect();
        neutral.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(neutral)
    }

    async fn read_cluster_alias_instances(&self, alias: &str) -> Result<Vec<Instance>> {
        let mut instances: Vec<Instance> = self
            .instances
            .lock()
            .values()
            .filter(|instance| instance.cluster_name == alias)
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(instances)
    }

    async fn read_cluster_primary(&self, cluster: &str) -> Result<Vec<Instance>> {
        Ok(self
            .instances
            .lock()
            .values()
            .filter(|instance| {
                instance.cluster_name == cluster && !instance.source_key.is_valid()
            })
            .cloned()
            .collect())
    }

    async fn regroup_replicas_gtid(
        &self,
        failed_key: &InstanceKey,
        _ignore_errors: bool,
        _postponed: &PostponedWork,
        promoted_is_ideal: Option<IdealPromotionCheck<'_>>,
    ) -> Result<RegroupOutcome> {
        self.log(format!("regroup_replicas_gtid:{}", failed_key));
        let outcome = self.regroup(failed_key)?;
        if let (Some(ideal), Some(promoted)) = (promoted_is_ideal, outcome.promoted.as_ref()) {
            ideal(promoted, true);
        }
        Ok(outcome)
    }

    async fn regroup_replicas(
        &self,
        failed_key: &InstanceKey,
        _ignore_errors: bool,
    ) -> Result<RegroupOutcome> {
        self.log(format!("regroup_replicas:{}", failed_key));
        self.regroup(failed_key)
    }

    async fn regroup_replicas_binlog_servers(&self, failed_key: &InstanceKey) -> Result<Instance> {
        self.log(format!("regroup_replicas_binlog_servers:{}", failed_key));
        self.replicas_of(failed_key)
            .into_iter()
            .find(|replica| replica.is_binlog_server)
            .ok_or_else(|| RecoveryError::NotFound("no binlog server".to_string()))
    }

    async fn get_candidate_replica_of_binlog_server_topology(
        &self,
        relay_key: &InstanceKey,
    ) -> Result<Instance> {
        self.replicas_of(relay_key)
            .into_iter()
            .find(|replica| !replica.is_binlog_server)
            .ok_or_else(|| RecoveryError::NotFound("no candidate below relay".to_string()))
    }

    async fn stop_replication(&self, key: &InstanceKey) -> Result<Instance> {
        self.log(format!("stop_replication:{}", key));
        self.get(key)
            .ok_or_else(|| RecoveryError::NotFound(key.to_string()))
    }

    async fn start_replication(&self, key: &InstanceKey) -> Result<Instance> {
        self.log(format!("start_replication:{}", key));
        self.get(key)
            .ok_or_else(|| RecoveryError::NotFound(key.to_string()))
    }

    async fn restart_replication(&self, key: &InstanceKey) -> Result<()> {
        self.log(format!("restart_replication:{}", key));
        Ok(())
    }

    async fn stop_replicas_nicely(
        &self,
        replicas: &[Instance],
        _timeout: Duration,
    ) -> Result<Vec<Instance>> {
        self.log(format!("stop_replicas_nicely:{}", replicas.len()));
        Ok(replicas.to_vec())
    }

    async fn start_replication_until_primary_coordinates(
        &self,
        key: &InstanceKey,
        _coordinates: &BinlogCoordinates,
    ) -> Result<Instance> {
        self.log(format!("start_replication_until:{}", key));
        self.get(key)
            .ok_or_else(|| RecoveryError::NotFound(key.to_string()))
    }

    async fn reset_replication(&self, key: &InstanceKey) -> Result<Instance> {
        self.log(format!("reset_replication:{}", key));
        self.get(key)
            .ok_or_else(|| RecoveryError::NotFound(key.to_string()))
    }

    async fn flush_binary_logs(&self, key: &InstanceKey, _count: u32) -> Result<Instance> {
        self.get(key)
            .ok_or_else(|| RecoveryError::NotFound(key.to_string()))
    }

    async fn flush_binary_logs_to(&self, key: &InstanceKey, _log_file: &str) -> Result<Instance> {
        self.get(key)
            .ok_or_else(|| RecoveryError::NotFound(key.to_string()))
    }

    async fn purge_binary_logs_to_latest(&self, key: &InstanceKey) -> Result<Instance> {
        self.get(key)
            .ok_or_else(|| RecoveryError::NotFound(key.to_string()))
    }

    async fn skip_to_next_binary_log(&self, key: &InstanceKey) -> Result<Instance> {
        self.get(key)
            .ok_or_else(|| RecoveryError::NotFound(key.to_string()))
    }

    async fn repoint(
        &self,
        key: &InstanceKey,
        parent: &InstanceKey,
        _gtid_hint: GtidHint,
    ) -> Result<Instance> {
        self.log(format!("repoint:{}:{}", key, parent));
        let mut instances = self.instances.lock();
        let instance = instances
            .get_mut(key)
            .ok_or_else(|| RecoveryError::NotFound(key.to_string()))?;
        instance.source_key = parent.clone();
        Ok(instance.clone())
    }

    async fn take_primary(&self, key: &InstanceKey, _allow_co_primary: bool) -> Result<Instance> {
        self.log(format!("take_primary:{}", key));
        let mut instances = self.instances.lock();
        let candidate = instances
            .get(key)
            .cloned()
            .ok_or_else(|| RecoveryError::NotFound(key.to_string()))?;
        let old_source = candidate.source_key.clone();
        let grandparent = instances
            .get(&old_source)
            .map(|parent| parent.source_key.clone())
            .unwrap_or_default();
        if let Some(candidate) = instances.get_mut(key) {
            candidate.source_key = grandparent;
        }
        if let Some(parent) = instances.get_mut(&old_source) {
            parent.source_key = key.clone();
        }
        Ok(instances.get(key).cloned().expect("candidate exists"))
    }

    async fn relocate_replicas(
        &self,
        from: &InstanceKey,
        to: &InstanceKey,
        _pattern: &str,
    ) -> Result<RelocationOutcome> {
        self.log(format!("relocate_replicas:{}:{}", from, to));
        let replicas = self.replicas_of(from);
        let mut relocated = Vec::new();
        {
            let mut instances = self.instances.lock();
            for replica in &replicas {
                if &replica.key == to {
                    continue;
                }
                if let Some(replica) = instances.get_mut(&replica.key) {
                    replica.source_key = to.clone();
                    relocated.push(replica.clone());
                }
            }
        }
        Ok(RelocationOutcome {
            relocated,
            target: self.get(to),
            errors: Vec::new(),
        })
    }

    async fn detach_replica_primary_host(&self, key: &InstanceKey) -> Result<()> {
        self.log(format!("detach_replica_primary_host:{}", key));
        Ok(())
    }

    async fn change_primary_to(
        &self,
        key: &InstanceKey,
        new_primary: &InstanceKey,
        _coordinates: &BinlogCoordinates,
        _gtid_hint: GtidHint,
    ) -> Result<Instance> {
        self.log(format!("change_primary_to:{}:{}", key, new_primary));
        let mut instances = self.instances.lock();
        let instance = instances
            .get_mut(key)
            .ok_or_else(|| RecoveryError::NotFound(key.to_string()))?;
        instance.source_key = new_primary.clone();
        Ok(instance.clone())
    }

    async fn move_below_gtid(&self, key: &InstanceKey, below: &InstanceKey) -> Result<Instance> {
        self.log(format!("move_below_gtid:{}:{}", key, below));
        let incompatible = self.incompatible_pairs.lock();
        if incompatible.contains(&(key.clone(), below.clone())) {
            return Err(RecoveryError::StepFailed(format!(
                "cannot move {} below {}",
                key, below
            )));
        }
        drop(incompatible);
        let mut instances = self.instances.lock();
        let instance = instances
            .get_mut(key)
            .ok_or_else(|| RecoveryError::NotFound(key.to_string()))?;
        instance.source_key = below.clone();
        Ok(instance.clone())
    }

    async fn check_move_via_gtid(&self, instance: &Instance, below: &Instance) -> Result<()> {
        if self
            .incompatible_pairs
            .lock()
            .contains(&(instance.key.clone(), below.key.clone()))
        {
            return Err(RecoveryError::StepFailed(format!(
                "cannot move {} below {}",
                instance.key, below.key
            )));
        }
        Ok(())
    }

    async fn set_read_only(&self, key: &InstanceKey, read_only: bool) -> Result<Instance> {
        self.log(format!("set_read_only:{}:{}", key, read_only));
        let mut instances = self.instances.lock();
        let instance = instances
            .get_mut(key)
            .ok_or_else(|| RecoveryError::NotFound(key.to_string()))?;
        instance.read_only = read_only;
        Ok(instance.clone())
    }

    async fn set_semi_sync_primary(&self, key: &InstanceKey, enabled: bool) -> Result<()> {
        self.log(format!("set_semi_sync_primary:{}:{}", key, enabled));
        Ok(())
    }

    async fn primary_semi_sync(&self, _key: &InstanceKey) -> u32 {
        0
    }

    async fn wait_for_sql_thread_up_to_date(
        &self,
        key: &InstanceKey,
        _overall_timeout: Option<Duration>,
        _stale_timeout: Option<Duration>,
    ) -> Result<Instance> {
        self.log(format!("wait_for_sql_thread:{}", key));
        let mut instance = self
            .get(key)
            .ok_or_else(|| RecoveryError::NotFound(key.to_string()))?;
        instance.sql_thread_up_to_date = true;
        Ok(instance)
    }

    async fn wait_for_exec_binlog_coordinates_to_reach(
        &self,
        key: &InstanceKey,
        _coordinates: &BinlogCoordinates,
        _timeout: Duration,
    ) -> Result<Instance> {
        self.log(format!("wait_for_exec_coordinates:{}", key));
        self.get(key)
            .ok_or_else(|| RecoveryError::NotFound(key.to_string()))
    }

    async fn change_tablet_type(&self, key: &InstanceKey, tablet_type: TabletType) -> Result<()> {
        self.log(format!("change_tablet_type:{}:{:?}", key, tablet_type));
        self.tablet_types.lock().insert(key.clone(), tablet_type);
        Ok(())
    }

    async fn tablet_demote_primary(&self, key: &InstanceKey) -> Result<()> {
        self.log(format!("tablet_demote_primary:{}", key));
        Ok(())
    }

    async fn tablet_undo_demote_primary(&self, key: &InstanceKey) -> Result<()> {
        self.log(format!("tablet_undo_demote_primary:{}", key));
        Ok(())
    }

    async fn tablet_refresh(&self, key: &InstanceKey) -> Result<TabletType> {
        Ok(self
            .tablet_types
            .lock()
            .get(key)
            .copied()
            .unwrap_or(TabletType::Primary))
    }

    async fn shard_primary(&self, key: &InstanceKey) -> Result<InstanceKey> {
        let cluster = self
            .get(key)
            .map(|instance| instance.cluster_name)
            .ok_or_else(|| RecoveryError::NotFound(key.to_string()))?;
        self.instances
            .lock()
            .values()
            .find(|instance| instance.cluster_name == cluster && !instance.source_key.is_valid())
            .map(|instance| instance.key.clone())
            .ok_or_else(|| RecoveryError::NotFound(format!("no primary in {}", cluster)))
    }

    async fn begin_downtime(
        &self,
        key: &InstanceKey,
        _owner: &str,
        _reason: &str,
        _duration: Duration,
    ) -> Result<()> {
        self.log(format!("begin_downtime:{}", key));
        Ok(())
    }

    async fn end_downtime(&self, key: &InstanceKey) -> Result<()> {
        self.log(format!("end_downtime:{}", key));
        Ok(())
    }

    async fn record_stale_binlog_coordinates(
        &self,
        key: &InstanceKey,
        _coordinates: &BinlogCoordinates,
    ) -> Result<()> {
        self.log(format!("record_stale_binlog_coordinates:{}", key));
        Ok(())
    }

    async fn set_cluster_alias(&self, cluster_code: &str, alias: &str) -> Result<()> {
        self.log(format!("set_cluster_alias:{}:{}", cluster_code, alias));
        Ok(())
    }

    async fn replace_alias_cluster_name(&self, before: &str, after: &str) -> Result<()> {
        self.log(format!("replace_alias_cluster_name:{}:{}", before, after));
        Ok(())
    }
}

struct MockShardLock {
    key: InstanceKey,
    events: EventLog,
}

#[async_trait]
impl ShardLock for MockShardLock {
    async fn unlock(self: Box<Self>, _outcome: Option<&RecoveryError>) {
        self.events.lock().push(format!("unlock:{}", self.key));
    }
}

struct MockLocker {
    events: EventLog,
}

#[async_trait]
impl ShardLocker for MockLocker {
    async fn lock_shard(&self, key: &InstanceKey) -> Result<Box<dyn ShardLock>> {
        self.events.lock().push(format!("lock:{}", key));
        Ok(Box::new(MockShardLock {
            key: key.clone(),
            events: Arc::clone(&self.events),
        }))
    }
}

#[derive(Default)]
struct MockJournal {
    recoveries: Mutex<Vec<RecoverySnapshot>>,
    resolved: Mutex<Vec<RecoverySnapshot>>,
    steps: Mutex<Vec<RecoveryStep>>,
    blocked: Mutex<Vec<BlockedRecovery>>,
    detections: Mutex<Vec<u64>>,
}

#[async_trait]
impl Journal for MockJournal {
    async fn write_recovery(&self, recovery: &RecoverySnapshot) -> Result<()> {
        self.recoveries.lock().push(recovery.clone());
        Ok(())
    }

    async fn write_recovery_step(&self, step: &RecoveryStep) -> Result<()> {
        self.steps.lock().push(step.clone());
        Ok(())
    }

    async fn write_resolve_recovery(&self, recovery: &RecoverySnapshot) -> Result<()> {
        self.resolved.lock().push(recovery.clone());
        Ok(())
    }

    async fn write_blocked_recovery(&self, blocked: &BlockedRecovery) -> Result<()> {
        self.blocked.lock().push(blocked.clone());
        Ok(())
    }

    async fn write_failure_detection(
        &self,
        _analysis: &AnalysisEntry,
        detection_id: u64,
    ) -> Result<()> {
        self.detections.lock().push(detection_id);
        Ok(())
    }
}

#[derive(Default)]
struct MockKv {
    pairs: Mutex<Vec<KvPair>>,
    distributed: Mutex<Vec<Vec<KvPair>>>,
    attributes: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl KvStore for MockKv {
    async fn put_kv_pair(&self, pair: &KvPair) -> Result<()> {
        self.pairs.lock().push(pair.clone());
        Ok(())
    }

    async fn distribute_pairs(&self, pairs: &[KvPair]) -> Result<()> {
        self.distributed.lock().push(pairs.to_vec());
        Ok(())
    }

    async fn set_general_attribute(&self, domain: &str, value: &str) -> Result<()> {
        self.attributes
            .lock()
            .push((domain.to_string(), value.to_string()));
        Ok(())
    }
}

struct MockHookExecutor {
    events: EventLog,
}

#[async_trait]
impl HookExecutor for MockHookExecutor {
    async fn command_run(&self, command: &str, _env: &[String]) -> Result<()> {
        self.events.lock().push(format!("hook:{}", command));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct RecoveryTestHarness {
    engine: Arc<RecoveryEngine>,
    topology: Arc<MockTopology>,
    journal: Arc<MockJournal>,
    kv: Arc<MockKv>,
    events: EventLog,
}

impl RecoveryTestHarness {
    fn new(config: RecoveryConfig) -> Self {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let topology = Arc::new(MockTopology::new(Arc::clone(&events)));
        let journal = Arc::new(MockJournal::default());
        let kv = Arc::new(MockKv::default());
        let engine = RecoveryEngine::builder()
            .with_topology(Arc::clone(&topology) as Arc<dyn Topology>)
            .with_locker(Arc::new(MockLocker {
                events: Arc::clone(&events),
            }))
            .with_journal(Arc::clone(&journal) as Arc<dyn Journal>)
            .with_kv_store(Arc::clone(&kv) as Arc<dyn KvStore>)
            .with_hook_executor(Arc::new(MockHookExecutor {
                events: Arc::clone(&events),
            }))
            .with_config(config)
            .build()
            .expect("engine builds");
        Self {
            engine,
            topology,
            journal,
            kv,
            events,
        }
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn event_index(&self, needle: &str) -> Option<usize> {
        self.events().iter().position(|event| event.contains(needle))
    }

    fn event_count(&self, needle: &str) -> usize {
        self.events()
            .iter()
            .filter(|event| event.contains(needle))
            .count()
    }
}

fn primary(host: &str, cluster: &str, data_center: &str) -> Instance {
    let mut instance = Instance::new(InstanceKey::new(host, 3306));
    instance.cluster_name = cluster.to_string();
    instance.data_center = data_center.to_string();
    instance.physical_environment = "prod".to_string();
    instance.region = "eu".to_string();
    instance.log_bin_enabled = true;
    instance.log_replication_updates_enabled = true;
    instance.self_binlog_coordinates = BinlogCoordinates::new("bin.000010", 100);
    instance
}

fn replica(host: &str, source: &str, cluster: &str, data_center: &str) -> Instance {
    let mut instance = primary(host, cluster, data_center);
    instance.source_key = InstanceKey::new(source, 3306);
    instance.replica_running = true;
    instance.sql_thread_up_to_date = true;
    instance.replication_lag_seconds = Some(1);
    instance.read_only = true;
    instance.exec_binlog_coordinates = BinlogCoordinates::new("bin.000010", 90);
    instance
}

fn dead_primary_analysis(cluster: &str, failed: &str, replicas: &[&str]) -> AnalysisEntry {
    let mut entry =
        AnalysisEntry::new(AnalysisCode::DeadPrimary, InstanceKey::new(failed, 3306));
    entry.is_primary = true;
    entry.oracle_gtid_immediate_topology = true;
    entry.analyzed_instance_data_center = "dc-a".to_string();
    entry.analyzed_instance_physical_environment = "prod".to_string();
    entry.analyzed_instance_region = "eu".to_string();
    entry.cluster_details.cluster_name = cluster.to_string();
    entry.cluster_details.cluster_alias = format!("{}-alias", cluster);
    entry.cluster_details.cluster_domain = format!("{}.example.com", cluster);
    entry.cluster_details.has_automated_primary_recovery = true;
    entry.cluster_details.has_automated_intermediate_primary_recovery = true;
    entry.count_replicas = replicas.len() as u32;
    entry.replicas = replicas
        .iter()
        .map(|host| InstanceKey::new(*host, 3306))
        .collect::<BTreeSet<_>>();
    entry
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Dead primary with an ideal GTID replica in the same DC and environment.
#[tokio::test]
async fn test_dead_primary_promotes_ideal_replica() {
    let harness = RecoveryTestHarness::new(RecoveryConfig::default());

    harness.topology.add(primary("p", "c1", "dc-a"));
    let mut r1 = replica("r1", "p", "c1", "dc-a");
    r1.promotion_rule = PromotionRule::PreferPromote;
    harness.topology.add(r1);
    let mut r2 = replica("r2", "p", "c1", "dc-b");
    r2.promotion_rule = PromotionRule::Neutral;
    harness.topology.add(r2);

    let analysis = dead_primary_analysis("c1", "p", &["r1", "r2"]);
    let attempt = harness.engine.handle_analysis(analysis, None, false, false).await;

    assert!(attempt.attempted);
    let recovery = attempt.recovery.expect("recovery record");
    assert!(recovery.is_successful());
    assert_eq!(recovery.successor_key(), Some(InstanceKey::new("r1", 3306)));
    assert!(recovery.lost_replicas().is_empty());
    let participants = recovery.participating_instance_keys();
    assert!(participants.contains(&InstanceKey::new("r1", 3306)));
    assert!(participants.contains(&InstanceKey::new("r2", 3306)));

    assert_eq!(harness.engine.metrics().dead_primary.start.get(), 1);
    assert_eq!(harness.engine.metrics().dead_primary.success.get(), 1);
    assert_eq!(harness.engine.metrics().dead_primary.fail.get(), 0);

    // the surviving replica now hangs off the promoted one
    let moved = harness.topology.get(&InstanceKey::new("r2", 3306)).unwrap();
    assert_eq!(moved.source_key, InstanceKey::new("r1", 3306));

    // new primary identity was published and distributed
    assert!(harness
        .kv
        .pairs
        .lock()
        .iter()
        .any(|pair| pair.key == "mysql/primary/c1-alias" && pair.value == "r1:3306"));
    assert_eq!(harness.kv.distributed.lock().len(), 1);
    assert!(harness.journal.resolved.lock().len() == 1);
}

/// Dead primary where cross-DC failover is forbidden and the only survivor
/// lives in another data center.
#[tokio::test]
async fn test_dead_primary_cross_dc_promotion_vetoed() {
    let mut config = RecoveryConfig::default();
    config.prevent_cross_data_center_primary_failover = true;
    let harness = RecoveryTestHarness::new(config);

    harness.topology.add(primary("p", "c1", "dc-a"));
    let mut r1 = replica("r1", "p", "c1", "dc-a");
    r1.is_last_check_valid = false;
    harness.topology.add(r1);
    harness.topology.add(replica("r2", "p", "c1", "dc-b"));

    let analysis = dead_primary_analysis("c1", "p", &["r1", "r2"]);
    let attempt = harness.engine.handle_analysis(analysis, None, false, false).await;

    assert!(attempt.attempted);
    let recovery = attempt.recovery.expect("recovery record");
    assert!(!recovery.is_successful());
    assert_eq!(recovery.successor_key(), None);
    assert!(recovery
        .all_errors()
        .iter()
        .any(|error| error.contains("will not promote server in dc-b when failed server in dc-a")));

    assert_eq!(harness.engine.metrics().dead_primary.start.get(), 1);
    assert_eq!(harness.engine.metrics().dead_primary.fail.get(), 1);
    assert_eq!(harness.engine.metrics().dead_primary.success.get(), 0);
}

/// Dead intermediate primary whose same-DC candidate sibling adopts the
/// orphans (plan A).
#[tokio::test]
async fn test_dead_intermediate_primary_plan_a() {
    let harness = RecoveryTestHarness::new(RecoveryConfig::default());

    harness.topology.add(primary("p", "c1", "dc-a"));
    let mut im_a = replica("im-a", "p", "c1", "dc-a");
    im_a.replicas =
        BTreeSet::from([InstanceKey::new("r1", 3306), InstanceKey::new("r2", 3306)]);
    harness.topology.add(im_a);
    let mut im_b = replica("im-b", "p", "c1", "dc-a");
    im_b.is_candidate = true;
    im_b.exec_binlog_coordinates = BinlogCoordinates::new("bin.000010", 95);
    harness.topology.add(im_b);
    harness.topology.add(replica("r1", "im-a", "c1", "dc-a"));
    harness.topology.add(replica("r2", "im-a", "c1", "dc-a"));

    let mut analysis = dead_primary_analysis("c1", "im-a", &["r1", "r2"]);
    analysis.analysis = AnalysisCode::DeadIntermediatePrimary;
    analysis.is_primary = false;
    analysis.analyzed_instance_primary_key = InstanceKey::new("p", 3306);

    let attempt = harness.engine.handle_analysis(analysis, None, false, false).await;

    assert!(attempt.attempted);
    let recovery = attempt.recovery.expect("recovery record");
    assert!(recovery.is_successful());
    assert_eq!(recovery.successor_key(), Some(InstanceKey::new("im-b", 3306)));
    for host in ["r1", "r2"] {
        let moved = harness.topology.get(&InstanceKey::new(host, 3306)).unwrap();
        assert_eq!(moved.source_key, InstanceKey::new("im-b", 3306));
    }
    assert_eq!(
        harness.engine.metrics().dead_intermediate_primary.success.get(),
        1
    );
}

/// A cluster with no primary and two mutually immovable replicas: the
/// election errors out before any tablet-type change.
#[tokio::test]
async fn test_elect_new_primary_incompatible_instances() {
    let harness = RecoveryTestHarness::new(RecoveryConfig::default());

    let r1 = replica("r1", "gone", "c1", "dc-a");
    let r2 = replica("r2", "gone", "c1", "dc-a");
    {
        let mut incompatible = harness.topology.incompatible_pairs.lock();
        incompatible.insert((r1.key.clone(), r2.key.clone()));
        incompatible.insert((r2.key.clone(), r1.key.clone()));
    }
    harness.topology.add(r1);
    harness.topology.add(r2);

    let mut analysis = dead_primary_analysis("c1", "r1", &[]);
    analysis.analysis = AnalysisCode::ClusterHasNoPrimary;
    analysis.is_primary = false;
    analysis.suggested_cluster_alias = "c1".to_string();

    let attempt = harness.engine.handle_analysis(analysis, None, false, false).await;

    let error = attempt.error.expect("incompatibility error");
    assert!(error.to_string().contains("instances are not compatible"));
    assert_eq!(harness.event_count("change_tablet_type"), 0);
}

/// Two dispatcher invocations with the identical analysis at the same
/// instant: exactly one produces a recovery record.
#[tokio::test]
async fn test_concurrent_detection_registers_once() {
    let harness = RecoveryTestHarness::new(RecoveryConfig::default());

    harness.topology.add(primary("p", "c1", "dc-a"));
    harness.topology.add(replica("r1", "p", "c1", "dc-a"));

    let analysis = dead_primary_analysis("c1", "p", &["r1"]);
    let engine_a = Arc::clone(&harness.engine);
    let engine_b = Arc::clone(&harness.engine);
    let analysis_a = analysis.clone();
    let analysis_b = analysis.clone();

    let (first, second) = tokio::join!(
        tokio::spawn(async move { engine_a.handle_analysis(analysis_a, None, false, true).await }),
        tokio::spawn(async move { engine_b.handle_analysis(analysis_b, None, false, true).await }),
    );
    let first = first.unwrap();
    let second = second.unwrap();

    let attempted = [&first, &second]
        .iter()
        .filter(|attempt| attempt.attempted)
        .count();
    assert_eq!(attempted, 1);
    let loser = if first.attempted { &second } else { &first };
    assert!(loser.recovery.is_none());
    assert_eq!(harness.journal.recoveries.lock().len(), 1);
}

/// With DetachLostReplicasAfterPrimaryFailover, the postponed detach of a
/// lost replica runs exactly once, after the PostPrimaryFailover hooks.
#[tokio::test]
async fn test_postponed_detach_runs_once_after_post_failover_hooks() {
    let mut config = RecoveryConfig::default();
    config.detach_lost_replicas_after_primary_failover = true;
    config.post_primary_failover_processes = vec!["notify-promotion {successorHost}".to_string()];
    let harness = RecoveryTestHarness::new(config);

    harness.topology.add(primary("p", "c1", "dc-a"));
    let mut r1 = replica("r1", "p", "c1", "dc-a");
    r1.promotion_rule = PromotionRule::PreferPromote;
    harness.topology.add(r1);
    harness.topology.add(replica("r3", "p", "c1", "dc-a"));
    harness
        .topology
        .lost_during_regroup
        .lock()
        .insert(InstanceKey::new("r3", 3306));

    let analysis = dead_primary_analysis("c1", "p", &["r1", "r3"]);
    let attempt = harness.engine.handle_analysis(analysis, None, false, false).await;

    let recovery = attempt.recovery.expect("recovery record");
    assert_eq!(recovery.successor_key(), Some(InstanceKey::new("r1", 3306)));
    assert!(recovery.lost_replicas().contains(&InstanceKey::new("r3", 3306)));

    let hook_index = harness
        .event_index("hook:notify-promotion r1")
        .expect("post primary failover hook ran");
    let detach_index = harness
        .event_index("detach_replica_primary_host:r3:3306")
        .expect("postponed detach ran");
    assert!(hook_index < detach_index);
    assert_eq!(harness.event_count("detach_replica_primary_host:r3:3306"), 1);
}

/// Fix-replica: the stray replica is set read-only and repointed at the
/// shard's actual primary.
#[tokio::test]
async fn test_fix_replica_repoints_at_shard_primary() {
    let harness = RecoveryTestHarness::new(RecoveryConfig::default());

    harness.topology.add(primary("p", "c1", "dc-a"));
    let mut stray = replica("r1", "wrong", "c1", "dc-a");
    stray.read_only = false;
    harness.topology.add(stray);

    let mut analysis = dead_primary_analysis("c1", "r1", &[]);
    analysis.analysis = AnalysisCode::ReplicaIsWritable;
    analysis.is_primary = false;

    let attempt = harness.engine.handle_analysis(analysis, None, false, false).await;

    assert!(attempt.attempted);
    let fixed = harness.topology.get(&InstanceKey::new("r1", 3306)).unwrap();
    assert!(fixed.read_only);
    assert_eq!(fixed.source_key, InstanceKey::new("p", 3306));
}

/// Graceful takeover: the designated replica catches up, gets promoted via a
/// forced dead-primary recovery, and the old primary is repointed beneath it.
#[tokio::test]
async fn test_graceful_primary_takeover() {
    let harness = RecoveryTestHarness::new(RecoveryConfig::default());

    harness.topology.add(primary("p", "c1", "dc-a"));
    let mut designated = replica("r1", "p", "c1", "dc-a");
    designated.promotion_rule = PromotionRule::PreferPromote;
    harness.topology.add(designated);
    harness.topology.add(replica("r2", "p", "c1", "dc-a"));

    let designated_key = InstanceKey::new("r1", 3306);
    let (recovery, _coordinates) = harness
        .engine
        .graceful_primary_takeover("c1", Some(&designated_key), false)
        .await
        .expect("graceful takeover succeeds");

    assert_eq!(recovery.successor_key(), Some(designated_key.clone()));
    let old_primary = harness.topology.get(&InstanceKey::new("p", 3306)).unwrap();
    assert_eq!(old_primary.source_key, designated_key);
    assert!(harness.event_index("change_primary_to:p:3306:r1:3306").is_some());
}
