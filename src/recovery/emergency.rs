/// Emergency Operation Coalescing
///
/// Suspected-failure analyses trigger diagnostic re-reads and replication
/// restarts. Left unthrottled, a burst of identical detections would hammer
/// the topology with redundant probes. Three time-keyed caches convert that
/// herd into at most one side effect per TTL window per instance.

use crate::recovery::analysis::AnalysisCode;
use crate::recovery::dispatcher::RecoveryEngine;
use crate::topology::instance::{BinlogCoordinates, InstanceKey};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Concurrent set whose members expire after a fixed TTL. Insertion doubles
/// as a compare-and-set: `add_if_absent` succeeds for at most one caller per
/// TTL window. Expired members are treated as absent immediately; the sweeper
/// only reclaims memory.
pub struct ExpiringSet {
    entries: DashMap<InstanceKey, Instant>,
    ttl: Duration,
    sweep_interval: Duration,
}

impl ExpiringSet {
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            sweep_interval,
        }
    }

    /// Atomically inserts the key unless a live entry exists. Returns whether
    /// this caller inserted it.
    pub fn add_if_absent(&self, key: &InstanceKey) -> bool {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().elapsed() < self.ttl {
                    false
                } else {
                    occupied.insert(Instant::now());
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Instant::now());
                true
            }
        }
    }

    /// Unconditionally (re)arms the key's TTL window.
    pub fn set(&self, key: &InstanceKey) {
        self.entries.insert(key.clone(), Instant::now());
    }

    pub fn contains(&self, key: &InstanceKey) -> bool {
        self.entries
            .get(key)
            .map(|entry| entry.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    pub fn sweep(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, inserted| inserted.elapsed() < ttl);
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let set = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(set.sweep_interval);
            loop {
                ticker.tick().await;
                set.sweep();
            }
        })
    }
}

impl std::fmt::Debug for ExpiringSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiringSet")
            .field("len", &self.entries.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// The three emergency caches and their fixed windows.
#[derive(Debug)]
pub struct EmergencyCoalescer {
    pub read_topology: Arc<ExpiringSet>,
    pub restart_replica: Arc<ExpiringSet>,
    pub graceful_period: Arc<ExpiringSet>,
}

impl EmergencyCoalescer {
    pub fn new() -> Self {
        Self {
            read_topology: Arc::new(ExpiringSet::new(
                Duration::from_secs(1),
                Duration::from_millis(250),
            )),
            restart_replica: Arc::new(ExpiringSet::new(
                Duration::from_secs(30),
                Duration::from_secs(1),
            )),
            graceful_period: Arc::new(ExpiringSet::new(
                Duration::from_secs(5),
                Duration::from_millis(500),
            )),
        }
    }

    pub fn start_sweepers(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.read_topology.spawn_sweeper(),
            self.restart_replica.spawn_sweeper(),
            self.graceful_period.spawn_sweeper(),
        ]
    }
}

impl Default for EmergencyCoalescer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryEngine {
    /// Forces a re-read of a topology instance to substantiate a failover
    /// suspicion. At most one read per instance per TTL window.
    pub async fn emergently_read_topology_instance(
        &self,
        key: &InstanceKey,
        analysis_code: AnalysisCode,
    ) {
        if !self.emergency.read_topology.add_if_absent(key) {
            // just recently attempted
            return;
        }
        debug!("emergently reading topology instance {} ({})", key, analysis_code);
        match self.topology.read_instance(key).await {
            Ok(_) => info!("emergently read topology instance {}", key),
            Err(err) => warn!("emergent read of {} failed: {}", key, err),
        }
    }

    /// Forces reading of the replicas of a suspected-dead instance to speed
    /// up detection of replication failure from their side.
    pub async fn emergently_read_topology_instance_replicas(
        self: &Arc<Self>,
        key: &InstanceKey,
        analysis_code: AnalysisCode,
    ) {
        let replicas = match self
            .topology
            .read_replica_instances_including_relays(key)
            .await
        {
            Ok(replicas) => replicas,
            Err(_) => return,
        };
        for replica in replicas {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine
                    .emergently_read_topology_instance(&replica.key, analysis_code)
                    .await;
            });
        }
    }

    /// Stop+start replication on one instance, throttled per instance.
    pub async fn emergently_restart_replication_on_instance(
        &self,
        key: &InstanceKey,
        analysis_code: AnalysisCode,
    ) {
        if !self.emergency.restart_replica.add_if_absent(key) {
            return;
        }
        debug!("emergently restarting replication on {} ({})", key, analysis_code);
        if let Err(err) = self.topology.restart_replication(key).await {
            warn!("emergent replication restart on {} failed: {}", key, err);
        }
    }

    /// Stop+start replication on all replicas of the given instance, hoping a
    /// re-authentication makes them notice their primary is bad. The instance
    /// itself is throttled as a grand gate before iterating replicas.
    pub async fn emergently_restart_replication_on_replicas(
        self: &Arc<Self>,
        key: &InstanceKey,
        analysis_code: AnalysisCode,
    ) {
        if !self.emergency.restart_replica.add_if_absent(key) {
            return;
        }
        self.begin_emergency_operation_graceful_period(key);

        let replicas = match self
            .topology
            .read_replica_instances_including_relays(key)
            .await
        {
            Ok(replicas) => replicas,
            Err(_) => return,
        };
        for replica in replicas {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine
                    .emergently_restart_replication_on_instance(&replica.key, analysis_code)
                    .await;
            });
        }
    }

    pub async fn emergently_record_stale_binlog_coordinates(
        &self,
        key: &InstanceKey,
        coordinates: &BinlogCoordinates,
    ) {
        if let Err(err) = self
            .topology
            .record_stale_binlog_coordinates(key, coordinates)
            .await
        {
            warn!("recording stale binlog coordinates for {} failed: {}", key, err);
        }
    }

    pub fn begin_emergency_operation_graceful_period(&self, key: &InstanceKey) {
        self.emergency.graceful_period.set(key);
    }

    pub fn is_in_emergency_operation_graceful_period(&self, key: &InstanceKey) -> bool {
        self.emergency.graceful_period.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_if_absent_throttles_within_ttl() {
        let set = ExpiringSet::new(Duration::from_millis(40), Duration::from_millis(10));
        let key = InstanceKey::new("primary", 3306);

        assert!(set.add_if_absent(&key));
        assert!(!set.add_if_absent(&key));
        assert!(set.contains(&key));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!set.contains(&key));
        assert!(set.add_if_absent(&key));
    }

    #[tokio::test]
    async fn test_sweep_reclaims_expired_entries() {
        let set = ExpiringSet::new(Duration::from_millis(10), Duration::from_millis(5));
        set.set(&InstanceKey::new("a", 3306));
        set.set(&InstanceKey::new("b", 3306));

        tokio::time::sleep(Duration::from_millis(20)).await;
        set.sweep();
        assert_eq!(set.entries.len(), 0);
    }

    #[test]
    fn test_distinct_keys_do_not_throttle_each_other() {
        let set = ExpiringSet::new(Duration::from_secs(30), Duration::from_secs(1));
        assert!(set.add_if_absent(&InstanceKey::new("a", 3306)));
        assert!(set.add_if_absent(&InstanceKey::new("b", 3306)));
    }
}
