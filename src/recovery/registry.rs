/// Recovery Registry
///
/// De-duplicates recovery attempts across concurrent detectors. One
/// non-acknowledged recovery may exist per analyzed instance at any instant;
/// registration is linearizable per key through the registry's single lock.
/// Denied attempts are persisted as blocked rows pointing at the recovery
/// that holds the slot. The journal is the persistence sink for every row
/// the registry produces.

use crate::config::RecoveryConfig;
use crate::error::{RecoveryError, Result};
use crate::recovery::analysis::AnalysisEntry;
use crate::recovery::record::{
    BlockedRecovery, RecoveryAcknowledgement, RecoveryStep, TopologyRecovery,
};
use crate::topology::instance::{Instance, InstanceKey};
use crate::topology::service::Journal;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

struct DetectionRecord {
    id: u64,
    registered_at: DateTime<Utc>,
    acknowledged: bool,
}

#[derive(Default)]
struct RegistryState {
    next_recovery_id: u64,
    next_detection_id: u64,
    active: HashMap<InstanceKey, Arc<TopologyRecovery>>,
    recently_ended_by_key: HashMap<InstanceKey, (u64, DateTime<Utc>)>,
    recently_ended_by_cluster: HashMap<String, DateTime<Utc>>,
    blocked: Vec<BlockedRecovery>,
    detections: HashMap<InstanceKey, DetectionRecord>,
}

pub struct RecoveryRegistry {
    journal: Arc<dyn Journal>,
    config: Arc<RecoveryConfig>,
    state: Mutex<RegistryState>,
}

impl RecoveryRegistry {
    pub fn new(journal: Arc<dyn Journal>, config: Arc<RecoveryConfig>) -> Self {
        Self {
            journal,
            config,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Registers a new recovery for the analyzed instance, unless a
    /// conflicting recovery exists. A recovery on the same key always
    /// conflicts while active; `block_on_blocked` extends the conflict to the
    /// key's recovery cooldown, `block_on_concurrent` to any active or
    /// recently ended recovery in the same cluster.
    pub async fn register(
        &self,
        analysis: &AnalysisEntry,
        block_on_blocked: bool,
        block_on_concurrent: bool,
    ) -> Result<Option<Arc<TopologyRecovery>>> {
        let key = &analysis.analyzed_instance_key;
        let cluster = &analysis.cluster_details.cluster_name;
        let cooldown = ChronoDuration::from_std(self.config.recovery_period_block)
            .unwrap_or_else(|_| ChronoDuration::seconds(3600));
        let now = Utc::now();

        enum Registration {
            Granted(Arc<TopologyRecovery>),
            Blocked(BlockedRecovery),
        }

        let registration = {
            let mut state = self.state.lock();

            let blocking_id = if let Some(active) = state.active.get(key) {
                Some(active.id)
            } else if block_on_blocked {
                state.recently_ended_by_key.get(key).and_then(|(id, ended)| {
                    if now - *ended < cooldown {
                        Some(*id)
                    } else {
                        None
                    }
                })
            } else {
                None
            };
            let blocking_id = blocking_id.or_else(|| {
                if !block_on_concurrent {
                    return None;
                }
                if let Some(active) = state
                    .active
                    .values()
                    .find(|recovery| &recovery.analysis_entry.cluster_details.cluster_name == cluster)
                {
                    return Some(active.id);
                }
                state
                    .recently_ended_by_cluster
                    .get(cluster)
                    .filter(|ended| now - **ended < cooldown)
                    .map(|_| 0)
            });

            match blocking_id {
                Some(blocking_recovery_id) => {
                    let blocked = BlockedRecovery {
                        failed_instance_key: key.clone(),
                        cluster_name: cluster.clone(),
                        analysis: analysis.analysis,
                        last_blocked_at: now,
                        blocking_recovery_id,
                    };
                    state.blocked.push(blocked.clone());
                    Registration::Blocked(blocked)
                }
                None => {
                    state.next_recovery_id += 1;
                    let recovery =
                        Arc::new(TopologyRecovery::new(state.next_recovery_id, analysis.clone()));
                    state.active.insert(key.clone(), Arc::clone(&recovery));
                    Registration::Granted(recovery)
                }
            }
        };

        match registration {
            Registration::Blocked(blocked) => {
                self.journal.write_blocked_recovery(&blocked).await?;
                Ok(None)
            }
            Registration::Granted(recovery) => {
                if let Err(err) = self.journal.write_recovery(&recovery.snapshot()).await {
                    self.state.lock().active.remove(key);
                    return Err(err);
                }
                info!(
                    "registered recovery {} for {} on {}",
                    recovery.id, analysis.analysis, key
                );
                Ok(Some(recovery))
            }
        }
    }

    /// Closes a recovery, stamping the end timestamp and successor, and
    /// persists the resolved record.
    pub async fn resolve(
        &self,
        recovery: &TopologyRecovery,
        successor: Option<&Instance>,
    ) -> Result<()> {
        recovery.close(successor);
        {
            let mut state = self.state.lock();
            let key = recovery.analysis_entry.analyzed_instance_key.clone();
            state.active.remove(&key);
            let now = Utc::now();
            state
                .recently_ended_by_key
                .insert(key, (recovery.id, now));
            state.recently_ended_by_cluster.insert(
                recovery.analysis_entry.cluster_details.cluster_name.clone(),
                now,
            );
        }
        self.journal
            .write_resolve_recovery(&recovery.snapshot())
            .await
    }

    /// Appends an audited step to the recovery (and to the process log).
    pub async fn audit_step(
        &self,
        recovery: Option<&TopologyRecovery>,
        message: impl AsRef<str>,
    ) -> Result<()> {
        let message = message.as_ref();
        info!("topology_recovery: {}", message);
        let Some(recovery) = recovery else {
            return Ok(());
        };
        self.journal
            .write_recovery_step(&RecoveryStep::new(recovery.uid.clone(), message))
            .await
    }

    /// Registers a failure detection, throttled per instance within the
    /// detection cooldown. Returns whether this call registered it.
    pub async fn register_detection(&self, analysis: &AnalysisEntry) -> Result<bool> {
        let key = &analysis.analyzed_instance_key;
        let cooldown = ChronoDuration::from_std(self.config.failure_detection_period_block)
            .unwrap_or_else(|_| ChronoDuration::seconds(3600));
        let now = Utc::now();

        let detection_id = {
            let mut state = self.state.lock();
            if let Some(existing) = state.detections.get(key) {
                if now - existing.registered_at < cooldown {
                    return Ok(false);
                }
            }
            state.next_detection_id += 1;
            let id = state.next_detection_id;
            state.detections.insert(
                key.clone(),
                DetectionRecord {
                    id,
                    registered_at: now,
                    acknowledged: false,
                },
            );
            id
        };

        self.journal
            .write_failure_detection(analysis, detection_id)
            .await?;
        Ok(true)
    }

    /// Marks the instance's pending detection as internally acknowledged so
    /// that later notifications deduplicate against it.
    pub fn acknowledge_instance_failure_detection(&self, key: &InstanceKey) {
        let mut state = self.state.lock();
        if let Some(detection) = state.detections.get_mut(key) {
            detection.acknowledged = true;
        } else {
            warn!("no failure detection to acknowledge for {}", key);
        }
    }

    /// Acknowledges an active recovery on behalf of an operator.
    pub fn acknowledge_recovery(&self, key: &InstanceKey, ack: RecoveryAcknowledgement) -> bool {
        let state = self.state.lock();
        match state.active.get(key) {
            Some(recovery) => {
                recovery.acknowledge(ack);
                true
            }
            None => false,
        }
    }

    pub fn active_recovery_for(&self, key: &InstanceKey) -> Option<Arc<TopologyRecovery>> {
        self.state.lock().active.get(key).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn blocked_recoveries(&self) -> Vec<BlockedRecovery> {
        self.state.lock().blocked.clone()
    }
}

impl std::fmt::Debug for RecoveryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryRegistry")
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::analysis::AnalysisCode;
    use crate::recovery::record::RecoverySnapshot;
    use async_trait::async_trait;

    struct NullJournal;

    #[async_trait]
    impl Journal for NullJournal {
        async fn write_recovery(&self, _recovery: &RecoverySnapshot) -> Result<()> {
            Ok(())
        }
        async fn write_recovery_step(&self, _step: &RecoveryStep) -> Result<()> {
            Ok(())
        }
        async fn write_resolve_recovery(&self, _recovery: &RecoverySnapshot) -> Result<()> {
            Ok(())
        }
        async fn write_blocked_recovery(&self, _blocked: &BlockedRecovery) -> Result<()> {
            Ok(())
        }
        async fn write_failure_detection(
            &self,
            _analysis: &AnalysisEntry,
            _detection_id: u64,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn registry() -> RecoveryRegistry {
        RecoveryRegistry::new(Arc::new(NullJournal), Arc::new(RecoveryConfig::default()))
    }

    fn dead_primary_entry(host: &str) -> AnalysisEntry {
        let mut entry =
            AnalysisEntry::new(AnalysisCode::DeadPrimary, InstanceKey::new(host, 3306));
        entry.cluster_details.cluster_name = format!("{}:3306", host);
        entry
    }

    #[tokio::test]
    async fn test_register_grants_once_per_key() {
        let registry = registry();
        let entry = dead_primary_entry("primary");

        let first = registry.register(&entry, true, true).await.unwrap();
        assert!(first.is_some());

        let second = registry.register(&entry, true, true).await.unwrap();
        assert!(second.is_none());
        assert_eq!(registry.blocked_recoveries().len(), 1);
        assert_eq!(
            registry.blocked_recoveries()[0].blocking_recovery_id,
            first.unwrap().id
        );
    }

    #[tokio::test]
    async fn test_concurrent_register_exactly_one_wins() {
        let registry = Arc::new(registry());
        let entry = dead_primary_entry("primary");

        let a = {
            let registry = Arc::clone(&registry);
            let entry = entry.clone();
            tokio::spawn(async move { registry.register(&entry, true, true).await.unwrap() })
        };
        let b = {
            let registry = Arc::clone(&registry);
            let entry = entry.clone();
            tokio::spawn(async move { registry.register(&entry, true, true).await.unwrap() })
        };

        let granted = [a.await.unwrap(), b.await.unwrap()]
            .into_iter()
            .flatten()
            .count();
        assert_eq!(granted, 1);
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn test_cooldown_blocks_cluster_after_resolve() {
        let registry = registry();
        let entry = dead_primary_entry("primary");

        let recovery = registry.register(&entry, true, true).await.unwrap().unwrap();
        registry.resolve(&recovery, None).await.unwrap();

        // within cooldown: concurrent registrations on the cluster are denied
        assert!(registry.register(&entry, false, true).await.unwrap().is_none());
        // without the concurrency gate the key's own cooldown still applies
        assert!(registry.register(&entry, true, false).await.unwrap().is_none());
        // with both gates off a fresh registration is allowed
        assert!(registry.register(&entry, false, false).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_detection_throttling() {
        let registry = registry();
        let entry = dead_primary_entry("primary");

        assert!(registry.register_detection(&entry).await.unwrap());
        assert!(!registry.register_detection(&entry).await.unwrap());

        registry.acknowledge_instance_failure_detection(&entry.analyzed_instance_key);
        assert!(!registry.register_detection(&entry).await.unwrap());
    }
}
