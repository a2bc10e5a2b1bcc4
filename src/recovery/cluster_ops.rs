/// Cluster Fix Operations
///
/// Recovery flows that repair a topology without a dead primary: electing a
/// primary where none exists, demoting a primary that replicates from
/// another, restoring a primary to read-write, and repointing a stray
/// replica at the shard's actual primary.

use crate::error::RecoveryError;
use crate::recovery::analysis::{AnalysisCode, AnalysisEntry};
use crate::recovery::candidate::is_banned_from_being_candidate_replica;
use crate::recovery::dispatcher::{RecoveryAttempt, RecoveryEngine};
use crate::recovery::record::TopologyRecovery;
use crate::topology::instance::InstanceKey;
use crate::topology::service::TabletType;
use std::sync::Arc;
use tracing::{info, warn};

impl RecoveryEngine {
    /// A locked semi-sync primary registers the recovery slot but takes no
    /// automatic action; the situation needs an operator.
    pub(crate) async fn check_and_recover_locked_semi_sync_primary(
        self: &Arc<Self>,
        analysis: &AnalysisEntry,
    ) -> RecoveryAttempt {
        let recovery = match self.registry.register(analysis, true, true).await {
            Ok(Some(recovery)) => recovery,
            Ok(None) => {
                self.audit(
                    None,
                    format!(
                        "found an active or recent recovery on {}. Will not issue another RecoverLockedSemiSyncPrimary.",
                        analysis.analyzed_instance_key
                    ),
                )
                .await;
                return RecoveryAttempt::skipped();
            }
            Err(err) => return RecoveryAttempt::failed(err),
        };
        let _ = self.registry.resolve(&recovery, None).await;
        RecoveryAttempt::aborted_ok(recovery)
    }

    /// General-purpose non-recovery: the analysis is noted, nothing is done.
    pub(crate) async fn check_and_recover_generic_problem(&self) -> RecoveryAttempt {
        RecoveryAttempt::skipped()
    }

    /// Elects a new primary for a cluster that has none.
    pub(crate) async fn elect_new_primary(
        self: &Arc<Self>,
        analysis: &AnalysisEntry,
    ) -> RecoveryAttempt {
        let recovery = match self.registry.register(analysis, false, true).await {
            Ok(Some(recovery)) => recovery,
            Ok(None) => {
                self.audit(
                    None,
                    format!(
                        "found an active or recent recovery on {}. Will not issue another electNewPrimary.",
                        analysis.analyzed_instance_key
                    ),
                )
                .await;
                return RecoveryAttempt::skipped();
            }
            Err(err) => return RecoveryAttempt::failed(err),
        };
        info!(
            "Analysis: {}, will elect a new primary: {}",
            analysis.analysis, analysis.suggested_cluster_alias
        );

        let lock = match self.locker.lock_shard(&analysis.analyzed_instance_key).await {
            Ok(lock) => lock,
            Err(err) => {
                warn!(
                    "NOT electing new primary for {}: could not obtain shard lock ({})",
                    analysis.analyzed_instance_key, err
                );
                recovery.add_error(&err);
                let _ = self.registry.resolve(&recovery, None).await;
                return RecoveryAttempt::aborted(recovery, err);
            }
        };
        let attempt = self.elect_new_primary_locked(&recovery).await;
        lock.unlock(attempt.error.as_ref()).await;
        attempt
    }

    async fn elect_new_primary_locked(self: &Arc<Self>, recovery: &Arc<TopologyRecovery>) -> RecoveryAttempt {
        let analysis = recovery.analysis_entry.clone();

        let replicas = match self
            .topology
            .read_cluster_alias_instances(&analysis.suggested_cluster_alias)
            .await
        {
            Ok(replicas) => replicas,
            Err(err) => return self.abort_election(recovery, false, err).await,
        };
        let replicas = match self
            .topology
            .stop_replicas_nicely(&replicas, self.config.instance_bulk_operations_wait_timeout)
            .await
        {
            Ok(replicas) => replicas,
            Err(err) => return self.abort_election(recovery, false, err).await,
        };
        if replicas.is_empty() {
            let err = RecoveryError::PreconditionFailed(format!(
                "no instances in cluster {}",
                analysis.suggested_cluster_alias
            ));
            return self.abort_election(recovery, false, err).await;
        }

        // Initial candidate: first instance not banned from promotion.
        let Some(mut candidate) = replicas
            .iter()
            .find(|replica| !is_banned_from_being_candidate_replica(&self.config, replica))
        else {
            let err = RecoveryError::PreconditionFailed(
                "no candidate qualifies to be a primary".to_string(),
            );
            self.audit(Some(recovery), err.to_string()).await;
            recovery.add_error(&err);
            let _ = self.registry.resolve(recovery, None).await;
            return RecoveryAttempt {
                attempted: true,
                recovery: Some(Arc::clone(recovery)),
                error: Some(err),
            };
        };

        // Every other replica must be movable under the candidate; when it is
        // not, the candidacy may swap sides. Two mutually immovable replicas
        // end the election.
        for replica in &replicas {
            if replica.key == candidate.key {
                continue;
            }
            if self.topology.check_move_via_gtid(replica, candidate).await.is_err() {
                if let Err(err) = self.topology.check_move_via_gtid(candidate, replica).await {
                    let err = RecoveryError::PreconditionFailed(format!(
                        "instances are not compatible: {} {}: {}",
                        candidate.key, replica.key, err
                    ));
                    return self.abort_election(recovery, false, err).await;
                }
                if !is_banned_from_being_candidate_replica(&self.config, replica) {
                    candidate = replica;
                }
            }
        }

        if let Err(err) = self
            .topology
            .change_tablet_type(&candidate.key, TabletType::Primary)
            .await
        {
            return self.abort_election(recovery, true, err).await;
        }
        recovery.add_participant(&candidate.key);
        for replica in &replicas {
            if replica.key == candidate.key {
                continue;
            }
            if let Err(err) = self.topology.move_below_gtid(&replica.key, &candidate.key).await {
                return self.abort_election(recovery, false, err).await;
            }
            recovery.add_participant(&replica.key);
        }

        let semi_sync_replicas = self.topology.primary_semi_sync(&candidate.key).await;
        let result = self
            .topology
            .set_semi_sync_primary(&candidate.key, semi_sync_replicas > 0)
            .await;
        self.audit(
            Some(recovery),
            format!(
                "- electNewPrimary: applying semi-sync {}: success={}",
                semi_sync_replicas > 0,
                result.is_ok()
            ),
        )
        .await;
        if let Err(err) = result {
            return self.abort_election(recovery, false, err).await;
        }
        let result = self.topology.set_read_only(&candidate.key, false).await;
        self.audit(
            Some(recovery),
            format!("- electNewPrimary: set read-only false: success={}", result.is_ok()),
        )
        .await;
        if let Err(err) = result {
            return self.abort_election(recovery, false, err).await;
        }

        let _ = self.registry.resolve(recovery, Some(candidate)).await;
        RecoveryAttempt {
            attempted: true,
            recovery: Some(Arc::clone(recovery)),
            error: None,
        }
    }

    async fn abort_election(
        &self,
        recovery: &Arc<TopologyRecovery>,
        attempted: bool,
        err: RecoveryError,
    ) -> RecoveryAttempt {
        warn!("electNewPrimary aborted: {}", err);
        recovery.add_error(&err);
        let _ = self.registry.resolve(recovery, None).await;
        RecoveryAttempt {
            attempted,
            recovery: Some(Arc::clone(recovery)),
            error: Some(err),
        }
    }

    /// A primary that replicates from another primary: reset its replication
    /// and run a forced dead-primary recovery on its pretend source, with
    /// this instance as the candidate.
    pub(crate) async fn fix_cluster_and_primary(
        self: &Arc<Self>,
        analysis: &AnalysisEntry,
        skip_hooks: bool,
    ) -> RecoveryAttempt {
        let recovery = match self.registry.register(analysis, false, true).await {
            Ok(Some(recovery)) => recovery,
            Ok(None) => {
                self.audit(
                    None,
                    format!(
                        "found an active or recent recovery on {}. Will not issue another fixClusterAndPrimary.",
                        analysis.analyzed_instance_key
                    ),
                )
                .await;
                return RecoveryAttempt::skipped();
            }
            Err(err) => return RecoveryAttempt::failed(err),
        };
        info!(
            "Analysis: {}, will fix incorrect primaryship {}",
            analysis.analysis, analysis.analyzed_instance_key
        );

        // Reset replication on the current primary, closing the co-primary
        // code path before the forced recovery runs.
        if let Err(err) = self.topology.reset_replication(&analysis.analyzed_instance_key).await {
            recovery.add_error(&err);
            let _ = self.registry.resolve(&recovery, None).await;
            return RecoveryAttempt::aborted(recovery, err);
        }

        let alt_analysis = match self
            .forced_analysis_entry(
                analysis,
                AnalysisCode::DeadPrimary,
                "",
                &analysis.analyzed_instance_primary_key,
            )
            .await
        {
            Ok(entry) => entry,
            Err(err) => {
                recovery.add_error(&err);
                let _ = self.registry.resolve(&recovery, None).await;
                return RecoveryAttempt::aborted(recovery, err);
            }
        };
        self.audit(
            Some(&recovery),
            format!("fixClusterAndPrimary: delegating to forced DeadPrimary recovery on {}", alt_analysis.analyzed_instance_key),
        )
        .await;
        let _ = self.registry.resolve(&recovery, None).await;

        let attempt = Box::pin(self.force_execute_recovery(
            alt_analysis,
            Some(&analysis.analyzed_instance_key),
            skip_hooks,
        ))
        .await;
        if let Err(err) = self.topology.tablet_refresh(&analysis.analyzed_instance_key).await {
            warn!("tablet refresh of {} failed: {}", analysis.analyzed_instance_key, err);
        }
        attempt
    }

    /// Sets the primary back to read-write.
    pub(crate) async fn fix_primary(
        self: &Arc<Self>,
        analysis: &AnalysisEntry,
    ) -> RecoveryAttempt {
        let recovery = match self.registry.register(analysis, false, true).await {
            Ok(Some(recovery)) => recovery,
            Ok(None) => {
                self.audit(
                    None,
                    format!(
                        "found an active or recent recovery on {}. Will not issue another fixPrimary.",
                        analysis.analyzed_instance_key
                    ),
                )
                .await;
                return RecoveryAttempt::skipped();
            }
            Err(err) => return RecoveryAttempt::failed(err),
        };
        info!(
            "Analysis: {}, will fix primary to read-write {}",
            analysis.analysis, analysis.analyzed_instance_key
        );

        let key = analysis.analyzed_instance_key.clone();
        let lock = match self.locker.lock_shard(&key).await {
            Ok(lock) => lock,
            Err(err) => {
                warn!("NOT fixing primary {}: could not obtain shard lock ({})", key, err);
                recovery.add_error(&err);
                let _ = self.registry.resolve(&recovery, None).await;
                return RecoveryAttempt::aborted(recovery, err);
            }
        };
        let attempt = self.fix_primary_locked(&recovery, &key).await;
        lock.unlock(attempt.error.as_ref()).await;
        attempt
    }

    async fn fix_primary_locked(
        &self,
        recovery: &Arc<TopologyRecovery>,
        key: &InstanceKey,
    ) -> RecoveryAttempt {
        let semi_sync_replicas = self.topology.primary_semi_sync(key).await;
        if let Err(err) = self
            .topology
            .set_semi_sync_primary(key, semi_sync_replicas > 0)
            .await
        {
            recovery.add_error(&err);
            let _ = self.registry.resolve(recovery, None).await;
            return RecoveryAttempt::aborted(Arc::clone(recovery), err);
        }
        if let Err(err) = self.topology.tablet_undo_demote_primary(key).await {
            recovery.add_error(&err);
            let _ = self.registry.resolve(recovery, None).await;
            return RecoveryAttempt::aborted(Arc::clone(recovery), err);
        }
        recovery.add_participant(key);
        let _ = self.registry.resolve(recovery, None).await;
        RecoveryAttempt {
            attempted: true,
            recovery: Some(Arc::clone(recovery)),
            error: None,
        }
    }

    /// Sets the replica read-only and points it at the shard's primary.
    pub(crate) async fn fix_replica(
        self: &Arc<Self>,
        analysis: &AnalysisEntry,
    ) -> RecoveryAttempt {
        let recovery = match self.registry.register(analysis, false, true).await {
            Ok(Some(recovery)) => recovery,
            Ok(None) => {
                self.audit(
                    None,
                    format!(
                        "found an active or recent recovery on {}. Will not issue another fixReplica.",
                        analysis.analyzed_instance_key
                    ),
                )
                .await;
                return RecoveryAttempt::skipped();
            }
            Err(err) => return RecoveryAttempt::failed(err),
        };
        info!(
            "Analysis: {}, will fix replica {}",
            analysis.analysis, analysis.analyzed_instance_key
        );

        let key = analysis.analyzed_instance_key.clone();
        let lock = match self.locker.lock_shard(&key).await {
            Ok(lock) => lock,
            Err(err) => {
                warn!("NOT fixing replica {}: could not obtain shard lock ({})", key, err);
                recovery.add_error(&err);
                let _ = self.registry.resolve(&recovery, None).await;
                return RecoveryAttempt::aborted(recovery, err);
            }
        };
        let attempt = self.fix_replica_locked(&recovery, &key).await;
        lock.unlock(attempt.error.as_ref()).await;
        attempt
    }

    async fn fix_replica_locked(
        &self,
        recovery: &Arc<TopologyRecovery>,
        key: &InstanceKey,
    ) -> RecoveryAttempt {
        if let Err(err) = self.topology.set_read_only(key, true).await {
            recovery.add_error(&err);
            let _ = self.registry.resolve(recovery, None).await;
            return RecoveryAttempt::aborted(Arc::clone(recovery), err);
        }

        let primary_key = match self.topology.shard_primary(key).await {
            Ok(primary_key) => primary_key,
            Err(err) => {
                info!("Could not compute primary for {}", key);
                recovery.add_error(&err);
                let _ = self.registry.resolve(recovery, None).await;
                return RecoveryAttempt::aborted(Arc::clone(recovery), err);
            }
        };
        if let Err(err) = self.topology.move_below_gtid(key, &primary_key).await {
            recovery.add_error(&err);
            let _ = self.registry.resolve(recovery, None).await;
            return RecoveryAttempt::aborted(Arc::clone(recovery), err);
        }
        recovery.add_participant(key);
        let _ = self.registry.resolve(recovery, None).await;
        RecoveryAttempt {
            attempted: true,
            recovery: Some(Arc::clone(recovery)),
            error: None,
        }
    }
}
