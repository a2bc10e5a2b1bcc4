/// Dead-Primary Recovery
///
/// The full dead-primary flow: demote the failed primary, regroup its
/// replicas via GTID or through binlog-relay nodes, possibly upgrade the
/// promoted replica to a better candidate, veto the promotion on configured
/// overrides, then apply post-promotion MySQL changes and redistribute the
/// cluster primary identity.

use crate::error::{RecoveryError, Result};
use crate::recovery::analysis::AnalysisEntry;
use crate::recovery::candidate::geographic_constraint_violation;
use crate::recovery::dispatcher::{RecoveryAttempt, RecoveryEngine};
use crate::recovery::record::{PrimaryRecoveryKind, RecoveryKind, TopologyRecovery};
use crate::topology::instance::{Instance, InstanceKey, PromotionRule};
use crate::topology::service::{GtidHint, KvPair, TabletType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

const MAX_BINLOG_SERVER_PROMOTIONS: usize = 3;

/// How the failed primary's immediate topology can be regrouped.
pub fn primary_recovery_kind(analysis: &AnalysisEntry) -> PrimaryRecoveryKind {
    if analysis.oracle_gtid_immediate_topology || analysis.mariadb_gtid_immediate_topology {
        PrimaryRecoveryKind::Gtid
    } else if analysis.binlog_server_immediate_topology {
        PrimaryRecoveryKind::BinlogServer
    } else {
        PrimaryRecoveryKind::Unknown
    }
}

impl RecoveryEngine {
    /// Checks a dead-primary analysis, decides whether to take action, and
    /// possibly takes action.
    pub(crate) async fn check_and_recover_dead_primary(
        self: &Arc<Self>,
        analysis: &AnalysisEntry,
        candidate_hint: Option<&InstanceKey>,
        force: bool,
        skip_hooks: bool,
    ) -> RecoveryAttempt {
        if !(force || analysis.cluster_details.has_automated_primary_recovery) {
            return RecoveryAttempt::skipped();
        }
        let recovery = match self.registry.register(analysis, !force, !force).await {
            Ok(Some(recovery)) => recovery,
            Ok(None) => {
                self.audit(
                    None,
                    format!(
                        "found an active or recent recovery on {}. Will not issue another RecoverDeadPrimary.",
                        analysis.analyzed_instance_key
                    ),
                )
                .await;
                return RecoveryAttempt::skipped();
            }
            Err(err) => return RecoveryAttempt::failed(err),
        };
        info!(
            "Analysis: {}, dead primary {}",
            analysis.analysis, analysis.analyzed_instance_key
        );

        let lock = match self.locker.lock_shard(&analysis.analyzed_instance_key).await {
            Ok(lock) => lock,
            Err(err) => {
                warn!(
                    "NOT recovering {}: could not obtain shard lock ({})",
                    analysis.analyzed_instance_key, err
                );
                recovery.add_error(&err);
                let _ = self.registry.resolve(&recovery, None).await;
                return RecoveryAttempt::aborted(recovery, err);
            }
        };
        let attempt = self
            .recover_dead_primary_locked(&recovery, candidate_hint, skip_hooks)
            .await;
        lock.unlock(attempt.error.as_ref()).await;
        attempt
    }

    async fn recover_dead_primary_locked(
        self: &Arc<Self>,
        recovery: &Arc<TopologyRecovery>,
        candidate_hint: Option<&InstanceKey>,
        skip_hooks: bool,
    ) -> RecoveryAttempt {
        let analysis = recovery.analysis_entry.clone();
        let failed_key = analysis.analyzed_instance_key.clone();

        // Someone else may have fixed the problem already.
        if let Ok(tablet_type) = self.topology.tablet_refresh(&failed_key).await {
            if tablet_type != TabletType::Primary {
                self.audit(Some(recovery), "another agent seems to have fixed the problem")
                    .await;
                let _ = self.registry.resolve(recovery, None).await;
                return RecoveryAttempt::aborted_ok(Arc::clone(recovery));
            }
        }

        self.audit(
            Some(recovery),
            format!(
                "will handle DeadPrimary event on {}",
                analysis.cluster_details.cluster_name
            ),
        )
        .await;
        self.metrics.dead_primary.start.inc();

        let (attempted, promoted, lost_replicas, error) = self
            .recover_dead_primary(recovery, candidate_hint, skip_hooks)
            .await;
        if let Some(err) = &error {
            self.audit(Some(recovery), err.to_string()).await;
        }
        recovery.add_lost_replicas(&lost_replicas);
        if !attempted {
            let _ = self.registry.resolve(recovery, None).await;
            return RecoveryAttempt {
                attempted: false,
                recovery: Some(Arc::clone(recovery)),
                error,
            };
        }

        let promoted = self.override_primary_promotion(recovery, &analysis, promoted).await;
        // This is the end; whether successful or not, we're done.
        let _ = self.registry.resolve(recovery, promoted.as_ref()).await;
        match &promoted {
            Some(promoted) => {
                self.metrics.dead_primary.success.inc();
                self.audit(
                    Some(recovery),
                    format!("RecoverDeadPrimary: successfully promoted {}", promoted.key),
                )
                .await;
                self.audit(
                    Some(recovery),
                    format!(
                        "- RecoverDeadPrimary: promoted server coordinates: {}",
                        promoted.self_binlog_coordinates
                    ),
                )
                .await;
                self.apply_post_promotion(recovery, promoted, skip_hooks).await;
            }
            None => {
                self.metrics.dead_primary.fail.inc();
            }
        }
        RecoveryAttempt {
            attempted: true,
            recovery: Some(Arc::clone(recovery)),
            error,
        }
    }

    /// The reparenting itself. Returns whether recovery was attempted, the
    /// promoted replica, the replicas lost along the way, and the first error.
    async fn recover_dead_primary(
        self: &Arc<Self>,
        recovery: &Arc<TopologyRecovery>,
        candidate_hint: Option<&InstanceKey>,
        skip_hooks: bool,
    ) -> (bool, Option<Instance>, Vec<Instance>, Option<RecoveryError>) {
        recovery.set_kind(RecoveryKind::PrimaryRecovery);
        let analysis = recovery.analysis_entry.clone();
        let failed_key = analysis.analyzed_instance_key.clone();
        let mut lost_replicas: Vec<Instance> = Vec::new();

        info!("recover-dead-primary on {}: problem found; will recover", failed_key);
        if !skip_hooks {
            if let Err(err) = self
                .run_hooks(
                    &self.config.pre_failover_processes,
                    "PreFailoverProcesses",
                    recovery,
                    true,
                )
                .await
            {
                recovery.add_error(&err);
                return (false, None, lost_replicas, Some(err));
            }
        }

        self.audit(
            Some(recovery),
            format!("RecoverDeadPrimary: will recover {}", failed_key),
        )
        .await;

        let demotion = self.topology.tablet_demote_primary(&failed_key).await;
        self.audit(
            Some(recovery),
            format!("RecoverDeadPrimary: TabletDemotePrimary: {:?}", demotion.err()),
        )
        .await;

        recovery.set_primary_recovery_kind(primary_recovery_kind(&analysis));
        self.audit(
            Some(recovery),
            format!(
                "RecoverDeadPrimary: primaryRecoveryType={:?}",
                recovery.primary_recovery_kind()
            ),
        )
        .await;

        let postponed_all = AtomicBool::new(false);
        let mut promoted: Option<Instance> = None;
        let mut error: Option<RecoveryError> = None;
        match recovery.primary_recovery_kind() {
            PrimaryRecoveryKind::Gtid => {
                self.audit(Some(recovery), "RecoverDeadPrimary: regrouping replicas via GTID")
                    .await;
                let promoted_is_ideal = |candidate: &Instance, has_best_rule: bool| -> bool {
                    if let Some(hint) = candidate_hint {
                        // explicit request to promote a specific server
                        return &candidate.key == hint;
                    }
                    if candidate.data_center == analysis.analyzed_instance_data_center
                        && candidate.physical_environment
                            == analysis.analyzed_instance_physical_environment
                    {
                        let rule = candidate.promotion_rule;
                        if matches!(rule, PromotionRule::MustPromote | PromotionRule::PreferPromote)
                            || (has_best_rule && rule != PromotionRule::MustNotPromote)
                        {
                            postponed_all.store(true, Ordering::SeqCst);
                            return true;
                        }
                    }
                    false
                };
                match self
                    .topology
                    .regroup_replicas_gtid(
                        &failed_key,
                        true,
                        &recovery.postponed,
                        Some(&promoted_is_ideal),
                    )
                    .await
                {
                    Ok(outcome) => {
                        lost_replicas = outcome.lost_replicas;
                        lost_replicas.extend(outcome.cannot_replicate_replicas);
                        for moved in &outcome.equal_replicas {
                            recovery.add_participant(&moved.key);
                        }
                        promoted = outcome.promoted;
                    }
                    Err(err) => {
                        recovery.add_error(&err);
                        error = Some(err);
                    }
                }
                if postponed_all.load(Ordering::SeqCst) {
                    if let Some(promoted) = &promoted {
                        self.audit(
                            Some(recovery),
                            format!(
                                "RecoverDeadPrimary: found {} to be ideal candidate; will optimize recovery",
                                promoted.key
                            ),
                        )
                        .await;
                    }
                }
            }
            PrimaryRecoveryKind::BinlogServer => {
                self.audit(Some(recovery), "RecoverDeadPrimary: recovering via binlog servers")
                    .await;
                match self.recover_dead_primary_in_binlog_server_topology(recovery).await {
                    Ok(instance) => promoted = Some(instance),
                    Err(err) => {
                        recovery.add_error(&err);
                        error = Some(err);
                    }
                }
            }
            PrimaryRecoveryKind::Unknown | PrimaryRecoveryKind::NotPrimaryRecovery => {
                let err = RecoveryError::PreconditionFailed(
                    "RecoverDeadPrimary: RecoveryType unknown/unsupported".to_string(),
                );
                recovery.add_error(&err);
                return (false, None, lost_replicas, Some(err));
            }
        }
        for replica in &lost_replicas {
            self.audit(
                Some(recovery),
                format!("RecoverDeadPrimary: - lost replica: {}", replica.key),
            )
            .await;
        }
        if let Some(promoted) = &promoted {
            recovery.add_participant(&promoted.key);
        }

        if promoted.is_some()
            && !lost_replicas.is_empty()
            && self.config.detach_lost_replicas_after_primary_failover
        {
            let engine = Arc::clone(self);
            let postponed_recovery = Arc::clone(recovery);
            let lost_keys: Vec<InstanceKey> =
                lost_replicas.iter().map(|replica| replica.key.clone()).collect();
            recovery.postponed.add(
                format!("dead-primary recovery: detach {} lost replicas", lost_keys.len()),
                Box::pin(async move {
                    engine
                        .audit(
                            Some(&postponed_recovery),
                            format!(
                                "RecoverDeadPrimary: lost {} replicas during recovery process; detaching them",
                                lost_keys.len()
                            ),
                        )
                        .await;
                    for key in &lost_keys {
                        if let Err(err) = engine.topology.detach_replica_primary_host(key).await {
                            warn!("failed detaching lost replica {}: {}", key, err);
                        }
                    }
                    Ok(())
                }),
            );
        }

        self.registry.acknowledge_instance_failure_detection(&failed_key);
        for replica in &lost_replicas {
            let _ = self
                .topology
                .begin_downtime(
                    &replica.key,
                    "rusty-failover",
                    "lost in recovery",
                    self.config.lost_in_recovery_downtime,
                )
                .await;
        }

        self.audit(
            Some(recovery),
            format!("RecoverDeadPrimary: {} postponed functions", recovery.postponed.len()),
        )
        .await;

        if let Some(promoted_instance) = promoted.clone() {
            if !postponed_all.load(Ordering::SeqCst) {
                promoted = Some(
                    self.replace_promoted_replica_with_candidate(
                        recovery,
                        &failed_key,
                        promoted_instance,
                        candidate_hint,
                    )
                    .await,
                );
            }
        }

        match &promoted {
            None => {
                let undo = self.topology.tablet_undo_demote_primary(&failed_key).await;
                self.audit(
                    Some(recovery),
                    format!("RecoverDeadPrimary: TabletUndoDemotePrimary: {:?}", undo.err()),
                )
                .await;
                self.audit(Some(recovery), "Failure: no replica promoted.").await;
            }
            Some(promoted) => {
                self.audit(Some(recovery), format!("promoted replica: {}", promoted.key))
                    .await;
            }
        }
        (true, promoted, lost_replicas, error)
    }

    /// Recovers a dead primary whose immediate topology is binlog-relay
    /// nodes: promote a relay, align a candidate replica with its
    /// coordinates, flush the candidate's binlogs forward, then reconnect the
    /// relays underneath the new primary. Moving the relays' own replicas up
    /// is postponed.
    async fn recover_dead_primary_in_binlog_server_topology(
        self: &Arc<Self>,
        recovery: &Arc<TopologyRecovery>,
    ) -> Result<Instance> {
        let failed_key = recovery.analysis_entry.analyzed_instance_key.clone();

        let promoted_relay = self.topology.regroup_replicas_binlog_servers(&failed_key).await?;
        let promoted_relay = self.topology.stop_replication(&promoted_relay.key).await?;
        let relay_coordinates = promoted_relay.exec_binlog_coordinates.clone();

        let promoted = self
            .topology
            .get_candidate_replica_of_binlog_server_topology(&promoted_relay.key)
            .await?;
        // Align the candidate with the relay's coordinates.
        let promoted = self.topology.stop_replication(&promoted.key).await?;
        let promoted = self
            .topology
            .start_replication_until_primary_coordinates(&promoted.key, &relay_coordinates)
            .await?;
        let promoted = self.topology.stop_replication(&promoted.key).await?;
        // Detach and flush binary logs forward.
        let promoted = self.topology.reset_replication(&promoted.key).await?;
        let promoted = self
            .topology
            .flush_binary_logs_to(&promoted.key, &relay_coordinates.log_file)
            .await?;
        let promoted = self.topology.flush_binary_logs(&promoted.key, 1).await?;
        let promoted = self.topology.purge_binary_logs_to_latest(&promoted.key).await?;
        // Reconnect the relay to the promoted replica, now primary.
        let promoted_relay = self.topology.skip_to_next_binary_log(&promoted_relay.key).await?;
        let promoted_relay = self
            .topology
            .repoint(&promoted_relay.key, &promoted.key, GtidHint::Deny)
            .await?;
        recovery.add_participant(&promoted.key);
        recovery.add_participant(&promoted_relay.key);

        // Relay replicas can only be moved once the relay skipped to the next
        // binlog. The primary is already promoted; postpone the moves.
        if let Ok(relay_replicas) = self
            .topology
            .read_binlog_server_replica_instances(&promoted_relay.key)
            .await
        {
            let relay_coordinates = promoted_relay.exec_binlog_coordinates.clone();
            for relay_replica in relay_replicas.into_iter().take(MAX_BINLOG_SERVER_PROMOTIONS) {
                let engine = Arc::clone(self);
                let promoted_key = promoted.key.clone();
                let coordinates = relay_coordinates.clone();
                let replica_key = relay_replica.key.clone();
                recovery.postponed.add(
                    format!("dead-primary binlog-server recovery: move relay replica {}", replica_key),
                    Box::pin(async move {
                        let stopped = engine.topology.stop_replication(&replica_key).await?;
                        // The relay replica must hold the binlog the primary flushed
                        // and purged to, or it would request one the primary lacks.
                        if stopped.exec_binlog_coordinates.smaller_than(&coordinates) {
                            engine
                                .topology
                                .start_replication_until_primary_coordinates(
                                    &replica_key,
                                    &coordinates,
                                )
                                .await?;
                        }
                        engine
                            .topology
                            .repoint(&replica_key, &promoted_key, GtidHint::Deny)
                            .await?;
                        Ok(())
                    }),
                );
            }
        }

        Ok(promoted)
    }

    /// After a primary (or co-primary) died and some replica was promoted:
    /// is there an even better replica to put on top? A given candidate hint
    /// is forced over the promoted replica.
    pub(crate) async fn replace_promoted_replica_with_candidate(
        self: &Arc<Self>,
        recovery: &Arc<TopologyRecovery>,
        dead_instance_key: &InstanceKey,
        promoted: Instance,
        candidate_hint: Option<&InstanceKey>,
    ) -> Instance {
        let (candidate, action_required) = match self
            .suggest_replacement_for_promoted_replica(
                recovery,
                dead_instance_key,
                &promoted,
                candidate_hint,
            )
            .await
        {
            Ok(suggestion) => suggestion,
            Err(err) => {
                error!("suggesting replacement for {} failed: {}", promoted.key, err);
                recovery.add_error(&err);
                return promoted;
            }
        };
        if !action_required {
            self.audit(
                Some(recovery),
                format!(
                    "replace-promoted-replica-with-candidate: promoted instance {} requires no further action",
                    promoted.key
                ),
            )
            .await;
            return promoted;
        }

        self.audit(
            Some(recovery),
            format!(
                "replace-promoted-replica-with-candidate: promoted instance {} is not the suggested candidate {}. Will see what can be done",
                promoted.key, candidate.key
            ),
        )
        .await;
        if candidate.source_key != promoted.key {
            self.audit(
                Some(recovery),
                format!("could not manage to promote suggested candidate {}", candidate.key),
            )
            .await;
            return promoted;
        }

        self.audit(
            Some(recovery),
            format!(
                "replace-promoted-replica-with-candidate: suggested candidate {} is replica of promoted instance {}. Will try and take its primary",
                candidate.key, promoted.key
            ),
        )
        .await;
        let allow_co_primary = recovery.kind() == RecoveryKind::CoPrimaryRecovery;
        match self.topology.take_primary(&candidate.key, allow_co_primary).await {
            Ok(candidate) => {
                self.audit(
                    Some(recovery),
                    format!("success promoting {} over {}", candidate.key, promoted.key),
                )
                .await;
                recovery.add_participant(&candidate.key);

                // Relocate the remaining replicas of the ex-promoted replica
                // under the new candidate, once the critical path is done.
                let engine = Arc::clone(self);
                let postponed_recovery = Arc::clone(recovery);
                let from = promoted.key.clone();
                let to = candidate.key.clone();
                recovery.postponed.add(
                    format!("replace-promoted-replica-with-candidate: relocate replicas of {}", from),
                    Box::pin(async move {
                        let outcome = engine.topology.relocate_replicas(&from, &to, "").await?;
                        engine
                            .audit(
                                Some(&postponed_recovery),
                                format!(
                                    "relocated {} replicas of {} below {}",
                                    outcome.relocated.len(),
                                    from,
                                    to
                                ),
                            )
                            .await;
                        Ok(())
                    }),
                );
                candidate
            }
            Err(err) => {
                self.audit(
                    Some(recovery),
                    format!("could not manage to promote suggested candidate {}: {}", candidate.key, err),
                )
                .await;
                recovery.add_error(&err);
                promoted
            }
        }
    }

    /// Configured override checks that can still cancel a promotion.
    async fn override_primary_promotion(
        &self,
        recovery: &Arc<TopologyRecovery>,
        analysis: &AnalysisEntry,
        promoted: Option<Instance>,
    ) -> Option<Instance> {
        let promoted = promoted?;
        if let Some(reason) = geographic_constraint_violation(&self.config, analysis, &promoted) {
            let message =
                format!("RecoverDeadPrimary: failed {} promotion; {}", promoted.key, reason);
            self.audit(Some(recovery), &message).await;
            recovery.add_error_message(message);
            return None;
        }
        let lag_limit_minutes = self.config.fail_primary_promotion_on_lag_minutes;
        if lag_limit_minutes > 0
            && promoted.replication_lag_seconds.unwrap_or(0) >= u64::from(lag_limit_minutes) * 60
        {
            let message = format!(
                "RecoverDeadPrimary: failed promotion. FailPrimaryPromotionOnLagMinutes is set to {} and promoted replica {} lags {:?} seconds",
                lag_limit_minutes, promoted.key, promoted.replication_lag_seconds
            );
            self.audit(Some(recovery), &message).await;
            recovery.add_error_message(message);
            return None;
        }
        if self.config.fail_primary_promotion_if_sql_thread_not_up_to_date
            && !promoted.sql_thread_up_to_date
        {
            let message = format!(
                "RecoverDeadPrimary: failed promotion. FailPrimaryPromotionIfSQLThreadNotUpToDate is set and promoted replica {} has unapplied relay logs",
                promoted.key
            );
            self.audit(Some(recovery), &message).await;
            recovery.add_error_message(message);
            return None;
        }
        if self.config.delay_primary_promotion_if_sql_thread_not_up_to_date
            && !promoted.sql_thread_up_to_date
        {
            self.audit(
                Some(recovery),
                format!(
                    "DelayPrimaryPromotionIfSQLThreadNotUpToDate: waiting for SQL thread on {}",
                    promoted.key
                ),
            )
            .await;
            match self
                .topology
                .wait_for_sql_thread_up_to_date(
                    &promoted.key,
                    Some(self.config.reasonable_maintenance_replication_lag),
                    None,
                )
                .await
            {
                Ok(caught_up) => {
                    self.audit(
                        Some(recovery),
                        format!(
                            "DelayPrimaryPromotionIfSQLThreadNotUpToDate: SQL thread caught up on {}",
                            caught_up.key
                        ),
                    )
                    .await;
                    return Some(caught_up);
                }
                Err(err) => {
                    let message =
                        format!("DelayPrimaryPromotionIfSQLThreadNotUpToDate error: {}", err);
                    self.audit(Some(recovery), &message).await;
                    recovery.add_error_message(message);
                    return None;
                }
            }
        }
        Some(promoted)
    }

    /// Post-promotion operations on the new primary: reset replication (with
    /// configured retries), set semi-sync, lift read-only, demote the old
    /// primary to read-only, publish the new primary identity to KV and
    /// rebind the cluster alias.
    async fn apply_post_promotion(
        self: &Arc<Self>,
        recovery: &Arc<TopologyRecovery>,
        promoted: &Instance,
        skip_hooks: bool,
    ) {
        let analysis = &recovery.analysis_entry;
        if self.config.apply_mysql_promotion_after_primary_failover {
            self.audit(
                Some(recovery),
                "- RecoverDeadPrimary: will apply MySQL changes to promoted primary",
            )
            .await;
            {
                let mut result = self.topology.reset_replication(&promoted.key).await;
                for _ in 0..self.config.reset_replication_retries {
                    if result.is_ok() {
                        break;
                    }
                    result = self.topology.reset_replication(&promoted.key).await;
                }
                self.audit(
                    Some(recovery),
                    format!(
                        "- RecoverDeadPrimary: applying reset-replication on promoted primary: success={}",
                        result.is_ok()
                    ),
                )
                .await;
                if result.is_err() {
                    self.audit(
                        Some(recovery),
                        format!(
                            "- RecoverDeadPrimary: NOTE that {} is promoted even though its replication status may still name a primary",
                            promoted.key
                        ),
                    )
                    .await;
                }
            }
            {
                let semi_sync_replicas = self.topology.primary_semi_sync(&promoted.key).await;
                let result = self
                    .topology
                    .set_semi_sync_primary(&promoted.key, semi_sync_replicas > 0)
                    .await;
                self.audit(
                    Some(recovery),
                    format!(
                        "- RecoverDeadPrimary: applying semi-sync {}: success={}",
                        semi_sync_replicas > 0,
                        result.is_ok()
                    ),
                )
                .await;
                // don't allow writes if semi-sync settings fail
                if result.is_ok() {
                    let result = self.topology.set_read_only(&promoted.key, false).await;
                    self.audit(
                        Some(recovery),
                        format!(
                            "- RecoverDeadPrimary: applying read-only=0 on promoted primary: success={}",
                            result.is_ok()
                        ),
                    )
                    .await;
                }
            }
        }

        // Attempt, though not necessarily succeed, to set the old primary read-only.
        {
            let engine = Arc::clone(self);
            let old_primary_key = analysis.analyzed_instance_key.clone();
            let postponed_recovery = Arc::clone(recovery);
            tokio::spawn(async move {
                let result = engine.topology.set_read_only(&old_primary_key, true).await;
                engine
                    .audit(
                        Some(&postponed_recovery),
                        format!(
                            "- RecoverDeadPrimary: applying read-only=1 on demoted primary: success={}",
                            result.is_ok()
                        ),
                    )
                    .await;
            });
        }

        let kv_pairs =
            self.cluster_primary_kv_pairs(&analysis.cluster_details.cluster_alias, &promoted.key);
        self.audit(Some(recovery), format!("Writing KV {:?}", kv_pairs)).await;
        for pair in &kv_pairs {
            if let Err(err) = self.kv.put_kv_pair(pair).await {
                error!("writing KV pair {:?} failed: {}", pair, err);
            }
        }
        self.audit(Some(recovery), format!("Distributing KV {:?}", kv_pairs)).await;
        if let Err(err) = self.kv.distribute_pairs(&kv_pairs).await {
            error!("distributing KV pairs failed: {}", err);
        }

        if self.config.primary_failover_detach_replica_primary_host {
            let engine = Arc::clone(self);
            let postponed_recovery = Arc::clone(recovery);
            let promoted_key = promoted.key.clone();
            recovery.postponed.add(
                format!("dead-primary recovery: detach primary host on promoted primary {}", promoted_key),
                Box::pin(async move {
                    engine
                        .audit(
                            Some(&postponed_recovery),
                            "- RecoverDeadPrimary: detaching primary host on promoted primary",
                        )
                        .await;
                    engine.topology.detach_replica_primary_host(&promoted_key).await
                }),
            );
        }

        {
            let before = analysis.analyzed_instance_key.to_string();
            let after = promoted.key.to_string();
            self.audit(
                Some(recovery),
                format!("- RecoverDeadPrimary: updating cluster_alias: {} -> {}", before, after),
            )
            .await;
            let alias = &analysis.cluster_details.cluster_alias;
            let result = if alias.is_empty() {
                self.topology.replace_alias_cluster_name(&before, &after).await
            } else {
                self.topology.set_cluster_alias(&after, alias).await
            };
            if let Err(err) = result {
                error!("updating cluster alias failed: {}", err);
            }
            if let Err(err) = self
                .kv
                .set_general_attribute(&analysis.cluster_details.cluster_domain, &after)
                .await
            {
                error!("setting cluster general attribute failed: {}", err);
            }
        }

        if !skip_hooks {
            let _ = self
                .run_hooks(
                    &self.config.post_primary_failover_processes,
                    "PostPrimaryFailoverProcesses",
                    recovery,
                    false,
                )
                .await;
        }
    }

    pub(crate) fn cluster_primary_kv_pairs(
        &self,
        cluster_alias: &str,
        primary_key: &InstanceKey,
    ) -> Vec<KvPair> {
        if cluster_alias.is_empty() {
            return Vec::new();
        }
        let prefix = &self.config.kv_cluster_primary_prefix;
        vec![
            KvPair::new(format!("{}/{}", prefix, cluster_alias), primary_key.to_string()),
            KvPair::new(
                format!("{}/{}/hostname", prefix, cluster_alias),
                primary_key.hostname.clone(),
            ),
            KvPair::new(
                format!("{}/{}/port", prefix, cluster_alias),
                primary_key.port.to_string(),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::analysis::AnalysisCode;

    #[test]
    fn test_primary_recovery_kind_classification() {
        let mut entry = AnalysisEntry::new(
            AnalysisCode::DeadPrimary,
            InstanceKey::new("primary", 3306),
        );
        assert_eq!(primary_recovery_kind(&entry), PrimaryRecoveryKind::Unknown);

        entry.oracle_gtid_immediate_topology = true;
        assert_eq!(primary_recovery_kind(&entry), PrimaryRecoveryKind::Gtid);

        entry.oracle_gtid_immediate_topology = false;
        entry.mariadb_gtid_immediate_topology = true;
        assert_eq!(primary_recovery_kind(&entry), PrimaryRecoveryKind::Gtid);

        entry.mariadb_gtid_immediate_topology = false;
        entry.binlog_server_immediate_topology = true;
        assert_eq!(primary_recovery_kind(&entry), PrimaryRecoveryKind::BinlogServer);
    }
}
