/// Dead-Co-Primary Recovery
///
/// One node of a symmetric writable pair died. Replicas are regrouped via
/// GTID; depending on configuration and on whether the surviving co-primary
/// is writable, the survivor is forced on top. The post-state is always a
/// single writable primary. When a replica other than the surviving
/// co-primary is promoted, the potential replication circle
/// `M1 -> S1 -> M2 -> M1` is broken by detaching the promoted instance's
/// primary-host pointer.

use crate::error::RecoveryError;
use crate::recovery::analysis::AnalysisEntry;
use crate::recovery::dispatcher::{RecoveryAttempt, RecoveryEngine};
use crate::recovery::record::{PrimaryRecoveryKind, RecoveryKind, TopologyRecovery};
use crate::topology::instance::{Instance, InstanceKey};
use std::sync::Arc;
use tracing::{info, warn};

impl RecoveryEngine {
    pub(crate) async fn check_and_recover_dead_co_primary(
        self: &Arc<Self>,
        analysis: &AnalysisEntry,
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
                        "found an active or recent recovery on {}. Will not issue another RecoverDeadCoPrimary.",
                        analysis.analyzed_instance_key
                    ),
                )
                .await;
                return RecoveryAttempt::skipped();
            }
            Err(err) => return RecoveryAttempt::failed(err),
        };

        self.metrics.dead_co_primary.start.inc();
        let (promoted, lost_replicas, error) =
            self.recover_dead_co_primary(&recovery, skip_hooks).await;
        recovery.add_lost_replicas(&lost_replicas);
        let _ = self.registry.resolve(&recovery, promoted.as_ref()).await;
        match &promoted {
            None => info!(
                "recover-dead-co-primary on {}: Failure: no replica promoted.",
                analysis.analyzed_instance_key
            ),
            Some(promoted) => info!(
                "recover-dead-co-primary on {}: promoted: {}",
                analysis.analyzed_instance_key, promoted.key
            ),
        }

        match &promoted {
            Some(promoted) => {
                if self.config.fail_primary_promotion_if_sql_thread_not_up_to_date
                    && !promoted.sql_thread_up_to_date
                {
                    let err = RecoveryError::PromotionRuleViolated(format!(
                        "Promoted replica {}: sql thread is not up to date (relay logs still unapplied). Aborting promotion",
                        promoted.key
                    ));
                    warn!("{}", err);
                    recovery.add_error(&err);
                    return RecoveryAttempt {
                        attempted: false,
                        recovery: Some(recovery),
                        error: Some(err),
                    };
                }
                self.metrics.dead_co_primary.success.inc();

                if self.config.apply_mysql_promotion_after_primary_failover {
                    self.audit(
                        Some(&recovery),
                        "- RecoverDeadCoPrimary: will apply MySQL changes to promoted primary",
                    )
                    .await;
                    if let Err(err) = self.topology.set_read_only(&promoted.key, false).await {
                        recovery.add_error(&err);
                    }
                }
                if !skip_hooks {
                    let _ = self
                        .run_hooks(
                            &self.config.post_primary_failover_processes,
                            "PostPrimaryFailoverProcesses",
                            &recovery,
                            false,
                        )
                        .await;
                }
            }
            None => self.metrics.dead_co_primary.fail.inc(),
        }
        RecoveryAttempt {
            attempted: true,
            recovery: Some(recovery),
            error,
        }
    }

    async fn recover_dead_co_primary(
        self: &Arc<Self>,
        recovery: &Arc<TopologyRecovery>,
        skip_hooks: bool,
    ) -> (Option<Instance>, Vec<Instance>, Option<RecoveryError>) {
        recovery.set_kind(RecoveryKind::CoPrimaryRecovery);
        let analysis = recovery.analysis_entry.clone();
        let failed_key = analysis.analyzed_instance_key.clone();
        let other_co_primary_key = analysis.analyzed_instance_primary_key.clone();
        let mut lost_replicas: Vec<Instance> = Vec::new();

        let other_co_primary = match self.topology.read_instance(&other_co_primary_key).await {
            Ok(Some(instance)) => instance,
            _ => {
                let err = RecoveryError::PreconditionFailed(format!(
                    "RecoverDeadCoPrimary: could not read info for co-primary {} of {}",
                    other_co_primary_key, failed_key
                ));
                recovery.add_error(&err);
                return (None, lost_replicas, Some(err));
            }
        };

        info!("recover-dead-co-primary on {}: problem found; will recover", failed_key);
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
                return (None, lost_replicas, Some(err));
            }
        }

        self.audit(
            Some(recovery),
            format!("RecoverDeadCoPrimary: will recover {}", failed_key),
        )
        .await;

        let recovery_kind = if analysis.oracle_gtid_immediate_topology
            || analysis.mariadb_gtid_immediate_topology
        {
            PrimaryRecoveryKind::Gtid
        } else {
            PrimaryRecoveryKind::Unknown
        };
        recovery.set_primary_recovery_kind(recovery_kind);
        self.audit(
            Some(recovery),
            format!("RecoverDeadCoPrimary: coPrimaryRecoveryType={:?}", recovery_kind),
        )
        .await;

        let mut promoted: Option<Instance> = None;
        let mut error: Option<RecoveryError> = None;
        match recovery_kind {
            PrimaryRecoveryKind::Gtid => {
                match self
                    .topology
                    .regroup_replicas_gtid(&failed_key, true, &recovery.postponed, None)
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
            }
            _ => {
                let err = RecoveryError::PreconditionFailed(
                    "RecoverDeadCoPrimary: RecoveryType unknown/unsupported".to_string(),
                );
                recovery.add_error(&err);
                return (None, lost_replicas, Some(err));
            }
        }

        let mut must_promote_other_co_primary =
            self.config.co_primary_recovery_must_promote_other_co_primary;
        if !other_co_primary.read_only {
            self.audit(
                Some(recovery),
                format!(
                    "RecoverDeadCoPrimary: other co-primary {} is writeable hence has to be promoted",
                    other_co_primary.key
                ),
            )
            .await;
            must_promote_other_co_primary = true;
        }
        self.audit(
            Some(recovery),
            format!(
                "RecoverDeadCoPrimary: mustPromoteOtherCoPrimary? {}",
                must_promote_other_co_primary
            ),
        )
        .await;

        if let Some(promoted_instance) = promoted.clone() {
            recovery.add_participant(&promoted_instance.key);
            promoted = Some(if must_promote_other_co_primary {
                self.audit(
                    Some(recovery),
                    format!(
                        "RecoverDeadCoPrimary: mustPromoteOtherCoPrimary. Verifying that {} is/can be promoted",
                        other_co_primary_key
                    ),
                )
                .await;
                self.replace_promoted_replica_with_candidate(
                    recovery,
                    &failed_key,
                    promoted_instance,
                    Some(&other_co_primary_key),
                )
                .await
            } else {
                // we are allowed to promote any server
                self.replace_promoted_replica_with_candidate(
                    recovery,
                    &failed_key,
                    promoted_instance,
                    None,
                )
                .await
            });
        }
        if let Some(promoted_instance) = &promoted {
            if must_promote_other_co_primary && promoted_instance.key != other_co_primary_key {
                let err = RecoveryError::StepFailed(format!(
                    "RecoverDeadCoPrimary: could not manage to promote other-co-primary {}; was only able to promote {}; the other co-primary must be promoted (by configuration or because it is writeable), therefore failing",
                    other_co_primary_key, promoted_instance.key
                ));
                recovery.add_error(&err);
                error = Some(err);
                promoted = None;
            }
        }
        if let Some(promoted_instance) = promoted.clone() {
            if self.config.delay_primary_promotion_if_sql_thread_not_up_to_date
                && !promoted_instance.sql_thread_up_to_date
            {
                self.audit(
                    Some(recovery),
                    format!(
                        "Waiting to ensure the SQL thread catches up on {}",
                        promoted_instance.key
                    ),
                )
                .await;
                match self
                    .topology
                    .wait_for_sql_thread_up_to_date(
                        &promoted_instance.key,
                        Some(self.config.reasonable_maintenance_replication_lag),
                        None,
                    )
                    .await
                {
                    Ok(caught_up) => {
                        self.audit(
                            Some(recovery),
                            format!("SQL thread caught up on {}", caught_up.key),
                        )
                        .await;
                        promoted = Some(caught_up);
                    }
                    Err(err) => {
                        recovery.add_error(&err);
                        return (promoted, lost_replicas, Some(err));
                    }
                }
            }
            // The replacement step may have swapped the promotion to a
            // different instance than the one recorded after regrouping.
            recovery.add_participant(&promoted_instance.key);
        }

        // We may have promoted either the other co-primary or another replica.
        // A new co-primary layout is never attempted; a single primary is the
        // post-state. If the promoted instance is not the other co-primary,
        // it still remembers a source, and the other co-primary remembers the
        // dead one: a 3-node circle that must be broken no matter what.
        if let Some(promoted_instance) = &promoted {
            if promoted_instance.key != other_co_primary_key {
                if let Err(err) = self
                    .topology
                    .detach_replica_primary_host(&promoted_instance.key)
                    .await
                {
                    recovery.add_error(&err);
                }
            }
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
                format!("co-primary recovery: detach {} lost replicas", lost_keys.len()),
                Box::pin(async move {
                    engine
                        .audit(
                            Some(&postponed_recovery),
                            format!(
                                "- RecoverDeadCoPrimary: lost {} replicas during recovery process; detaching them",
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

        let _ = self
            .topology
            .begin_downtime(
                &failed_key,
                "rusty-failover",
                "lost in recovery",
                self.config.lost_in_recovery_downtime,
            )
            .await;
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

        (promoted, lost_replicas, error)
    }
}
