/// Dead-Intermediate-Primary Recovery
///
/// An intermediate primary feeds a subtree of replicas. When it dies the
/// subtree is re-homed by trying plans in order: relocate under a candidate
/// sibling in the same data center, regroup the orphans under one of
/// themselves, relocate under a sibling in another data center, and finally
/// relocate the survivors directly under the failed node's own source.

use crate::error::RecoveryError;
use crate::recovery::analysis::AnalysisEntry;
use crate::recovery::dispatcher::{RecoveryAttempt, RecoveryEngine};
use crate::recovery::record::{RecoveryKind, TopologyRecovery};
use crate::topology::instance::{Instance, InstanceKey};
use std::sync::Arc;
use tracing::info;

impl RecoveryEngine {
    pub(crate) async fn check_and_recover_dead_intermediate_primary(
        self: &Arc<Self>,
        analysis: &AnalysisEntry,
        force: bool,
        skip_hooks: bool,
    ) -> RecoveryAttempt {
        if !(force || analysis.cluster_details.has_automated_intermediate_primary_recovery) {
            return RecoveryAttempt::skipped();
        }
        let recovery = match self.registry.register(analysis, !force, !force).await {
            Ok(Some(recovery)) => recovery,
            Ok(None) => {
                self.audit(
                    None,
                    format!(
                        "found an active or recent recovery on {}. Will not issue another RecoverDeadIntermediatePrimary.",
                        analysis.analyzed_instance_key
                    ),
                )
                .await;
                return RecoveryAttempt::skipped();
            }
            Err(err) => return RecoveryAttempt::failed(err),
        };

        self.metrics.dead_intermediate_primary.start.inc();
        let successor = self.recover_dead_intermediate_primary(&recovery, skip_hooks).await;
        match &successor {
            Some(_) => {
                self.metrics.dead_intermediate_primary.success.inc();
                if !skip_hooks {
                    let _ = self
                        .run_hooks(
                            &self.config.post_intermediate_primary_failover_processes,
                            "PostIntermediatePrimaryFailoverProcesses",
                            &recovery,
                            false,
                        )
                        .await;
                }
            }
            None => self.metrics.dead_intermediate_primary.fail.inc(),
        }
        RecoveryAttempt {
            attempted: true,
            recovery: Some(recovery),
            error: None,
        }
    }

    async fn recover_dead_intermediate_primary(
        self: &Arc<Self>,
        recovery: &Arc<TopologyRecovery>,
        skip_hooks: bool,
    ) -> Option<Instance> {
        recovery.set_kind(RecoveryKind::IntermediatePrimaryRecovery);
        let analysis = recovery.analysis_entry.clone();
        let failed_key = analysis.analyzed_instance_key.clone();

        info!(
            "recover-dead-intermediate-primary on {}: problem found; will recover",
            failed_key
        );
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
                let _ = self.registry.resolve(recovery, None).await;
                return None;
            }
        }

        let intermediate = match self.topology.read_instance(&failed_key).await {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                recovery.add_error(&RecoveryError::NotFound(failed_key.to_string()));
                let _ = self.registry.resolve(recovery, None).await;
                return None;
            }
            Err(err) => {
                recovery.add_error(&err);
                let _ = self.registry.resolve(recovery, None).await;
                return None;
            }
        };

        let candidate_sibling = self
            .get_candidate_sibling_of_intermediate_primary(recovery, &intermediate)
            .await
            .ok()
            .flatten();
        let mut recovery_resolved = false;
        let mut successor: Option<Instance> = None;

        // Plan A: a replacement intermediate primary in the same data center.
        if let Some(sibling) = candidate_sibling
            .as_ref()
            .filter(|sibling| sibling.data_center == intermediate.data_center)
        {
            if let Some(adopted) = self
                .relocate_replicas_to_candidate_sibling(recovery, &failed_key, sibling)
                .await
            {
                recovery_resolved = true;
                successor = Some(adopted);
            }
        }
        if !recovery_resolved {
            // Plan B: regroup, reducing cross-DC replication streams.
            self.audit(
                Some(recovery),
                "- RecoverDeadIntermediatePrimary: will next attempt regrouping of replicas",
            )
            .await;
            match self.topology.regroup_replicas(&failed_key, true).await {
                Ok(outcome) => {
                    if let Some(regroup_promoted) = outcome.promoted {
                        self.audit(
                            Some(recovery),
                            format!(
                                "- RecoverDeadIntermediatePrimary: regrouped under {}, with {} lost replicas",
                                regroup_promoted.key,
                                outcome.lost_replicas.len()
                            ),
                        )
                        .await;
                        recovery.add_participant(&regroup_promoted.key);
                        if outcome.lost_replicas.is_empty() {
                            // The local replica took over all of its siblings;
                            // consider it the successor.
                            successor = Some(regroup_promoted);
                        }
                    }
                }
                Err(err) => {
                    self.audit(
                        Some(recovery),
                        format!("- RecoverDeadIntermediatePrimary: regroup failed on: {}", err),
                    )
                    .await;
                    recovery.add_error(&err);
                }
            }
            // Plan C: a replacement intermediate primary in another data center.
            if let Some(sibling) = candidate_sibling
                .as_ref()
                .filter(|sibling| sibling.data_center != intermediate.data_center)
            {
                self.audit(
                    Some(recovery),
                    "- RecoverDeadIntermediatePrimary: will next attempt relocating to another DC server",
                )
                .await;
                if let Some(adopted) = self
                    .relocate_replicas_to_candidate_sibling(recovery, &failed_key, sibling)
                    .await
                {
                    recovery_resolved = true;
                    successor = Some(adopted);
                }
            }
        }
        if !recovery_resolved {
            // Plan D: match whatever is left directly up under the parent
            // primary. A partially successful regroup is fine; we promote
            // anything not regrouped.
            self.audit(
                Some(recovery),
                format!(
                    "- RecoverDeadIntermediatePrimary: will next attempt to relocate up from {}",
                    failed_key
                ),
            )
            .await;
            match self
                .topology
                .relocate_replicas(&failed_key, &analysis.analyzed_instance_primary_key, "")
                .await
            {
                Ok(outcome) => {
                    recovery.add_error_messages(&outcome.errors);
                    recovery.add_participant(&analysis.analyzed_instance_primary_key);
                    if outcome.relocated.is_empty() {
                        let err = RecoveryError::StepFailed(format!(
                            "RecoverDeadIntermediatePrimary failed to match up any replica from {}",
                            failed_key
                        ));
                        recovery.add_error(&err);
                    } else {
                        recovery_resolved = true;
                        for moved in &outcome.relocated {
                            recovery.add_participant(&moved.key);
                        }
                        if successor.is_none() {
                            // No local replica took over its siblings; the
                            // parent primary is the adoptive successor.
                            successor = outcome.target;
                        }
                        if let Some(successor) = &successor {
                            info!(
                                "recover-dead-intermediate-primary on {}: relocated {} replicas under {}",
                                failed_key,
                                outcome.relocated.len(),
                                successor.key
                            );
                        }
                    }
                }
                Err(err) => {
                    recovery.add_error(&err);
                }
            }
        }
        if !recovery_resolved {
            successor = None;
        }
        let _ = self.registry.resolve(recovery, successor.as_ref()).await;
        successor
    }

    async fn relocate_replicas_to_candidate_sibling(
        &self,
        recovery: &Arc<TopologyRecovery>,
        failed_key: &InstanceKey,
        sibling: &Instance,
    ) -> Option<Instance> {
        self.audit(
            Some(recovery),
            format!(
                "- RecoverDeadIntermediatePrimary: will attempt a candidate intermediate primary: {}",
                sibling.key
            ),
        )
        .await;
        match self.topology.relocate_replicas(failed_key, &sibling.key, "").await {
            Ok(outcome) => {
                recovery.add_error_messages(&outcome.errors);
                recovery.add_participant(&sibling.key);
                if outcome.relocated.is_empty() {
                    self.audit(
                        Some(recovery),
                        format!(
                            "- RecoverDeadIntermediatePrimary: failed to move any replica to candidate intermediate primary ({})",
                            sibling.key
                        ),
                    )
                    .await;
                    return None;
                }
                if !outcome.errors.is_empty() {
                    self.audit(
                        Some(recovery),
                        format!(
                            "- RecoverDeadIntermediatePrimary: move to candidate intermediate primary ({}) did not complete: {:?}",
                            sibling.key, outcome.errors
                        ),
                    )
                    .await;
                    return None;
                }
                for moved in &outcome.relocated {
                    recovery.add_participant(&moved.key);
                }
                info!(
                    "recover-dead-intermediate-primary on {}: relocated {} replicas under candidate sibling {}",
                    failed_key,
                    outcome.relocated.len(),
                    sibling.key
                );
                Some(outcome.target.unwrap_or_else(|| sibling.clone()))
            }
            Err(err) => {
                recovery.add_error(&err);
                self.audit(
                    Some(recovery),
                    format!(
                        "- RecoverDeadIntermediatePrimary: move to candidate intermediate primary ({}) failed: {}",
                        sibling.key, err
                    ),
                )
                .await;
                None
            }
        }
    }
}
