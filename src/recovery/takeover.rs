/// Forced and Graceful Primary Takeover
///
/// Operator-initiated reparenting. Forced variants trust that the cluster
/// primary is dead and inject a dead-primary analysis; the graceful variant
/// demotes a live primary after the designated replica has caught up with
/// its coordinates, then repoints the old primary underneath the new one.

use crate::error::{RecoveryError, Result};
use crate::recovery::analysis::{AnalysisCode, AnalysisEntry};
use crate::recovery::candidate::{
    is_banned_from_being_candidate_replica, is_generally_valid_as_would_be_primary,
    promotion_preference_order,
};
use crate::recovery::dispatcher::{RecoveryAttempt, RecoveryEngine};
use crate::recovery::record::{PrimaryRecoveryKind, TopologyRecovery};
use crate::topology::instance::{BinlogCoordinates, Instance, InstanceKey};
use crate::topology::service::GtidHint;
use std::sync::Arc;
use tracing::{info, warn};

pub const FORCE_PRIMARY_FAILOVER_COMMAND_HINT: &str = "force-primary-failover";
pub const FORCE_PRIMARY_TAKEOVER_COMMAND_HINT: &str = "force-primary-takeover";
pub const GRACEFUL_PRIMARY_TAKEOVER_COMMAND_HINT: &str = "graceful-primary-takeover";

impl RecoveryEngine {
    /// Issues a recovery even if analysis says there is no recovery case.
    /// The caller injects the analysis it wishes assumed, and takes
    /// responsibility for its actions.
    pub async fn force_execute_recovery(
        self: &Arc<Self>,
        analysis: AnalysisEntry,
        candidate_hint: Option<&InstanceKey>,
        skip_hooks: bool,
    ) -> RecoveryAttempt {
        self.handle_analysis(analysis, candidate_hint, true, skip_hooks).await
    }

    /// Synthesizes an analysis entry of the given code for an instance,
    /// deriving topology facts from the inventory.
    pub(crate) async fn forced_analysis_entry(
        &self,
        template: &AnalysisEntry,
        analysis_code: AnalysisCode,
        command_hint: &str,
        failed_key: &InstanceKey,
    ) -> Result<AnalysisEntry> {
        let mut entry = template.clone();
        entry.analysis = analysis_code;
        entry.command_hint = command_hint.to_string();
        entry.analyzed_instance_key = failed_key.clone();

        if let Some(instance) = self.topology.read_instance(failed_key).await? {
            entry.analyzed_instance_primary_key = instance.source_key.clone();
            entry.analyzed_instance_data_center = instance.data_center.clone();
            entry.analyzed_instance_physical_environment = instance.physical_environment.clone();
            entry.analyzed_instance_region = instance.region.clone();
            entry.analyzed_instance_binlog_coordinates = instance.self_binlog_coordinates.clone();
            entry.is_primary = !instance.source_key.is_valid();
        }
        let replicas = self.topology.read_replica_instances(failed_key).await.unwrap_or_default();
        if !replicas.is_empty() {
            entry.count_replicas = replicas.len() as u32;
            entry.replicas = replicas.iter().map(|replica| replica.key.clone()).collect();
            entry.binlog_server_immediate_topology =
                replicas.iter().all(|replica| replica.is_binlog_server);
            entry.oracle_gtid_immediate_topology = !entry.binlog_server_immediate_topology;
        }
        Ok(entry)
    }

    async fn single_cluster_primary(&self, cluster: &str) -> Result<Instance> {
        let mut primaries = self.topology.read_cluster_primary(cluster).await?;
        if primaries.len() != 1 {
            return Err(RecoveryError::PreconditionFailed(format!(
                "Cannot deduce cluster primary for {}",
                cluster
            )));
        }
        Ok(primaries.remove(0))
    }

    fn expect_promotion(attempt: RecoveryAttempt) -> Result<Arc<TopologyRecovery>> {
        if !attempt.attempted {
            return Err(RecoveryError::Internal(
                "recovery not attempted. This should not happen".to_string(),
            ));
        }
        let recovery = attempt.recovery.ok_or_else(|| {
            RecoveryError::Internal(
                "recovery attempted but with no results. This should not happen".to_string(),
            )
        })?;
        if recovery.successor_key().is_none() {
            return Err(RecoveryError::StepFailed(
                "recovery attempted yet no replica promoted".to_string(),
            ));
        }
        Ok(recovery)
    }

    /// Trusts that the primary of the given cluster is dead and initiates a
    /// failover.
    pub async fn force_primary_failover(
        self: &Arc<Self>,
        cluster: &str,
    ) -> Result<Arc<TopologyRecovery>> {
        let cluster_primary = self.single_cluster_primary(cluster).await?;
        let template = AnalysisEntry::new(AnalysisCode::DeadPrimary, cluster_primary.key.clone());
        let analysis = self
            .forced_analysis_entry(
                &template,
                AnalysisCode::DeadPrimary,
                FORCE_PRIMARY_FAILOVER_COMMAND_HINT,
                &cluster_primary.key,
            )
            .await?;
        let attempt = self.force_execute_recovery(analysis, None, false).await;
        Self::expect_promotion(attempt)
    }

    /// Trusts that the primary of the given cluster is dead and fails over to
    /// the designated instance, which must be its direct replica.
    pub async fn force_primary_takeover(
        self: &Arc<Self>,
        cluster: &str,
        destination: &Instance,
    ) -> Result<Arc<TopologyRecovery>> {
        let cluster_primary = self.single_cluster_primary(cluster).await?;
        if destination.source_key != cluster_primary.key {
            return Err(RecoveryError::InvalidInput(format!(
                "you may only promote a direct child of the primary {}. The primary of {} is {}.",
                cluster_primary.key, destination.key, destination.source_key
            )));
        }
        info!("Will demote {} and promote {} instead", cluster_primary.key, destination.key);

        let template = AnalysisEntry::new(AnalysisCode::DeadPrimary, cluster_primary.key.clone());
        let analysis = self
            .forced_analysis_entry(
                &template,
                AnalysisCode::DeadPrimary,
                FORCE_PRIMARY_TAKEOVER_COMMAND_HINT,
                &cluster_primary.key,
            )
            .await?;
        let attempt = self
            .force_execute_recovery(analysis, Some(&destination.key), false)
            .await;
        Self::expect_promotion(attempt)
    }

    async fn graceful_takeover_designated_instance(
        &self,
        cluster_primary_key: &InstanceKey,
        designated_key: Option<&InstanceKey>,
        direct_replicas: &[Instance],
        auto: bool,
    ) -> Result<Instance> {
        let Some(designated_key) = designated_key else {
            if direct_replicas.len() == 1 {
                // single replica; that's the one to promote
                return Ok(direct_replicas[0].clone());
            }
            if !auto {
                return Err(RecoveryError::InvalidInput(format!(
                    "GracefulPrimaryTakeover: target instance not indicated, auto=false, and primary {} has {} replicas. Cannot choose where to failover to. Aborting",
                    cluster_primary_key,
                    direct_replicas.len()
                )));
            }
            let mut candidates: Vec<&Instance> = direct_replicas
                .iter()
                .filter(|replica| {
                    is_generally_valid_as_would_be_primary(&self.config, replica, true)
                        && !is_banned_from_being_candidate_replica(&self.config, replica)
                })
                .collect();
            candidates.sort_by(|a, b| {
                promotion_preference_order(a.promotion_rule)
                    .cmp(&promotion_preference_order(b.promotion_rule))
                    .then_with(|| b.exec_binlog_coordinates.cmp(&a.exec_binlog_coordinates))
            });
            let designated = candidates.first().copied().cloned().ok_or_else(|| {
                RecoveryError::PreconditionFailed(format!(
                    "GracefulPrimaryTakeover: no target instance indicated, failed to auto-detect candidate replica for primary {}. Aborting",
                    cluster_primary_key
                ))
            })?;
            self.topology.start_replication(&designated.key).await.map_err(|_| {
                RecoveryError::StepFailed(format!(
                    "GracefulPrimaryTakeover: cannot start replication on designated replica {}. Aborting",
                    designated.key
                ))
            })?;
            info!("GracefulPrimaryTakeover: designated primary deduced to be {}", designated.key);
            return Ok(designated);
        };

        let designated = direct_replicas
            .iter()
            .find(|replica| &replica.key == designated_key)
            .cloned()
            .ok_or_else(|| {
                RecoveryError::InvalidInput(format!(
                    "GracefulPrimaryTakeover: indicated designated instance {} must be directly replicating from the primary {}",
                    designated_key, cluster_primary_key
                ))
            })?;
        info!("GracefulPrimaryTakeover: designated primary instructed to be {}", designated.key);
        Ok(designated)
    }

    /// Demotes the primary of an existing topology and promotes a direct
    /// replica in its stead: locks the promotion down to the designated
    /// replica, waits for it to reach the primary's last position, forces a
    /// dead-primary recovery with it as candidate, and repoints the old
    /// primary at the newly promoted one.
    pub async fn graceful_primary_takeover(
        self: &Arc<Self>,
        cluster: &str,
        designated_key: Option<&InstanceKey>,
        auto: bool,
    ) -> Result<(Arc<TopologyRecovery>, BinlogCoordinates)> {
        let cluster_primary = self.single_cluster_primary(cluster).await?;
        let direct_replicas =
            self.topology.read_replica_instances(&cluster_primary.key).await?;
        if direct_replicas.is_empty() {
            return Err(RecoveryError::PreconditionFailed(format!(
                "primary {} doesn't seem to have replicas",
                cluster_primary.key
            )));
        }
        let designated_key = designated_key.filter(|key| key.is_valid());
        let designated = self
            .graceful_takeover_designated_instance(
                &cluster_primary.key,
                designated_key,
                &direct_replicas,
                auto,
            )
            .await?;

        if is_banned_from_being_candidate_replica(&self.config, &designated) {
            return Err(RecoveryError::PromotionRuleViolated(format!(
                "GracefulPrimaryTakeover: designated instance {} cannot be promoted due to promotion rule or hostname filters",
                designated.key
            )));
        }
        if designated.source_key != cluster_primary.key {
            return Err(RecoveryError::PreconditionFailed(format!(
                "sanity check failure: designated instance {} does not replicate from the primary {}",
                designated.key, cluster_primary.key
            )));
        }
        if !designated
            .has_reasonable_maintenance_replication_lag(
                self.config.reasonable_maintenance_replication_lag,
            )
        {
            return Err(RecoveryError::PreconditionFailed(format!(
                "designated instance {} is lagging too much for this operation. Aborting",
                designated.key
            )));
        }

        if direct_replicas.len() > 1 {
            info!(
                "GracefulPrimaryTakeover: will let {} take over its siblings",
                designated.key
            );
            let outcome = self
                .topology
                .relocate_replicas(&cluster_primary.key, &designated.key, "")
                .await?;
            if outcome.relocated.len() != direct_replicas.len() - 1 {
                let relocated_keys: Vec<&InstanceKey> =
                    outcome.relocated.iter().map(|replica| &replica.key).collect();
                for replica in &direct_replicas {
                    if relocated_keys.contains(&&replica.key) || replica.key == designated.key {
                        continue;
                    }
                    if replica.is_downtimed {
                        warn!(
                            "GracefulPrimaryTakeover: unable to relocate {} below designated {}, but it is downtimed; proceeding",
                            replica.key, designated.key
                        );
                        continue;
                    }
                    return Err(RecoveryError::StepFailed(format!(
                        "designated instance {} cannot take over all of its siblings",
                        designated.key
                    )));
                }
            }
        }
        info!(
            "GracefulPrimaryTakeover: will demote {} and promote {} instead",
            cluster_primary.key, designated.key
        );

        let template = AnalysisEntry::new(AnalysisCode::DeadPrimary, cluster_primary.key.clone());
        let analysis = self
            .forced_analysis_entry(
                &template,
                AnalysisCode::DeadPrimary,
                GRACEFUL_PRIMARY_TAKEOVER_COMMAND_HINT,
                &cluster_primary.key,
            )
            .await?;

        // Pre-takeover hooks run against an unregistered recovery that
        // already names the designated successor.
        let pre_takeover_recovery = Arc::new(TopologyRecovery::new(0, analysis.clone()));
        pre_takeover_recovery.set_successor(Some((
            designated.key.clone(),
            designated.instance_alias.clone(),
        )));
        self.run_hooks(
            &self.config.pre_graceful_takeover_processes,
            "PreGracefulTakeoverProcesses",
            &pre_takeover_recovery,
            true,
        )
        .await
        .map_err(|err| {
            RecoveryError::HookFailed(format!("failed running PreGracefulTakeoverProcesses: {}", err))
        })?;

        let demoted_primary_coordinates = cluster_primary.self_binlog_coordinates.clone();
        info!(
            "GracefulPrimaryTakeover: will wait for {} to reach primary coordinates {}",
            designated.key, demoted_primary_coordinates
        );
        let designated = self
            .topology
            .wait_for_exec_binlog_coordinates_to_reach(
                &designated.key,
                &demoted_primary_coordinates,
                self.config.reasonable_maintenance_replication_lag,
            )
            .await?;
        let promoted_primary_coordinates = designated.self_binlog_coordinates.clone();

        info!("GracefulPrimaryTakeover: attempting recovery");
        let attempt = self
            .force_execute_recovery(analysis, Some(&designated.key), false)
            .await;
        if let Some(err) = &attempt.error {
            warn!("GracefulPrimaryTakeover: noting an error, and for now proceeding: {}", err);
        }
        let recovery = Self::expect_promotion(attempt)?;

        let gtid_hint = if recovery.primary_recovery_kind() == PrimaryRecoveryKind::Gtid {
            GtidHint::Force
        } else {
            GtidHint::Neutral
        };
        let old_primary = self
            .topology
            .change_primary_to(
                &cluster_primary.key,
                &designated.key,
                &promoted_primary_coordinates,
                gtid_hint,
            )
            .await?;
        if old_primary.self_binlog_coordinates != demoted_primary_coordinates {
            warn!(
                "GracefulPrimaryTakeover: sanity problem. Demoted primary's coordinates changed from {} to {} while supposed to have been frozen",
                demoted_primary_coordinates, old_primary.self_binlog_coordinates
            );
        }
        if let Err(err) = self.topology.start_replication(&cluster_primary.key).await {
            warn!(
                "GracefulPrimaryTakeover: could not start replication on demoted primary {}: {}",
                cluster_primary.key, err
            );
        }

        let _ = self
            .run_hooks(
                &self.config.post_graceful_takeover_processes,
                "PostGracefulTakeoverProcesses",
                &recovery,
                false,
            )
            .await;

        Ok((recovery, promoted_primary_coordinates))
    }
}
