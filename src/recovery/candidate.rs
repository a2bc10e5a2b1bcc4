/// Candidate Selection
///
/// Ranks and filters instances against promotion rules and geographic
/// constraints. Selection never returns a banned, binlog-relay or
/// non-binlogging instance; geographic constraints can veto an otherwise
/// healthy promotion entirely.

use crate::config::RecoveryConfig;
use crate::error::{RecoveryError, Result};
use crate::recovery::analysis::AnalysisEntry;
use crate::recovery::dispatcher::RecoveryEngine;
use crate::recovery::record::TopologyRecovery;
use crate::topology::instance::{Instance, InstanceKey, PromotionRule};
use regex::Regex;
use std::sync::Arc;

/// Rank of a promotion rule when choosing between candidates; lower is
/// preferred.
pub fn promotion_preference_order(rule: PromotionRule) -> u8 {
    match rule {
        PromotionRule::MustPromote => 0,
        PromotionRule::PreferPromote => 1,
        PromotionRule::Neutral => 2,
        PromotionRule::PreferNotPromote => 3,
        PromotionRule::MustNotPromote => 4,
    }
}

/// An instance is banned from promotion by rule or by hostname filter.
pub fn is_banned_from_being_candidate_replica(
    config: &RecoveryConfig,
    instance: &Instance,
) -> bool {
    if instance.promotion_rule == PromotionRule::MustNotPromote {
        return true;
    }
    config
        .promotion_ignore_hostname_filters
        .iter()
        .filter_map(|filter| Regex::new(filter).ok())
        .any(|filter| filter.is_match(&instance.key.hostname))
}

/// Basic health and configuration gates for any would-be primary.
pub fn is_generally_valid_as_would_be_primary(
    config: &RecoveryConfig,
    replica: &Instance,
    require_log_replication_updates: bool,
) -> bool {
    if !replica.is_last_check_valid {
        // something is wrong with this replica right now, don't hope to promote it
        return false;
    }
    if !replica.log_bin_enabled {
        return false;
    }
    if require_log_replication_updates && !replica.log_replication_updates_enabled {
        return false;
    }
    if replica.is_binlog_server {
        return false;
    }
    if is_banned_from_being_candidate_replica(config, replica) {
        return false;
    }
    true
}

/// Can `want_to_take_over` replace `to_be_taken_over` as primary? It must be
/// a valid would-be primary, a direct replica of the promoted server, and the
/// promoted server must be able to replicate from it afterwards.
pub fn can_take_over_promoted_server_as_primary(
    config: &RecoveryConfig,
    want_to_take_over: &Instance,
    to_be_taken_over: &Instance,
) -> bool {
    if !is_generally_valid_as_would_be_primary(config, want_to_take_over, true) {
        return false;
    }
    if want_to_take_over.source_key != to_be_taken_over.key {
        return false;
    }
    if !to_be_taken_over.can_replicate_from(want_to_take_over) {
        return false;
    }
    true
}

/// Returns the reason the suggested instance violates the configured
/// geographic failover constraints, if it does.
pub fn geographic_constraint_violation(
    config: &RecoveryConfig,
    analysis: &AnalysisEntry,
    suggested: &Instance,
) -> Option<String> {
    if config.prevent_cross_data_center_primary_failover
        && suggested.data_center != analysis.analyzed_instance_data_center
    {
        return Some(format!(
            "PreventCrossDataCenterPrimaryFailover: will not promote server in {} when failed server in {}",
            suggested.data_center, analysis.analyzed_instance_data_center
        ));
    }
    if config.prevent_cross_region_primary_failover
        && suggested.region != analysis.analyzed_instance_region
    {
        return Some(format!(
            "PreventCrossRegionPrimaryFailover: will not promote server in {} when failed server in {}",
            suggested.region, analysis.analyzed_instance_region
        ));
    }
    None
}

fn is_generally_valid_as_candidate_sibling(sibling: &Instance) -> bool {
    sibling.log_bin_enabled
        && sibling.log_replication_updates_enabled
        && sibling.replica_running
        && sibling.is_last_check_valid
}

/// Can this sibling take over the replicas of a dead intermediate primary?
pub fn is_valid_as_candidate_sibling_of_intermediate_primary(
    config: &RecoveryConfig,
    intermediate: &Instance,
    sibling: &Instance,
) -> bool {
    if sibling.key == intermediate.key {
        return false;
    }
    if !is_generally_valid_as_candidate_sibling(sibling) {
        return false;
    }
    if is_banned_from_being_candidate_replica(config, sibling) {
        return false;
    }
    if sibling.has_replication_filters != intermediate.has_replication_filters {
        return false;
    }
    if sibling.is_binlog_server != intermediate.is_binlog_server {
        // when the failed intermediate is a relay, repointing its replicas up is simpler
        return false;
    }
    if sibling
        .exec_binlog_coordinates
        .smaller_than(&intermediate.exec_binlog_coordinates)
    {
        return false;
    }
    true
}

/// Orders candidate siblings so the largest surviving subtree, then the most
/// advanced executed position, is tried first.
pub fn sort_siblings_by_subtree_size(siblings: &mut [Instance]) {
    siblings.sort_by(|a, b| {
        b.replicas
            .len()
            .cmp(&a.replicas.len())
            .then_with(|| b.exec_binlog_coordinates.cmp(&a.exec_binlog_coordinates))
    });
}

impl RecoveryEngine {
    /// Six-tier search for a server to take over the already-promoted
    /// replica, when that improves on the promotion. Returns the chosen
    /// instance and whether action is required to put it on top.
    pub async fn suggest_replacement_for_promoted_replica(
        &self,
        recovery: &Arc<TopologyRecovery>,
        dead_instance_key: &InstanceKey,
        promoted: &Instance,
        candidate_hint: Option<&InstanceKey>,
    ) -> Result<(Instance, bool)> {
        let analysis = &recovery.analysis_entry;
        let candidate_replicas: Vec<Instance> = self
            .topology
            .read_cluster_candidate_instances(&promoted.cluster_name)
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|candidate| &candidate.key != dead_instance_key)
            .collect();
        let dead_instance = self
            .topology
            .read_instance(dead_instance_key)
            .await
            .ok()
            .flatten();

        self.audit(
            Some(recovery),
            "checking if should replace promoted replica with a better candidate",
        )
        .await;
        let mut candidate_key: Option<InstanceKey> = candidate_hint.cloned();

        // An explicit request for the promoted server itself is honored as-is.
        if candidate_key.as_ref() == Some(&promoted.key) {
            return Ok((promoted.clone(), false));
        }

        // Did we promote a candidate in the same DC & env as the dead instance? Ideal.
        if candidate_key.is_none() {
            self.audit(Some(recovery), "+ checking if promoted replica is the ideal candidate")
                .await;
            if let Some(dead) = &dead_instance {
                let promoted_is_ideal = candidate_replicas
                    .iter()
                    .any(|candidate| candidate.key == promoted.key)
                    && promoted.data_center == dead.data_center
                    && promoted.physical_environment == dead.physical_environment;
                if promoted_is_ideal {
                    self.audit(
                        Some(recovery),
                        format!("promoted replica {} is the ideal candidate", promoted.key),
                    )
                    .await;
                    return Ok((promoted.clone(), false));
                }
            }
        }

        // A candidate in the dead instance's DC & env beats the promotion.
        if candidate_key.is_none() {
            self.audit(Some(recovery), "+ searching for an ideal candidate").await;
            if let Some(dead) = &dead_instance {
                if let Some(candidate) = candidate_replicas.iter().find(|candidate| {
                    can_take_over_promoted_server_as_primary(&self.config, candidate, promoted)
                        && candidate.data_center == dead.data_center
                        && candidate.physical_environment == dead.physical_environment
                }) {
                    candidate_key = Some(candidate.key.clone());
                    self.audit(
                        Some(recovery),
                        format!(
                            "picking {} as candidate replacement, based on being in same DC & env as failed instance {}",
                            candidate.key, dead_instance_key
                        ),
                    )
                    .await;
                }
            }
        }

        // Maybe the promoted replica is an acceptable candidate after all.
        if candidate_key.is_none() {
            self.audit(Some(recovery), "+ checking if promoted replica is an OK candidate")
                .await;
            if candidate_replicas
                .iter()
                .any(|candidate| candidate.key == promoted.key)
            {
                match geographic_constraint_violation(&self.config, analysis, promoted) {
                    None => {
                        self.audit(
                            Some(recovery),
                            format!("promoted replica {} is a good candidate", promoted.key),
                        )
                        .await;
                        return Ok((promoted.clone(), false));
                    }
                    Some(reason) => {
                        self.audit(
                            Some(recovery),
                            format!("skipping {}; {}", promoted.key, reason),
                        )
                        .await;
                    }
                }
            }
        }

        // A candidate in the promoted replica's own DC & env, then any candidate.
        if candidate_key.is_none() {
            self.audit(Some(recovery), "+ searching for a candidate").await;
            if let Some(candidate) = candidate_replicas.iter().find(|candidate| {
                can_take_over_promoted_server_as_primary(&self.config, candidate, promoted)
                    && candidate.data_center == promoted.data_center
                    && candidate.physical_environment == promoted.physical_environment
            }) {
                candidate_key = Some(candidate.key.clone());
                self.audit(
                    Some(recovery),
                    format!(
                        "picking {} as candidate replacement, based on being in same DC & env as promoted instance {}",
                        candidate.key, promoted.key
                    ),
                )
                .await;
            }
        }
        if candidate_key.is_none() {
            for candidate in &candidate_replicas {
                if !can_take_over_promoted_server_as_primary(&self.config, candidate, promoted) {
                    continue;
                }
                match geographic_constraint_violation(&self.config, analysis, candidate) {
                    None => {
                        candidate_key = Some(candidate.key.clone());
                        self.audit(
                            Some(recovery),
                            format!("picking {} as candidate replacement", candidate.key),
                        )
                        .await;
                        break;
                    }
                    Some(reason) => {
                        self.audit(
                            Some(recovery),
                            format!("skipping {}; {}", candidate.key, reason),
                        )
                        .await;
                    }
                }
            }
        }

        // The promotion may be flawed enough to consider neutral servers too.
        let keep_searching_hint =
            match geographic_constraint_violation(&self.config, analysis, promoted) {
                Some(reason) => Some(format!("Will keep searching; {}", reason)),
                None if promoted.promotion_rule == PromotionRule::PreferNotPromote => Some(format!(
                    "Will keep searching because we have promoted a server with prefer_not rule: {}",
                    promoted.key
                )),
                None => None,
            };
        if let Some(hint) = keep_searching_hint {
            self.audit(Some(recovery), hint).await;
            let neutral_replicas = self
                .topology
                .read_cluster_neutral_promotion_rule_instances(&promoted.cluster_name)
                .await
                .unwrap_or_default();

            if candidate_key.is_none() {
                self.audit(
                    Some(recovery),
                    "+ searching for a neutral server to replace promoted server, in same DC and env as dead primary",
                )
                .await;
                if let Some(dead) = &dead_instance {
                    if let Some(neutral) = neutral_replicas.iter().find(|neutral| {
                        can_take_over_promoted_server_as_primary(&self.config, neutral, promoted)
                            && neutral.data_center == dead.data_center
                            && neutral.physical_environment == dead.physical_environment
                    }) {
                        candidate_key = Some(neutral.key.clone());
                    }
                }
            }
            if candidate_key.is_none() {
                self.audit(
                    Some(recovery),
                    "+ searching for a neutral server to replace promoted server, in same DC and env as promoted replica",
                )
                .await;
                if let Some(neutral) = neutral_replicas.iter().find(|neutral| {
                    can_take_over_promoted_server_as_primary(&self.config, neutral, promoted)
                        && neutral.data_center == promoted.data_center
                        && neutral.physical_environment == promoted.physical_environment
                }) {
                    candidate_key = Some(neutral.key.clone());
                }
            }
            if candidate_key.is_none() {
                self.audit(Some(recovery), "+ searching for a neutral server to replace a prefer_not")
                    .await;
                for neutral in &neutral_replicas {
                    if !can_take_over_promoted_server_as_primary(&self.config, neutral, promoted) {
                        continue;
                    }
                    match geographic_constraint_violation(&self.config, analysis, neutral) {
                        None => {
                            candidate_key = Some(neutral.key.clone());
                            break;
                        }
                        Some(reason) => {
                            self.audit(
                                Some(recovery),
                                format!("skipping {}; {}", neutral.key, reason),
                            )
                            .await;
                        }
                    }
                }
            }
        }

        let Some(candidate_key) = candidate_key else {
            self.audit(Some(recovery), "+ found no server to promote on top promoted replica")
                .await;
            return Ok((promoted.clone(), false));
        };
        if candidate_key == promoted.key {
            self.audit(
                Some(recovery),
                "+ sanity check: found our very own server to promote; doing nothing",
            )
            .await;
            return Ok((promoted.clone(), false));
        }
        // Action is required whether or not the chosen candidate reads back;
        // an unreadable candidate surfaces as an error for the caller to
        // log, which keeps the promoted replica in place.
        let replacement = self.topology.read_instance(&candidate_key).await?;
        replacement
            .map(|replacement| (replacement, true))
            .ok_or_else(|| {
                RecoveryError::NotFound(format!(
                    "suggested candidate {} could not be read",
                    candidate_key
                ))
            })
    }

    /// Chooses the best sibling of a dead intermediate primary to adopt its
    /// replicas: candidate in same DC & env, any candidate, any valid in same
    /// DC & env, then any valid sibling.
    pub async fn get_candidate_sibling_of_intermediate_primary(
        &self,
        recovery: &Arc<TopologyRecovery>,
        intermediate: &Instance,
    ) -> Result<Option<Instance>> {
        let mut siblings = self
            .topology
            .read_replica_instances(&intermediate.source_key)
            .await?;
        if siblings.len() <= 1 {
            self.audit(
                Some(recovery),
                format!("no siblings found for {}", intermediate.key),
            )
            .await;
            return Ok(None);
        }
        sort_siblings_by_subtree_size(&mut siblings);

        self.audit(
            Some(recovery),
            format!(
                "searching for the best candidate sibling of dead intermediate primary {}",
                intermediate.key
            ),
        )
        .await;

        let valid = |sibling: &&Instance| {
            is_valid_as_candidate_sibling_of_intermediate_primary(
                &self.config,
                intermediate,
                sibling,
            )
        };
        let same_dc_env = |sibling: &&Instance| {
            sibling.data_center == intermediate.data_center
                && sibling.physical_environment == intermediate.physical_environment
        };

        if let Some(sibling) = siblings
            .iter()
            .filter(valid)
            .find(|sibling| sibling.is_candidate && same_dc_env(sibling))
        {
            self.audit(
                Some(recovery),
                format!("found {} as the ideal candidate", sibling.key),
            )
            .await;
            return Ok(Some(sibling.clone()));
        }
        if let Some(sibling) = siblings.iter().filter(valid).find(|sibling| sibling.is_candidate) {
            self.audit(
                Some(recovery),
                format!("found {} as a replacement [candidate sibling]", sibling.key),
            )
            .await;
            return Ok(Some(sibling.clone()));
        }
        if let Some(sibling) = siblings.iter().filter(valid).find(same_dc_env) {
            self.audit(
                Some(recovery),
                format!("found {} as a replacement [same dc & environment]", sibling.key),
            )
            .await;
            return Ok(Some(sibling.clone()));
        }
        if let Some(sibling) = siblings.iter().find(valid) {
            self.audit(
                Some(recovery),
                format!("found {} as a replacement [any sibling]", sibling.key),
            )
            .await;
            return Ok(Some(sibling.clone()));
        }
        self.audit(
            Some(recovery),
            format!("cannot find candidate sibling of {}", intermediate.key),
        )
        .await;
        Ok(None)
    }
}
