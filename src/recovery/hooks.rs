/// Operator Hook Execution
///
/// Operator-supplied commands run at fixed points of a recovery. Templates
/// carry `{placeholder}` tokens substituted from the analysis and recovery
/// state; the same values are mirrored into the subprocess environment as
/// `ORC_*` variables. A trailing `&` marks a command fire-and-forget.

use crate::config::RecoveryConfig;
use crate::error::{RecoveryError, Result};
use crate::recovery::dispatcher::RecoveryEngine;
use crate::recovery::record::TopologyRecovery;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

fn lost_replicas_comma_delimited(recovery: &TopologyRecovery) -> String {
    recovery
        .lost_replicas()
        .iter()
        .map(|key| key.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Substitutes the agreed-upon placeholders with analysis and recovery data.
/// Returns the command and whether it should run fire-and-forget.
pub fn prepare_hook_command(
    config: &RecoveryConfig,
    command: &str,
    recovery: &TopologyRecovery,
) -> (String, bool) {
    let entry = &recovery.analysis_entry;
    let mut command = command.trim().to_string();
    let mut run_async = false;
    if command.ends_with('&') {
        command = command.trim_end_matches('&').trim_end().to_string();
        run_async = true;
    }

    let successor = recovery.successor();
    let replacements: Vec<(&str, String)> = vec![
        ("{failureType}", entry.analysis.to_string()),
        ("{instanceType}", entry.instance_type().to_string()),
        ("{isPrimary}", entry.is_primary.to_string()),
        ("{isCoPrimary}", entry.is_co_primary.to_string()),
        ("{failureDescription}", entry.description.clone()),
        ("{command}", entry.command_hint.clone()),
        ("{failedHost}", entry.analyzed_instance_key.hostname.clone()),
        ("{failedPort}", entry.analyzed_instance_key.port.to_string()),
        ("{failureCluster}", entry.cluster_details.cluster_name.clone()),
        ("{failureClusterAlias}", entry.cluster_details.cluster_alias.clone()),
        ("{failureClusterDomain}", entry.cluster_details.cluster_domain.clone()),
        ("{countReplicas}", entry.count_replicas.to_string()),
        ("{isDowntimed}", entry.is_downtimed.to_string()),
        (
            "{autoPrimaryRecovery}",
            entry.cluster_details.has_automated_primary_recovery.to_string(),
        ),
        (
            "{autoIntermediatePrimaryRecovery}",
            entry
                .cluster_details
                .has_automated_intermediate_primary_recovery
                .to_string(),
        ),
        ("{orchestratorHost}", config.hostname.clone()),
        ("{recoveryUID}", recovery.uid.clone()),
        ("{isSuccessful}", successor.is_some().to_string()),
        ("{lostReplicas}", lost_replicas_comma_delimited(recovery)),
        ("{countLostReplicas}", recovery.lost_replicas().len().to_string()),
        ("{replicaHosts}", entry.replicas_comma_delimited()),
    ];
    for (token, value) in &replacements {
        command = command.replace(token, value);
    }
    match &successor {
        Some((key, alias)) => {
            command = command.replace("{successorHost}", &key.hostname);
            command = command.replace("{successorPort}", &key.port.to_string());
            command = command.replace("{successorAlias}", alias);
        }
        None => {
            // No successor: host/port tokens stay visible to the operator,
            // the alias resolves to nothing.
            command = command.replace("{successorAlias}", "");
        }
    }

    (command, run_async)
}

/// Mirrors the placeholder values as `ORC_*` entries for the subprocess
/// environment. The hook executor appends these to its own environment.
pub fn build_hook_env(config: &RecoveryConfig, recovery: &TopologyRecovery) -> Vec<String> {
    let entry = &recovery.analysis_entry;
    let successor = recovery.successor();
    let mut env = vec![
        format!("ORC_FAILURE_TYPE={}", entry.analysis),
        format!("ORC_INSTANCE_TYPE={}", entry.instance_type()),
        format!("ORC_IS_PRIMARY={}", entry.is_primary),
        format!("ORC_IS_CO_PRIMARY={}", entry.is_co_primary),
        format!("ORC_FAILURE_DESCRIPTION={}", entry.description),
        format!("ORC_COMMAND={}", entry.command_hint),
        format!("ORC_FAILED_HOST={}", entry.analyzed_instance_key.hostname),
        format!("ORC_FAILED_PORT={}", entry.analyzed_instance_key.port),
        format!("ORC_FAILURE_CLUSTER={}", entry.cluster_details.cluster_name),
        format!("ORC_FAILURE_CLUSTER_ALIAS={}", entry.cluster_details.cluster_alias),
        format!("ORC_FAILURE_CLUSTER_DOMAIN={}", entry.cluster_details.cluster_domain),
        format!("ORC_COUNT_REPLICAS={}", entry.count_replicas),
        format!("ORC_IS_DOWNTIMED={}", entry.is_downtimed),
        format!(
            "ORC_AUTO_PRIMARY_RECOVERY={}",
            entry.cluster_details.has_automated_primary_recovery
        ),
        format!(
            "ORC_AUTO_INTERMEDIATE_PRIMARY_RECOVERY={}",
            entry.cluster_details.has_automated_intermediate_primary_recovery
        ),
        format!("ORC_ORCHESTRATOR_HOST={}", config.hostname),
        format!("ORC_IS_SUCCESSFUL={}", successor.is_some()),
        format!("ORC_LOST_REPLICAS={}", lost_replicas_comma_delimited(recovery)),
        format!("ORC_REPLICA_HOSTS={}", entry.replicas_comma_delimited()),
        format!("ORC_RECOVERY_UID={}", recovery.uid),
    ];
    if let Some((key, alias)) = successor {
        env.push(format!("ORC_SUCCESSOR_HOST={}", key.hostname));
        env.push(format!("ORC_SUCCESSOR_PORT={}", key.port));
        env.push(format!("ORC_SUCCESSOR_ALIAS={}", alias));
    }
    env
}

impl RecoveryEngine {
    async fn execute_hook(
        &self,
        command: &str,
        env: &[String],
        recovery: &Arc<TopologyRecovery>,
        full_description: &str,
    ) -> Result<()> {
        self.audit(
            Some(recovery),
            format!("Running {}: {}", full_description, command),
        )
        .await;
        let start = Instant::now();
        let result = self.hook_executor.command_run(command, env).await;
        let info = match &result {
            Ok(()) => format!("Completed {} in {:?}", full_description, start.elapsed()),
            Err(err) => {
                let info = format!(
                    "Execution of {} failed in {:?} with error: {}",
                    full_description,
                    start.elapsed(),
                    err
                );
                error!("{}", info);
                info
            }
        };
        self.audit(Some(recovery), info).await;
        result
    }

    /// Runs a hook list. Async hooks are launched fire-and-forget with errors
    /// ignored; a sync failure aborts the list when `fail_on_error`, otherwise
    /// the first error is remembered and execution continues.
    pub(crate) async fn run_hooks(
        self: &Arc<Self>,
        hooks: &[String],
        description: &str,
        recovery: &Arc<TopologyRecovery>,
        fail_on_error: bool,
    ) -> Result<()> {
        if hooks.is_empty() {
            self.audit(
                Some(recovery),
                format!("No {} hooks to run", description),
            )
            .await;
            return Ok(());
        }

        self.audit(
            Some(recovery),
            format!("Running {} {} hooks", hooks.len(), description),
        )
        .await;
        let mut first_error: Option<RecoveryError> = None;
        for (i, hook) in hooks.iter().enumerate() {
            let (command, run_async) = prepare_hook_command(&self.config, hook, recovery);
            let env = build_hook_env(&self.config, recovery);
            let full_description = if run_async {
                format!("{} hook {} of {} (async)", description, i + 1, hooks.len())
            } else {
                format!("{} hook {} of {}", description, i + 1, hooks.len())
            };

            if run_async {
                let engine = Arc::clone(self);
                let recovery = Arc::clone(recovery);
                tokio::spawn(async move {
                    // fire and forget; errors are audited, not propagated
                    let _ = engine
                        .execute_hook(&command, &env, &recovery, &full_description)
                        .await;
                });
            } else if let Err(err) = self
                .execute_hook(&command, &env, recovery, &full_description)
                .await
            {
                if fail_on_error {
                    self.audit(
                        Some(recovery),
                        format!("Not running further {} hooks", description),
                    )
                    .await;
                    return Err(err);
                }
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        self.audit(
            Some(recovery),
            format!("done running {} hooks", description),
        )
        .await;
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
