/// Recovery Dispatcher
///
/// Top-level entry of the engine: classifies an incoming analysis entry,
/// launches its emergent side effects, registers the failure detection,
/// invokes the selected recovery strategy, and closes out with post-failover
/// hooks and the postponed-work drain.

use crate::config::RecoveryConfig;
use crate::error::{RecoveryError, Result};
use crate::monitoring::metrics::RecoveryMetrics;
use crate::recovery::analysis::{AnalysisCode, AnalysisEntry};
use crate::recovery::emergency::EmergencyCoalescer;
use crate::recovery::record::TopologyRecovery;
use crate::recovery::registry::RecoveryRegistry;
use crate::topology::instance::InstanceKey;
use crate::topology::service::{HookExecutor, Journal, KvStore, ShardLocker, Topology};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Named recovery strategy selected for an analysis code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryFunction {
    RecoverDeadPrimary,
    RecoverLockedSemiSyncPrimary,
    ElectNewPrimary,
    FixClusterAndPrimary,
    FixPrimary,
    FixReplica,
    RecoverDeadIntermediatePrimary,
    RecoverDeadCoPrimary,
    RecoverGenericProblem,
}

/// Outcome of dispatching one analysis entry.
#[derive(Debug)]
pub struct RecoveryAttempt {
    pub attempted: bool,
    pub recovery: Option<Arc<TopologyRecovery>>,
    pub error: Option<RecoveryError>,
}

impl RecoveryAttempt {
    pub(crate) fn skipped() -> Self {
        Self {
            attempted: false,
            recovery: None,
            error: None,
        }
    }

    pub(crate) fn failed(error: RecoveryError) -> Self {
        Self {
            attempted: false,
            recovery: None,
            error: Some(error),
        }
    }

    pub(crate) fn aborted(recovery: Arc<TopologyRecovery>, error: RecoveryError) -> Self {
        Self {
            attempted: false,
            recovery: Some(recovery),
            error: Some(error),
        }
    }

    pub(crate) fn aborted_ok(recovery: Arc<TopologyRecovery>) -> Self {
        Self {
            attempted: false,
            recovery: Some(recovery),
            error: None,
        }
    }

    pub fn successor_key(&self) -> Option<InstanceKey> {
        self.recovery.as_ref().and_then(|recovery| recovery.successor_key())
    }
}

/// The automated failure-recovery engine. Holds the collaborator services,
/// the registration registry, the emergency caches and the metrics; all
/// recovery flows are methods on this type.
pub struct RecoveryEngine {
    pub(crate) topology: Arc<dyn Topology>,
    pub(crate) locker: Arc<dyn ShardLocker>,
    pub(crate) kv: Arc<dyn KvStore>,
    pub(crate) hook_executor: Arc<dyn HookExecutor>,
    pub(crate) config: Arc<RecoveryConfig>,
    pub(crate) registry: RecoveryRegistry,
    pub(crate) emergency: EmergencyCoalescer,
    pub(crate) metrics: RecoveryMetrics,
    pending_recoveries: AtomicI64,
    recovery_disabled: AtomicBool,
}

struct PendingRecoveryGuard<'a>(&'a AtomicI64);

impl Drop for PendingRecoveryGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RecoveryEngine {
    pub fn builder() -> RecoveryEngineBuilder {
        RecoveryEngineBuilder::new()
    }

    pub fn registry(&self) -> &RecoveryRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &RecoveryMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn pending_recoveries(&self) -> i64 {
        self.pending_recoveries.load(Ordering::SeqCst)
    }

    /// Globally disables (or re-enables) automated recovery. Forced
    /// recoveries override the disable.
    pub fn set_recovery_disabled(&self, disabled: bool) {
        self.recovery_disabled.store(disabled, Ordering::SeqCst);
    }

    pub fn is_recovery_disabled(&self) -> bool {
        self.recovery_disabled.load(Ordering::SeqCst)
    }

    /// Starts the cache sweepers and the pending-recoveries gauge sampler.
    pub fn start_background_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = self.emergency.start_sweepers();
        let engine = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            loop {
                ticker.tick().await;
                engine.metrics.pending.set(engine.pending_recoveries());
            }
        }));
        handles
    }

    pub(crate) async fn audit(
        &self,
        recovery: Option<&Arc<TopologyRecovery>>,
        message: impl AsRef<str>,
    ) {
        let recovery = recovery.map(|recovery| recovery.as_ref());
        if let Err(err) = self.registry.audit_step(recovery, message.as_ref()).await {
            warn!("failed writing recovery step: {}", err);
        }
    }

    /// Resolves the recovery strategy and actionability for an analysis code,
    /// honoring the emergency-operation grace window.
    pub fn dispatch(
        &self,
        analysis_code: AnalysisCode,
        analyzed_key: &InstanceKey,
    ) -> Option<(RecoveryFunction, bool)> {
        use AnalysisCode::*;
        match analysis_code {
            // primary
            DeadPrimary | DeadPrimaryAndSomeReplicas => {
                if self.is_in_emergency_operation_graceful_period(analyzed_key) {
                    Some((RecoveryFunction::RecoverGenericProblem, false))
                } else {
                    Some((RecoveryFunction::RecoverDeadPrimary, true))
                }
            }
            LockedSemiSyncPrimary => {
                if self.is_in_emergency_operation_graceful_period(analyzed_key) {
                    Some((RecoveryFunction::RecoverGenericProblem, false))
                } else {
                    Some((RecoveryFunction::RecoverLockedSemiSyncPrimary, true))
                }
            }
            // topo
            ClusterHasNoPrimary => Some((RecoveryFunction::ElectNewPrimary, true)),
            PrimaryHasPrimary => Some((RecoveryFunction::FixClusterAndPrimary, true)),
            PrimaryIsReadOnly | PrimarySemiSyncMustBeSet | PrimarySemiSyncMustNotBeSet => {
                Some((RecoveryFunction::FixPrimary, true))
            }
            NotConnectedToPrimary | ConnectedToWrongPrimary | ReplicationStopped
            | ReplicaIsWritable | ReplicaSemiSyncMustBeSet | ReplicaSemiSyncMustNotBeSet => {
                Some((RecoveryFunction::FixReplica, false))
            }
            // intermediate primary
            DeadIntermediatePrimary
            | DeadIntermediatePrimaryAndSomeReplicas
            | DeadIntermediatePrimaryWithSingleReplicaFailingToConnect
            | AllIntermediatePrimaryReplicasFailingToConnectOrDead => {
                Some((RecoveryFunction::RecoverDeadIntermediatePrimary, true))
            }
            DeadIntermediatePrimaryAndReplicas => {
                Some((RecoveryFunction::RecoverGenericProblem, false))
            }
            // co-primary
            DeadCoPrimary | DeadCoPrimaryAndSomeReplicas => {
                Some((RecoveryFunction::RecoverDeadCoPrimary, true))
            }
            // primary, non actionable
            DeadPrimaryAndReplicas
            | UnreachablePrimary
            | UnreachablePrimaryWithLaggingReplicas
            | AllPrimaryReplicasNotReplicating
            | AllPrimaryReplicasNotReplicatingOrDead
            | UnreachableIntermediatePrimaryWithLaggingReplicas => {
                Some((RecoveryFunction::RecoverGenericProblem, false))
            }
            LockedSemiSyncPrimaryHypothesis
            | FirstTierReplicaFailingToConnectToPrimary
            | NoProblem => None,
        }
    }

    /// Fire-and-forget emergent side effects for the analysis code.
    pub(crate) fn run_emergent_operations(self: &Arc<Self>, analysis: &AnalysisEntry) {
        use AnalysisCode::*;
        let engine = Arc::clone(self);
        let analysis = analysis.clone();
        tokio::spawn(async move {
            let code = analysis.analysis;
            match code {
                DeadPrimaryAndReplicas => {
                    engine
                        .emergently_read_topology_instance(
                            &analysis.analyzed_instance_primary_key,
                            code,
                        )
                        .await;
                }
                UnreachablePrimary => {
                    engine
                        .emergently_read_topology_instance(&analysis.analyzed_instance_key, code)
                        .await;
                    engine
                        .emergently_read_topology_instance_replicas(
                            &analysis.analyzed_instance_key,
                            code,
                        )
                        .await;
                }
                UnreachablePrimaryWithLaggingReplicas
                | UnreachableIntermediatePrimaryWithLaggingReplicas => {
                    engine
                        .emergently_restart_replication_on_replicas(
                            &analysis.analyzed_instance_key,
                            code,
                        )
                        .await;
                }
                LockedSemiSyncPrimaryHypothesis => {
                    engine
                        .emergently_read_topology_instance(&analysis.analyzed_instance_key, code)
                        .await;
                    engine
                        .emergently_record_stale_binlog_coordinates(
                            &analysis.analyzed_instance_key,
                            &analysis.analyzed_instance_binlog_coordinates,
                        )
                        .await;
                }
                AllPrimaryReplicasNotReplicating | AllPrimaryReplicasNotReplicatingOrDead => {
                    engine
                        .emergently_read_topology_instance(&analysis.analyzed_instance_key, code)
                        .await;
                }
                FirstTierReplicaFailingToConnectToPrimary => {
                    engine
                        .emergently_read_topology_instance(
                            &analysis.analyzed_instance_primary_key,
                            code,
                        )
                        .await;
                }
                _ => {}
            }
        });
    }

    /// Registers the failure detection (once per cooldown) and runs the
    /// on-detection hooks.
    async fn check_and_execute_failure_detection_processes(
        self: &Arc<Self>,
        analysis: &AnalysisEntry,
        skip_hooks: bool,
    ) -> Result<(bool, bool)> {
        if !self.registry.register_detection(analysis).await? {
            return Ok((false, false));
        }
        info!(
            "topology_recovery: detected {} failure on {}",
            analysis.analysis, analysis.analyzed_instance_key
        );
        if skip_hooks {
            return Ok((true, false));
        }
        let hook_recovery = Arc::new(TopologyRecovery::new(0, analysis.clone()));
        self.run_hooks(
            &self.config.on_failure_detection_processes,
            "OnFailureDetectionProcesses",
            &hook_recovery,
            true,
        )
        .await?;
        Ok((true, true))
    }

    /// Main entry point: dispatches one analysis entry through detection,
    /// recovery, post-failover hooks and postponed-work drain.
    pub async fn handle_analysis(
        self: &Arc<Self>,
        analysis: AnalysisEntry,
        candidate_hint: Option<&InstanceKey>,
        force: bool,
        skip_hooks: bool,
    ) -> RecoveryAttempt {
        self.pending_recoveries.fetch_add(1, Ordering::SeqCst);
        let _guard = PendingRecoveryGuard(&self.pending_recoveries);

        let Some((function, is_actionable)) =
            self.dispatch(analysis.analysis, &analysis.analyzed_instance_key)
        else {
            if analysis.analysis != AnalysisCode::NoProblem {
                warn!(
                    "ignoring analysis that has no action plan: {}; key: {}",
                    analysis.analysis, analysis.analyzed_instance_key
                );
            }
            self.run_emergent_operations(&analysis);
            return RecoveryAttempt::skipped();
        };
        self.run_emergent_operations(&analysis);

        if is_actionable {
            info!(
                "proceeding with {} detection on {}; actionable: {}, skip_hooks: {}",
                analysis.analysis, analysis.analyzed_instance_key, is_actionable, skip_hooks
            );
        }
        if let Err(err) = self
            .check_and_execute_failure_detection_processes(&analysis, skip_hooks)
            .await
        {
            error!("error on failure detection: {}", err);
            return RecoveryAttempt::failed(err);
        }
        // Detection may have been silenced by a previous one; all that
        // matters is that it did not error.

        if self.is_recovery_disabled() {
            if !force {
                info!(
                    "NOT recovering {} (recovery disabled globally)",
                    analysis.analyzed_instance_key
                );
                return RecoveryAttempt::skipped();
            }
            info!(
                "recoveries disabled globally but forcing recovery of {}",
                analysis.analyzed_instance_key
            );
        }

        let attempt = match function {
            RecoveryFunction::RecoverDeadPrimary => {
                self.check_and_recover_dead_primary(&analysis, candidate_hint, force, skip_hooks)
                    .await
            }
            RecoveryFunction::RecoverLockedSemiSyncPrimary => {
                self.check_and_recover_locked_semi_sync_primary(&analysis).await
            }
            RecoveryFunction::ElectNewPrimary => self.elect_new_primary(&analysis).await,
            RecoveryFunction::FixClusterAndPrimary => {
                self.fix_cluster_and_primary(&analysis, skip_hooks).await
            }
            RecoveryFunction::FixPrimary => self.fix_primary(&analysis).await,
            RecoveryFunction::FixReplica => self.fix_replica(&analysis).await,
            RecoveryFunction::RecoverDeadIntermediatePrimary => {
                self.check_and_recover_dead_intermediate_primary(&analysis, force, skip_hooks)
                    .await
            }
            RecoveryFunction::RecoverDeadCoPrimary => {
                self.check_and_recover_dead_co_primary(&analysis, force, skip_hooks).await
            }
            RecoveryFunction::RecoverGenericProblem => {
                self.check_and_recover_generic_problem().await
            }
        };

        if !attempt.attempted {
            return attempt;
        }
        let Some(recovery) = attempt.recovery.as_ref() else {
            return attempt;
        };
        match serde_json::to_string(&recovery.snapshot()) {
            Ok(serialized) => info!("Topology recovery: {}", serialized),
            Err(_) => info!("Topology recovery: {:?}", recovery),
        }

        if !skip_hooks {
            match recovery.successor_key() {
                None => {
                    let _ = self
                        .run_hooks(
                            &self.config.post_unsuccessful_failover_processes,
                            "PostUnsuccessfulFailoverProcesses",
                            recovery,
                            false,
                        )
                        .await;
                }
                Some(successor_key) => {
                    let _ = self.topology.end_downtime(&successor_key).await;
                    let _ = self
                        .run_hooks(
                            &self.config.post_failover_processes,
                            "PostFailoverProcesses",
                            recovery,
                            false,
                        )
                        .await;
                }
            }
        }

        self.audit(
            Some(recovery),
            format!("Waiting for {} postponed functions", recovery.postponed.len()),
        )
        .await;
        recovery.postponed.drain().await;
        self.audit(
            Some(recovery),
            format!("Executed {} postponed functions", recovery.postponed.len()),
        )
        .await;
        if !recovery.postponed.is_empty() {
            self.audit(
                Some(recovery),
                format!(
                    "Executed postponed functions: {}",
                    recovery.postponed.executed_descriptions().join(", ")
                ),
            )
            .await;
        }
        attempt
    }
}

impl std::fmt::Debug for RecoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryEngine")
            .field("pending_recoveries", &self.pending_recoveries())
            .field("recovery_disabled", &self.is_recovery_disabled())
            .finish_non_exhaustive()
    }
}

/// Builder wiring the engine to its collaborator services.
#[derive(Default)]
pub struct RecoveryEngineBuilder {
    topology: Option<Arc<dyn Topology>>,
    locker: Option<Arc<dyn ShardLocker>>,
    journal: Option<Arc<dyn Journal>>,
    kv: Option<Arc<dyn KvStore>>,
    hook_executor: Option<Arc<dyn HookExecutor>>,
    config: RecoveryConfig,
}

impl RecoveryEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topology(mut self, topology: Arc<dyn Topology>) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn with_locker(mut self, locker: Arc<dyn ShardLocker>) -> Self {
        self.locker = Some(locker);
        self
    }

    pub fn with_journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_kv_store(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn with_hook_executor(mut self, hook_executor: Arc<dyn HookExecutor>) -> Self {
        self.hook_executor = Some(hook_executor);
        self
    }

    pub fn with_config(mut self, config: RecoveryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Arc<RecoveryEngine>> {
        let missing = |component: &str| {
            RecoveryError::InvalidInput(format!("{} service not configured", component))
        };
        let topology = self.topology.ok_or_else(|| missing("topology"))?;
        let locker = self.locker.ok_or_else(|| missing("shard locker"))?;
        let journal = self.journal.ok_or_else(|| missing("journal"))?;
        let kv = self.kv.ok_or_else(|| missing("kv store"))?;
        let hook_executor = self.hook_executor.ok_or_else(|| missing("hook executor"))?;
        let config = Arc::new(self.config);

        let registry = RecoveryRegistry::new(Arc::clone(&journal), Arc::clone(&config));

        Ok(Arc::new(RecoveryEngine {
            topology,
            locker,
            kv,
            hook_executor,
            config,
            registry,
            emergency: EmergencyCoalescer::new(),
            metrics: RecoveryMetrics::new(),
            pending_recoveries: AtomicI64::new(0),
            recovery_disabled: AtomicBool::new(false),
        }))
    }
}
