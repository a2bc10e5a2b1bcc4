/// Replication Analysis Model
///
/// Structured records describing a detected failure condition in a
/// replication topology. Entries are produced by an external analysis
/// service and consumed by the dispatcher; the engine never synthesizes
/// them except when forcing a recovery.

use crate::topology::instance::{BinlogCoordinates, InstanceKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Detected problem classes, as emitted by the analysis service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalysisCode {
    #[default]
    NoProblem,
    DeadPrimary,
    DeadPrimaryAndSomeReplicas,
    DeadPrimaryAndReplicas,
    UnreachablePrimary,
    UnreachablePrimaryWithLaggingReplicas,
    LockedSemiSyncPrimary,
    LockedSemiSyncPrimaryHypothesis,
    ClusterHasNoPrimary,
    PrimaryHasPrimary,
    PrimaryIsReadOnly,
    PrimarySemiSyncMustBeSet,
    PrimarySemiSyncMustNotBeSet,
    NotConnectedToPrimary,
    ConnectedToWrongPrimary,
    ReplicationStopped,
    ReplicaIsWritable,
    ReplicaSemiSyncMustBeSet,
    ReplicaSemiSyncMustNotBeSet,
    DeadIntermediatePrimary,
    DeadIntermediatePrimaryAndSomeReplicas,
    DeadIntermediatePrimaryAndReplicas,
    DeadIntermediatePrimaryWithSingleReplicaFailingToConnect,
    AllIntermediatePrimaryReplicasFailingToConnectOrDead,
    UnreachableIntermediatePrimaryWithLaggingReplicas,
    DeadCoPrimary,
    DeadCoPrimaryAndSomeReplicas,
    AllPrimaryReplicasNotReplicating,
    AllPrimaryReplicasNotReplicatingOrDead,
    FirstTierReplicaFailingToConnectToPrimary,
}

impl fmt::Display for AnalysisCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Role of the analyzed instance, derived from the entry flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisInstanceType {
    Primary,
    CoPrimary,
    IntermediatePrimary,
}

impl fmt::Display for AnalysisInstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisInstanceType::Primary => write!(f, "primary"),
            AnalysisInstanceType::CoPrimary => write!(f, "co-primary"),
            AnalysisInstanceType::IntermediatePrimary => write!(f, "intermediate-primary"),
        }
    }
}

/// Cluster-level facts carried on every analysis entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterDetails {
    pub cluster_name: String,
    pub cluster_alias: String,
    pub cluster_domain: String,
    pub has_automated_primary_recovery: bool,
    pub has_automated_intermediate_primary_recovery: bool,
}

/// One detected failure condition and the instances involved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisEntry {
    pub analysis: AnalysisCode,
    pub analyzed_instance_key: InstanceKey,
    pub analyzed_instance_primary_key: InstanceKey,
    pub analyzed_instance_data_center: String,
    pub analyzed_instance_physical_environment: String,
    pub analyzed_instance_region: String,
    pub analyzed_instance_binlog_coordinates: BinlogCoordinates,
    pub cluster_details: ClusterDetails,
    pub is_primary: bool,
    pub is_co_primary: bool,
    pub oracle_gtid_immediate_topology: bool,
    pub mariadb_gtid_immediate_topology: bool,
    pub binlog_server_immediate_topology: bool,
    pub count_replicas: u32,
    pub replicas: BTreeSet<InstanceKey>,
    pub description: String,
    pub command_hint: String,
    pub is_downtimed: bool,
    pub suggested_cluster_alias: String,
}

impl AnalysisEntry {
    pub fn new(analysis: AnalysisCode, analyzed_instance_key: InstanceKey) -> Self {
        Self {
            analysis,
            analyzed_instance_key,
            ..Default::default()
        }
    }

    pub fn instance_type(&self) -> AnalysisInstanceType {
        if self.is_co_primary {
            AnalysisInstanceType::CoPrimary
        } else if self.is_primary {
            AnalysisInstanceType::Primary
        } else {
            AnalysisInstanceType::IntermediatePrimary
        }
    }

    pub fn replicas_comma_delimited(&self) -> String {
        self.replicas
            .iter()
            .map(|key| key.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}
