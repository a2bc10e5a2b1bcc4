/// Recovery Module
///
/// The failure-recovery engine: analysis classification, recovery
/// registration and deduplication, the reparenting flows, candidate
/// selection, postponed work, emergency coalescing and operator hooks.

pub mod analysis;
pub mod candidate;
pub mod cluster_ops;
pub mod co_primary;
pub mod dead_primary;
pub mod dispatcher;
pub mod emergency;
pub mod hooks;
pub mod intermediate;
pub mod postponed;
pub mod record;
pub mod registry;
pub mod takeover;

pub use analysis::{AnalysisCode, AnalysisEntry, AnalysisInstanceType, ClusterDetails};
pub use dispatcher::{RecoveryAttempt, RecoveryEngine, RecoveryEngineBuilder, RecoveryFunction};
pub use emergency::{EmergencyCoalescer, ExpiringSet};
pub use postponed::PostponedWork;
pub use record::{
    BlockedRecovery, PrimaryRecoveryKind, RecoveryAcknowledgement, RecoveryKind, RecoverySnapshot,
    RecoveryStep, TopologyRecovery,
};
pub use registry::RecoveryRegistry;
