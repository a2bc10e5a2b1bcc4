/// Topology Module
///
/// Data model for observed database instances and the async trait seams
/// through which the recovery engine talks to its external collaborators.

pub mod instance;
pub mod service;

pub use instance::{BinlogCoordinates, Instance, InstanceKey, PromotionRule};
pub use service::{
    GtidHint, HookExecutor, IdealPromotionCheck, Journal, KvPair, KvStore, RegroupOutcome,
    RelocationOutcome, ShardLock, ShardLocker, TabletType, Topology,
};
