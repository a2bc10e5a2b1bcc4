// RustyFailover - Automated failure-recovery engine for replicated database topologies
// Core library module

pub mod config;
pub mod error;
pub mod monitoring;
pub mod recovery;
pub mod topology;

pub use config::RecoveryConfig;
pub use error::{RecoveryError, Result};
pub use recovery::{
    AnalysisCode, AnalysisEntry, RecoveryAttempt, RecoveryEngine, RecoveryEngineBuilder,
};
pub use topology::{Instance, InstanceKey};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
