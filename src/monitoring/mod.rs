// Monitoring and Observability Module
// Fixed-set metrics for the recovery engine

pub mod metrics;

// Re-export commonly used types
pub use metrics::{Counter, FlowCounters, Gauge, RecoveryMetrics};
