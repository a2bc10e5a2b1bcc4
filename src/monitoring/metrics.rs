/// Recovery Metrics
///
/// The engine exposes a small, closed set of failover metrics: one
/// start/success/fail counter triple per recovery class, plus a gauge of
/// recoveries currently in flight. The set is fixed at compile time —
/// metrics are plain fields, not a dynamic registry — and knows how to
/// render itself in Prometheus text format.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Monotonic event counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Sampled value that can go up and down.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// The counter triple every recovery class reports.
#[derive(Debug, Default)]
pub struct FlowCounters {
    pub start: Counter,
    pub success: Counter,
    pub fail: Counter,
}

impl FlowCounters {
    fn phases(&self) -> [(&'static str, &'static str, &Counter); 3] {
        [
            ("start", "started", &self.start),
            ("success", "succeeded", &self.success),
            ("fail", "failed", &self.fail),
        ]
    }
}

/// All metrics the recovery engine exposes.
#[derive(Debug, Default)]
pub struct RecoveryMetrics {
    pub dead_primary: FlowCounters,
    pub dead_intermediate_primary: FlowCounters,
    pub dead_co_primary: FlowCounters,
    pub pending: Gauge,
}

impl RecoveryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn flows(&self) -> [(&'static str, &FlowCounters); 3] {
        [
            ("dead_primary", &self.dead_primary),
            ("dead_intermediate_primary", &self.dead_intermediate_primary),
            ("dead_co_primary", &self.dead_co_primary),
        ]
    }

    /// Current values under their canonical dotted names.
    pub fn samples(&self) -> Vec<(String, i64)> {
        let mut samples = Vec::new();
        for (flow, counters) in self.flows() {
            for (phase, _, counter) in counters.phases() {
                samples.push((format!("recover.{}.{}", flow, phase), counter.get() as i64));
            }
        }
        samples.push(("recover.pending".to_string(), self.pending.get()));
        samples
    }

    /// Prometheus text exposition of the fixed metric set.
    pub fn expose_prometheus(&self) -> String {
        let mut output = String::new();
        for (flow, counters) in self.flows() {
            for (phase, verb, counter) in counters.phases() {
                let name = format!("recover_{}_{}", flow, phase);
                output.push_str(&format!("# HELP {} {} recoveries {}\n", name, flow, verb));
                output.push_str(&format!("# TYPE {} counter\n", name));
                output.push_str(&format!("{} {}\n", name, counter.get()));
            }
        }
        output.push_str("# HELP recover_pending recoveries currently in flight\n");
        output.push_str("# TYPE recover_pending gauge\n");
        output.push_str(&format!("recover_pending {}\n", self.pending.get()));
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);

        counter.inc();
        counter.inc();
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new();
        gauge.set(7);
        assert_eq!(gauge.get(), 7);
        gauge.set(-1);
        assert_eq!(gauge.get(), -1);
    }

    #[test]
    fn test_samples_cover_the_fixed_set() {
        let metrics = RecoveryMetrics::new();
        metrics.dead_primary.start.inc();
        metrics.pending.set(2);

        let samples = metrics.samples();
        assert_eq!(samples.len(), 10);
        assert!(samples.contains(&("recover.dead_primary.start".to_string(), 1)));
        assert!(samples.contains(&("recover.dead_co_primary.fail".to_string(), 0)));
        assert!(samples.contains(&("recover.pending".to_string(), 2)));
    }

    #[test]
    fn test_prometheus_exposition() {
        let metrics = RecoveryMetrics::new();
        metrics.dead_primary.start.inc();
        metrics.dead_primary.start.inc();
        metrics.dead_primary.start.inc();

        let output = metrics.expose_prometheus();
        assert!(output.contains("# TYPE recover_dead_primary_start counter"));
        assert!(output.contains("recover_dead_primary_start 3"));
        assert!(output.contains("# TYPE recover_pending gauge"));
        assert!(output.contains("recover_pending 0"));
    }
}
