/// Recovery Engine Configuration
///
/// All tunables consumed by the failure-recovery engine, with production
/// defaults. Geographic failover constraints, promotion override rules,
/// cooldown windows and operator hook lists all live here.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Refuse to promote a replica from a different data center than the failed primary
    pub prevent_cross_data_center_primary_failover: bool,
    /// Refuse to promote a replica from a different region than the failed primary
    pub prevent_cross_region_primary_failover: bool,
    /// After promotion, detach replicas that could not be repointed
    pub detach_lost_replicas_after_primary_failover: bool,
    /// Apply reset-replication / semi-sync / read-write on the promoted primary
    pub apply_mysql_promotion_after_primary_failover: bool,
    /// Fail the promotion when the promoted replica lags by at least this many minutes (0 disables)
    pub fail_primary_promotion_on_lag_minutes: u32,
    /// Fail the promotion when the promoted replica's SQL thread has unapplied relay logs
    pub fail_primary_promotion_if_sql_thread_not_up_to_date: bool,
    /// Block the promotion until the promoted replica's SQL thread catches up
    pub delay_primary_promotion_if_sql_thread_not_up_to_date: bool,
    /// In co-primary recovery, the surviving co-primary must be the promoted instance
    pub co_primary_recovery_must_promote_other_co_primary: bool,
    /// After promotion, detach the promoted instance's own primary-host pointer
    pub primary_failover_detach_replica_primary_host: bool,
    /// Extra attempts for reset-replication on the promoted primary
    pub reset_replication_retries: u32,
    /// Timeout for bulk stop-replication during primary election
    pub instance_bulk_operations_wait_timeout: Duration,
    /// Lag considered acceptable for maintenance-grade operations; also bounds catch-up waits
    pub reasonable_maintenance_replication_lag: Duration,
    /// Downtime placed on instances lost during a recovery
    pub lost_in_recovery_downtime: Duration,
    /// Cooldown after a recovery during which further recoveries on the cluster are blocked
    pub recovery_period_block: Duration,
    /// Cooldown during which repeated failure detections on an instance are not re-registered
    pub failure_detection_period_block: Duration,
    /// Hostname patterns never to be promoted (regex)
    pub promotion_ignore_hostname_filters: Vec<String>,
    /// KV prefix under which the cluster primary identity is published
    pub kv_cluster_primary_prefix: String,
    /// Hostname of this engine process, exposed to hooks
    pub hostname: String,

    // Operator hook command lists. Each command may use the documented
    // {placeholder} tokens and receives the ORC_* environment.
    pub pre_failover_processes: Vec<String>,
    pub pre_graceful_takeover_processes: Vec<String>,
    pub on_failure_detection_processes: Vec<String>,
    pub post_failover_processes: Vec<String>,
    pub post_unsuccessful_failover_processes: Vec<String>,
    pub post_primary_failover_processes: Vec<String>,
    pub post_intermediate_primary_failover_processes: Vec<String>,
    pub post_graceful_takeover_processes: Vec<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            prevent_cross_data_center_primary_failover: false,
            prevent_cross_region_primary_failover: false,
            detach_lost_replicas_after_primary_failover: true,
            apply_mysql_promotion_after_primary_failover: true,
            fail_primary_promotion_on_lag_minutes: 0,
            fail_primary_promotion_if_sql_thread_not_up_to_date: false,
            delay_primary_promotion_if_sql_thread_not_up_to_date: true,
            co_primary_recovery_must_promote_other_co_primary: true,
            primary_failover_detach_replica_primary_host: false,
            reset_replication_retries: 1,
            instance_bulk_operations_wait_timeout: Duration::from_secs(10),
            reasonable_maintenance_replication_lag: Duration::from_secs(20),
            lost_in_recovery_downtime: Duration::from_secs(1200),
            recovery_period_block: Duration::from_secs(3600),
            failure_detection_period_block: Duration::from_secs(3600),
            promotion_ignore_hostname_filters: Vec::new(),
            kv_cluster_primary_prefix: "mysql/primary".to_string(),
            hostname: "localhost".to_string(),
            pre_failover_processes: Vec::new(),
            pre_graceful_takeover_processes: Vec::new(),
            on_failure_detection_processes: Vec::new(),
            post_failover_processes: Vec::new(),
            post_unsuccessful_failover_processes: Vec::new(),
            post_primary_failover_processes: Vec::new(),
            post_intermediate_primary_failover_processes: Vec::new(),
            post_graceful_takeover_processes: Vec::new(),
        }
    }
}
