/// Instance Model
///
/// Types describing observed database instances in a replicated topology:
/// instance identity, binlog coordinates, promotion rules and the full
/// observed record read from the topology inventory. The engine never
/// mutates these; they are snapshots owned by the inventory service.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Instance identity: `(hostname, port)`. Equality is structural.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub hostname: String,
    pub port: u16,
}

impl InstanceKey {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    /// A key with an empty hostname denotes "no instance"
    pub fn is_valid(&self) -> bool {
        !self.hostname.is_empty() && self.port != 0
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// Binary log position `(logFile, logPosition)` with strict lexicographic ordering.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BinlogCoordinates {
    pub log_file: String,
    pub log_pos: u64,
}

impl BinlogCoordinates {
    pub fn new(log_file: impl Into<String>, log_pos: u64) -> Self {
        Self {
            log_file: log_file.into(),
            log_pos,
        }
    }

    pub fn smaller_than(&self, other: &BinlogCoordinates) -> bool {
        self < other
    }
}

impl fmt::Display for BinlogCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_file, self.log_pos)
    }
}

/// Promotion preference declared on an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromotionRule {
    MustPromote,
    PreferPromote,
    #[default]
    Neutral,
    PreferNotPromote,
    MustNotPromote,
}

/// Observed record of a database node, read from the topology inventory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Instance {
    pub key: InstanceKey,
    /// Upstream source; invalid key when this instance is a primary
    pub source_key: InstanceKey,
    pub cluster_name: String,
    pub instance_alias: String,
    pub data_center: String,
    pub physical_environment: String,
    pub region: String,
    pub promotion_rule: PromotionRule,
    pub is_candidate: bool,
    pub log_bin_enabled: bool,
    pub log_replication_updates_enabled: bool,
    pub is_binlog_server: bool,
    pub replica_running: bool,
    pub is_last_check_valid: bool,
    pub sql_thread_up_to_date: bool,
    pub has_replication_filters: bool,
    pub read_only: bool,
    pub is_downtimed: bool,
    pub replication_lag_seconds: Option<u64>,
    pub exec_binlog_coordinates: BinlogCoordinates,
    pub self_binlog_coordinates: BinlogCoordinates,
    pub replicas: BTreeSet<InstanceKey>,
}

impl Instance {
    pub fn new(key: InstanceKey) -> Self {
        Self {
            key,
            is_last_check_valid: true,
            ..Default::default()
        }
    }

    /// Whether `self` is able to start replicating from `source`.
    /// Both instances must be binlog-capable and distinct; a replica source
    /// must also log its applied updates.
    pub fn can_replicate_from(&self, source: &Instance) -> bool {
        if self.key == source.key {
            return false;
        }
        if !source.log_bin_enabled {
            return false;
        }
        if source.source_key.is_valid() && !source.log_replication_updates_enabled {
            return false;
        }
        true
    }

    pub fn has_reasonable_maintenance_replication_lag(&self, reasonable: Duration) -> bool {
        match self.replication_lag_seconds {
            Some(lag) => u128::from(lag) * 1000 <= reasonable.as_millis(),
            None => false,
        }
    }
}
