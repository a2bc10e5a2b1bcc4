/// Topology Recovery Records
///
/// The unit of work and audit record of the engine: one `TopologyRecovery`
/// per registered recovery attempt, mutated only by the flow that owns the
/// registration and closed exactly once by resolution. Also the blocked-row
/// and audit-step records persisted through the journal.

use crate::error::RecoveryError;
use crate::recovery::analysis::{AnalysisCode, AnalysisEntry};
use crate::recovery::postponed::PostponedWork;
use crate::topology::instance::{Instance, InstanceKey};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

/// Which class of reparenting a recovery performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryKind {
    #[default]
    PrimaryRecovery,
    CoPrimaryRecovery,
    IntermediatePrimaryRecovery,
}

/// How a dead primary's replicas can be regrouped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrimaryRecoveryKind {
    #[default]
    NotPrimaryRecovery,
    Gtid,
    BinlogServer,
    Unknown,
}

/// Operator acknowledgement of a recovery or detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAcknowledgement {
    pub created_at: DateTime<Utc>,
    pub owner: String,
    pub comment: String,
}

impl RecoveryAcknowledgement {
    pub fn new(owner: impl Into<String>, comment: impl Into<String>) -> Self {
        Self {
            created_at: Utc::now(),
            owner: owner.into(),
            comment: comment.into(),
        }
    }

    pub fn internal() -> Self {
        Self::new("rusty-failover", "internal")
    }
}

/// A registration attempt denied because another recovery holds the slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedRecovery {
    pub failed_instance_key: InstanceKey,
    pub cluster_name: String,
    pub analysis: AnalysisCode,
    pub last_blocked_at: DateTime<Utc>,
    pub blocking_recovery_id: u64,
}

/// One audited step within a recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStep {
    pub recovery_uid: String,
    pub audit_at: DateTime<Utc>,
    pub message: String,
}

impl RecoveryStep {
    pub fn new(recovery_uid: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            recovery_uid: recovery_uid.into(),
            audit_at: Utc::now(),
            message: message.into(),
        }
    }
}

/// A registered recovery attempt: work in progress and, once resolved, the
/// durable audit record.
pub struct TopologyRecovery {
    pub id: u64,
    pub uid: String,
    pub analysis_entry: AnalysisEntry,
    kind: RwLock<RecoveryKind>,
    primary_recovery_kind: RwLock<PrimaryRecoveryKind>,
    successor: RwLock<Option<(InstanceKey, String)>>,
    is_active: AtomicBool,
    is_successful: AtomicBool,
    lost_replicas: RwLock<BTreeSet<InstanceKey>>,
    participating_instance_keys: RwLock<BTreeSet<InstanceKey>>,
    all_errors: RwLock<Vec<String>>,
    pub postponed: PostponedWork,
    pub started_at: DateTime<Utc>,
    ended_at: RwLock<Option<DateTime<Utc>>>,
    acknowledged: RwLock<Option<RecoveryAcknowledgement>>,
    pub last_detection_id: u64,
    pub related_recovery_id: u64,
}

impl std::fmt::Debug for TopologyRecovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyRecovery")
            .field("id", &self.id)
            .field("uid", &self.uid)
            .field("analysis", &self.analysis_entry.analysis)
            .field("is_active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl TopologyRecovery {
    pub fn new(id: u64, analysis_entry: AnalysisEntry) -> Self {
        Self {
            id,
            uid: uuid::Uuid::new_v4().to_string(),
            analysis_entry,
            kind: RwLock::new(RecoveryKind::PrimaryRecovery),
            primary_recovery_kind: RwLock::new(PrimaryRecoveryKind::NotPrimaryRecovery),
            successor: RwLock::new(None),
            is_active: AtomicBool::new(true),
            is_successful: AtomicBool::new(false),
            lost_replicas: RwLock::new(BTreeSet::new()),
            participating_instance_keys: RwLock::new(BTreeSet::new()),
            all_errors: RwLock::new(Vec::new()),
            postponed: PostponedWork::new(),
            started_at: Utc::now(),
            ended_at: RwLock::new(None),
            acknowledged: RwLock::new(None),
            last_detection_id: 0,
            related_recovery_id: 0,
        }
    }

    pub fn kind(&self) -> RecoveryKind {
        *self.kind.read()
    }

    pub fn set_kind(&self, kind: RecoveryKind) {
        *self.kind.write() = kind;
    }

    pub fn primary_recovery_kind(&self) -> PrimaryRecoveryKind {
        *self.primary_recovery_kind.read()
    }

    pub fn set_primary_recovery_kind(&self, kind: PrimaryRecoveryKind) {
        *self.primary_recovery_kind.write() = kind;
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }

    pub fn is_successful(&self) -> bool {
        self.is_successful.load(Ordering::SeqCst)
    }

    pub fn successor(&self) -> Option<(InstanceKey, String)> {
        self.successor.read().clone()
    }

    pub fn successor_key(&self) -> Option<InstanceKey> {
        self.successor.read().as_ref().map(|(key, _)| key.clone())
    }

    pub fn set_successor(&self, successor: Option<(InstanceKey, String)>) {
        *self.successor.write() = successor;
    }

    pub fn add_error(&self, err: &RecoveryError) {
        self.all_errors.write().push(err.to_string());
    }

    pub fn add_error_message(&self, message: impl Into<String>) {
        self.all_errors.write().push(message.into());
    }

    pub fn add_error_messages(&self, messages: &[String]) {
        self.all_errors.write().extend(messages.iter().cloned());
    }

    pub fn all_errors(&self) -> Vec<String> {
        self.all_errors.read().clone()
    }

    pub fn add_lost_replica(&self, key: &InstanceKey) {
        self.lost_replicas.write().insert(key.clone());
    }

    pub fn add_lost_replicas(&self, replicas: &[Instance]) {
        let mut lost = self.lost_replicas.write();
        for replica in replicas {
            lost.insert(replica.key.clone());
        }
    }

    pub fn lost_replicas(&self) -> BTreeSet<InstanceKey> {
        self.lost_replicas.read().clone()
    }

    pub fn add_participant(&self, key: &InstanceKey) {
        self.participating_instance_keys.write().insert(key.clone());
    }

    pub fn participating_instance_keys(&self) -> BTreeSet<InstanceKey> {
        self.participating_instance_keys.read().clone()
    }

    pub fn acknowledge(&self, ack: RecoveryAcknowledgement) {
        *self.acknowledged.write() = Some(ack);
    }

    pub fn acknowledged(&self) -> Option<RecoveryAcknowledgement> {
        self.acknowledged.read().clone()
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        *self.ended_at.read()
    }

    /// Closes the record. A successor makes the recovery successful; the
    /// successor can never be one of the lost replicas.
    pub fn close(&self, successor: Option<&Instance>) {
        if let Some(successor) = successor {
            self.lost_replicas.write().remove(&successor.key);
            self.set_successor(Some((
                successor.key.clone(),
                successor.instance_alias.clone(),
            )));
            self.is_successful.store(true, Ordering::SeqCst);
        }
        *self.ended_at.write() = Some(Utc::now());
        self.is_active.store(false, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> RecoverySnapshot {
        let successor = self.successor();
        RecoverySnapshot {
            id: self.id,
            uid: self.uid.clone(),
            analysis_entry: self.analysis_entry.clone(),
            kind: self.kind(),
            primary_recovery_kind: self.primary_recovery_kind(),
            successor_key: successor.as_ref().map(|(key, _)| key.clone()),
            successor_alias: successor.map(|(_, alias)| alias).unwrap_or_default(),
            is_active: self.is_active(),
            is_successful: self.is_successful(),
            lost_replicas: self.lost_replicas().into_iter().collect(),
            participating_instance_keys: self
                .participating_instance_keys()
                .into_iter()
                .collect(),
            all_errors: self.all_errors(),
            started_at: self.started_at,
            ended_at: self.ended_at(),
            acknowledged: self.acknowledged(),
            last_detection_id: self.last_detection_id,
            related_recovery_id: self.related_recovery_id,
        }
    }
}

/// Serializable point-in-time view of a recovery, as journaled and logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    pub id: u64,
    pub uid: String,
    pub analysis_entry: AnalysisEntry,
    pub kind: RecoveryKind,
    pub primary_recovery_kind: PrimaryRecoveryKind,
    pub successor_key: Option<InstanceKey>,
    pub successor_alias: String,
    pub is_active: bool,
    pub is_successful: bool,
    pub lost_replicas: Vec<InstanceKey>,
    pub participating_instance_keys: Vec<InstanceKey>,
    pub all_errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub acknowledged: Option<RecoveryAcknowledgement>,
    pub last_detection_id: u64,
    pub related_recovery_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::analysis::AnalysisCode;

    fn recovery() -> TopologyRecovery {
        TopologyRecovery::new(
            1,
            AnalysisEntry::new(AnalysisCode::DeadPrimary, InstanceKey::new("primary", 3306)),
        )
    }

    #[test]
    fn test_close_with_successor() {
        let recovery = recovery();
        assert!(recovery.is_active());

        let mut successor = Instance::new(InstanceKey::new("replica", 3306));
        successor.instance_alias = "replica-alias".to_string();
        recovery.close(Some(&successor));

        assert!(!recovery.is_active());
        assert!(recovery.is_successful());
        assert_eq!(
            recovery.successor_key(),
            Some(InstanceKey::new("replica", 3306))
        );
        assert!(recovery.ended_at().is_some());
    }

    #[test]
    fn test_successor_never_among_lost_replicas() {
        let recovery = recovery();
        let successor = Instance::new(InstanceKey::new("replica", 3306));
        recovery.add_lost_replica(&successor.key);
        recovery.add_lost_replica(&InstanceKey::new("other", 3306));

        recovery.close(Some(&successor));

        assert!(!recovery.lost_replicas().contains(&successor.key));
        assert_eq!(recovery.lost_replicas().len(), 1);
    }

    #[test]
    fn test_close_without_successor_is_unsuccessful() {
        let recovery = recovery();
        recovery.add_error(&RecoveryError::StepFailed("no candidate".to_string()));
        recovery.close(None);

        assert!(!recovery.is_successful());
        assert!(!recovery.is_active());
        assert_eq!(recovery.all_errors().len(), 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let recovery = recovery();
        recovery.add_participant(&InstanceKey::new("replica", 3306));
        let json = serde_json::to_string(&recovery.snapshot()).unwrap();
        assert!(json.contains("\"uid\""));
        assert!(json.contains("DeadPrimary"));
    }
}
