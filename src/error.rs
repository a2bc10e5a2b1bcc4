use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Registration denied: {0}")]
    RegistrationDenied(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Recovery step failed: {0}")]
    StepFailed(String),

    #[error("Promotion rule violated: {0}")]
    PromotionRuleViolated(String),

    #[error("Hook failed: {0}")]
    HookFailed(String),

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("KV error: {0}")]
    Kv(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for RecoveryError {
    fn from(e: serde_json::Error) -> Self {
        RecoveryError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RecoveryError>;
