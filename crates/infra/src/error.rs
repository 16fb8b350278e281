//! Infrastructure error model.
//!
//! Wraps domain failures and adds the ones only IO can produce: lock
//! timeouts, lost optimistic races, database and serialization errors.

use thiserror::Error;

use stockledger_core::{BusinessId, DomainError};

use crate::lock::LockDomain;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("timed out waiting for {domain} of business {business_id}")]
    LockTimeout {
        business_id: BusinessId,
        domain: LockDomain,
    },

    /// A versioned write lost a race with another writer.
    #[error("concurrent modification: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl LedgerError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Whether re-running the whole operation in a fresh transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::LockTimeout { .. } | LedgerError::Conflict(_) => true,
            LedgerError::Domain(DomainError::Conflict(_)) => true,
            LedgerError::Database(sqlx::Error::Database(db_err)) => matches!(
                db_err.code().as_deref(),
                // serialization_failure, deadlock_detected
                Some("40001") | Some("40P01")
            ),
            _ => false,
        }
    }
}
