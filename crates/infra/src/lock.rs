//! Business-scoped pessimistic locks.
//!
//! A lock is identified by `(business_id, domain)` and lives as long as the
//! transaction that took it. Every stock write requires a [`StockLock`],
//! which can only be obtained by acquiring the stock lock on a transaction.

use serde::{Deserialize, Serialize};
use tracing::instrument;

use stockledger_core::{BusinessId, DomainError};

use crate::error::LedgerResult;
use crate::tx::LedgerTx;

/// Resource family a business lock protects.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockDomain {
    /// Stock Summary rows and everything derived from them.
    Stock,
}

impl LockDomain {
    pub fn as_str(self) -> &'static str {
        match self {
            LockDomain::Stock => "stockLock",
        }
    }
}

impl core::fmt::Display for LockDomain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Textual lock key, also hashed into the Postgres advisory-lock id.
pub fn lock_key(business_id: BusinessId, domain: LockDomain) -> String {
    format!("{business_id}:{}", domain.as_str())
}

/// Proof that the current transaction holds the stock lock of one business.
#[derive(Debug)]
pub struct StockLock {
    business_id: BusinessId,
}

impl StockLock {
    pub fn business_id(&self) -> BusinessId {
        self.business_id
    }

    /// Rejects use of the proof for another business's rows.
    pub fn check(&self, business_id: BusinessId) -> LedgerResult<()> {
        if self.business_id == business_id {
            Ok(())
        } else {
            Err(DomainError::invariant(format!(
                "stock lock held for business {} used for business {business_id}",
                self.business_id
            ))
            .into())
        }
    }
}

/// Take the stock lock; re-acquisition within the same transaction is a no-op.
#[instrument(skip(tx), fields(business_id = %business_id), err)]
pub async fn acquire_stock_lock(
    tx: &mut dyn LedgerTx,
    business_id: BusinessId,
) -> LedgerResult<StockLock> {
    tx.lock_business(business_id, LockDomain::Stock).await?;
    Ok(StockLock { business_id })
}
