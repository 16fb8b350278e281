//! Document numbering: `{prefix}{sequence:06}`.
//!
//! Sequences come from the transaction (per business and document type);
//! prefixes come from a [`PrefixProvider`] and are cached per branch.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use stockledger_core::{BranchId, BusinessId, DocumentType};

use crate::error::LedgerResult;
use crate::tx::LedgerTx;

/// Source of per-branch transaction number prefixes (branch settings).
#[async_trait::async_trait]
pub trait PrefixProvider: Send + Sync {
    async fn transaction_prefix(
        &self,
        business_id: BusinessId,
        branch_id: BranchId,
        document_type: DocumentType,
    ) -> LedgerResult<String>;
}

/// Uses [`DocumentType::default_prefix`] for every branch.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPrefixes;

#[async_trait::async_trait]
impl PrefixProvider for DefaultPrefixes {
    async fn transaction_prefix(
        &self,
        _business_id: BusinessId,
        _branch_id: BranchId,
        document_type: DocumentType,
    ) -> LedgerResult<String> {
        Ok(document_type.default_prefix().to_string())
    }
}

type PrefixKey = (BusinessId, BranchId, DocumentType);

pub struct Numbering {
    provider: Arc<dyn PrefixProvider>,
    cache: RwLock<HashMap<PrefixKey, String>>,
}

impl core::fmt::Debug for Numbering {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Numbering").finish_non_exhaustive()
    }
}

impl Default for Numbering {
    fn default() -> Self {
        Self::new(Arc::new(DefaultPrefixes))
    }
}

impl Numbering {
    pub fn new(provider: Arc<dyn PrefixProvider>) -> Self {
        Self {
            provider,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn prefix(
        &self,
        business_id: BusinessId,
        branch_id: BranchId,
        document_type: DocumentType,
    ) -> LedgerResult<String> {
        let key = (business_id, branch_id, document_type);
        if let Some(prefix) = self.cache.read().ok().and_then(|c| c.get(&key).cloned()) {
            return Ok(prefix);
        }

        let prefix = self
            .provider
            .transaction_prefix(business_id, branch_id, document_type)
            .await?;
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(key, prefix.clone());
        }
        Ok(prefix)
    }

    /// Drop cached prefixes of one branch after its settings change.
    pub fn invalidate(&self, business_id: BusinessId, branch_id: BranchId) {
        if let Ok(mut cache) = self.cache.write() {
            cache.retain(|(b, br, _), _| !(*b == business_id && *br == branch_id));
        }
    }

    /// Allocate the next `(sequence_no, document_number)` inside `tx`.
    pub async fn next_number(
        &self,
        tx: &mut dyn LedgerTx,
        business_id: BusinessId,
        branch_id: BranchId,
        document_type: DocumentType,
    ) -> LedgerResult<(i64, String)> {
        let sequence_no = tx.next_sequence(business_id, document_type).await?;
        let prefix = self.prefix(business_id, branch_id, document_type).await?;
        Ok((sequence_no, format_number(&prefix, sequence_no)))
    }
}

pub fn format_number(prefix: &str, sequence_no: i64) -> String {
    format!("{prefix}{sequence_no:06}")
}
