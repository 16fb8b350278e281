//! Transactions: the only way the ledger touches storage.
//!
//! Every operation opens one [`LedgerTx`] through [`Database::begin`], passes
//! it explicitly to each collaborator and finishes with `commit`. Dropping a
//! transaction without committing rolls it back.

mod in_memory;
mod postgres;

pub use in_memory::InMemoryDatabase;
pub use postgres::{PgDatabase, PgLedgerTx};

use std::time::Duration;

use stockledger_core::{BusinessId, DocumentId, DocumentType, ExpectedVersion};
use stockledger_events::OutboxRecord;
use stockledger_inventory::{StockKey, StockSummary};

use crate::error::LedgerResult;
use crate::lock::LockDomain;
use crate::repository::Attachment;

/// Untyped document row as persisted (`documents` table).
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRow {
    pub id: DocumentId,
    pub business_id: BusinessId,
    pub document_type: DocumentType,
    pub status: String,
    pub body: serde_json::Value,
    pub attachments: Vec<Attachment>,
    pub version: u64,
}

/// Connection-level entry point.
#[async_trait::async_trait]
pub trait Database: Send + Sync {
    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTx>>;

    /// Move up to `limit` due outbox records to `Processing` and return them.
    ///
    /// Due means pending, failed with an elapsed retry time, or processing
    /// under a claim older than `lease`.
    async fn claim_outbox_batch(
        &self,
        limit: usize,
        lease: Duration,
    ) -> LedgerResult<Vec<OutboxRecord>>;

    /// Persist the delivery outcome of a claimed record.
    async fn complete_outbox(&self, record: &OutboxRecord) -> LedgerResult<()>;
}

/// One open transaction.
///
/// Reads observe the transaction's own uncommitted writes. Versioned writes
/// fail with `LedgerError::Conflict` when the stored version is not the
/// expected one.
#[async_trait::async_trait]
pub trait LedgerTx: Send {
    /// Block until `(business_id, domain)` is held by this transaction.
    ///
    /// Idempotent within a transaction; bounded by the configured lock timeout.
    async fn lock_business(&mut self, business_id: BusinessId, domain: LockDomain)
        -> LedgerResult<()>;

    fn holds_lock(&self, business_id: BusinessId, domain: LockDomain) -> bool;

    async fn stock_summary(&mut self, key: &StockKey) -> LedgerResult<Option<StockSummary>>;

    /// Upsert a row; `expected` is checked against the stored version (0 when absent).
    async fn put_stock_summary(
        &mut self,
        row: &StockSummary,
        expected: ExpectedVersion,
    ) -> LedgerResult<()>;

    async fn document(
        &mut self,
        business_id: BusinessId,
        id: DocumentId,
    ) -> LedgerResult<Option<DocumentRow>>;

    async fn put_document(&mut self, row: &DocumentRow, expected: ExpectedVersion)
        -> LedgerResult<()>;

    async fn remove_document(
        &mut self,
        business_id: BusinessId,
        id: DocumentId,
        expected: ExpectedVersion,
    ) -> LedgerResult<()>;

    /// Next per-business, per-type document sequence number (starting at 1).
    async fn next_sequence(
        &mut self,
        business_id: BusinessId,
        document_type: DocumentType,
    ) -> LedgerResult<i64>;

    async fn append_outbox(&mut self, record: &OutboxRecord) -> LedgerResult<()>;

    async fn commit(self: Box<Self>) -> LedgerResult<()>;

    async fn rollback(self: Box<Self>) -> LedgerResult<()>;
}
