//! In-memory database for tests/dev.
//!
//! Transactions stage their writes and publish them atomically on commit.
//! Business locks are per-key `tokio::sync::Mutex`es, which queue waiters
//! in FIFO order; the owned guard lives in the transaction until it ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use stockledger_core::{BusinessId, DocumentId, DocumentType, DomainError, ExpectedVersion};
use stockledger_events::{OutboxRecord, PublishStatus};
use stockledger_inventory::{StockKey, StockSummary};

use super::{Database, DocumentRow, LedgerTx};
use crate::error::{LedgerError, LedgerResult};
use crate::lock::LockDomain;

type LockTable = HashMap<(BusinessId, LockDomain), Arc<tokio::sync::Mutex<()>>>;

#[derive(Debug, Default)]
struct State {
    stock: HashMap<StockKey, StockSummary>,
    documents: HashMap<(BusinessId, DocumentId), DocumentRow>,
    sequences: HashMap<(BusinessId, DocumentType), i64>,
    outbox: Vec<OutboxRecord>,
}

/// Shared in-memory storage; cheap to clone.
#[derive(Debug, Clone)]
pub struct InMemoryDatabase {
    state: Arc<Mutex<State>>,
    locks: Arc<Mutex<LockTable>>,
    lock_timeout: Duration,
    fail_next_outbox_write: Arc<AtomicBool>,
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl InMemoryDatabase {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            locks: Arc::new(Mutex::new(HashMap::new())),
            lock_timeout,
            fail_next_outbox_write: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make the next `append_outbox` call fail (fault injection for tests).
    pub fn fail_next_outbox_write(&self) {
        self.fail_next_outbox_write.store(true, Ordering::SeqCst);
    }

    fn state(&self) -> LedgerResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| DomainError::invariant("in-memory database state poisoned").into())
    }

    /// Committed row for `key`.
    pub fn stock_row(&self, key: &StockKey) -> Option<StockSummary> {
        self.state().ok()?.stock.get(key).cloned()
    }

    /// All committed rows of one business.
    pub fn stock_rows(&self, business_id: BusinessId) -> Vec<StockSummary> {
        let Ok(state) = self.state() else {
            return vec![];
        };
        let mut rows: Vec<_> = state
            .stock
            .values()
            .filter(|r| r.key.business_id == business_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }

    /// All committed outbox records, oldest first.
    pub fn outbox_records(&self) -> Vec<OutboxRecord> {
        self.state().map(|s| s.outbox.clone()).unwrap_or_default()
    }

    pub fn document_count(&self, business_id: BusinessId) -> usize {
        self.state()
            .map(|s| s.documents.keys().filter(|(b, _)| *b == business_id).count())
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl Database for InMemoryDatabase {
    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTx>> {
        Ok(Box::new(InMemoryTx::new(self.clone())))
    }

    async fn claim_outbox_batch(
        &self,
        limit: usize,
        lease: Duration,
    ) -> LedgerResult<Vec<OutboxRecord>> {
        let lease = TimeDelta::from_std(lease)
            .map_err(|_| DomainError::validation("outbox lease out of range"))?;
        let now = Utc::now();
        let mut state = self.state()?;
        let mut claimed = Vec::new();
        for record in state
            .outbox
            .iter_mut()
            .filter(|r| r.is_due(now, lease))
            .take(limit)
        {
            if record.publish_status == PublishStatus::Processing {
                warn!(record_id = %record.id, "reclaiming outbox record with an expired lease");
            }
            record.mark_processing(now);
            claimed.push(record.clone());
        }
        Ok(claimed)
    }

    async fn complete_outbox(&self, record: &OutboxRecord) -> LedgerResult<()> {
        let mut state = self.state()?;
        let stored = state
            .outbox
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or_else(DomainError::not_found)?;
        stored.publish_status = record.publish_status;
        stored.is_processed = record.is_processed;
        stored.attempts = record.attempts;
        stored.last_error = record.last_error.clone();
        stored.next_attempt_at = record.next_attempt_at;
        stored.claimed_at = record.claimed_at;
        Ok(())
    }
}

/// Staged write: `base` is the committed version it was derived from.
#[derive(Debug)]
struct Staged<T> {
    base: u64,
    value: Option<T>,
}

pub struct InMemoryTx {
    db: InMemoryDatabase,
    guards: HashMap<(BusinessId, LockDomain), OwnedMutexGuard<()>>,
    stock: HashMap<StockKey, Staged<StockSummary>>,
    documents: HashMap<(BusinessId, DocumentId), Staged<DocumentRow>>,
    outbox: Vec<OutboxRecord>,
}

impl InMemoryTx {
    fn new(db: InMemoryDatabase) -> Self {
        Self {
            db,
            guards: HashMap::new(),
            stock: HashMap::new(),
            documents: HashMap::new(),
            outbox: Vec::new(),
        }
    }

    fn current_stock(&self, key: &StockKey) -> LedgerResult<(u64, Option<StockSummary>)> {
        let state = self.db.state()?;
        let committed = state.stock.get(key);
        let committed_version = committed.map(|r| r.version).unwrap_or(0);
        Ok(match self.stock.get(key) {
            Some(staged) => (staged.base, staged.value.clone()),
            None => (committed_version, committed.cloned()),
        })
    }

    fn current_document(
        &self,
        key: &(BusinessId, DocumentId),
    ) -> LedgerResult<(u64, Option<DocumentRow>)> {
        let state = self.db.state()?;
        let committed = state.documents.get(key);
        let committed_version = committed.map(|r| r.version).unwrap_or(0);
        Ok(match self.documents.get(key) {
            Some(staged) => (staged.base, staged.value.clone()),
            None => (committed_version, committed.cloned()),
        })
    }
}

#[async_trait::async_trait]
impl LedgerTx for InMemoryTx {
    async fn lock_business(
        &mut self,
        business_id: BusinessId,
        domain: LockDomain,
    ) -> LedgerResult<()> {
        if self.guards.contains_key(&(business_id, domain)) {
            return Ok(());
        }

        let mutex = {
            let mut table = self
                .db
                .locks
                .lock()
                .map_err(|_| DomainError::invariant("lock table poisoned"))?;
            table.entry((business_id, domain)).or_default().clone()
        };

        match tokio::time::timeout(self.db.lock_timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                debug!(business_id = %business_id, domain = %domain, "business lock acquired");
                self.guards.insert((business_id, domain), guard);
                Ok(())
            }
            Err(_) => {
                warn!(business_id = %business_id, domain = %domain, "business lock timed out");
                Err(LedgerError::LockTimeout {
                    business_id,
                    domain,
                })
            }
        }
    }

    fn holds_lock(&self, business_id: BusinessId, domain: LockDomain) -> bool {
        self.guards.contains_key(&(business_id, domain))
    }

    async fn stock_summary(&mut self, key: &StockKey) -> LedgerResult<Option<StockSummary>> {
        Ok(self.current_stock(key)?.1)
    }

    async fn put_stock_summary(
        &mut self,
        row: &StockSummary,
        expected: ExpectedVersion,
    ) -> LedgerResult<()> {
        let (base, current) = self.current_stock(&row.key)?;
        let actual = current.as_ref().map(|r| r.version).unwrap_or(0);
        if !expected.matches(actual) {
            return Err(LedgerError::conflict(format!(
                "stock row {} is at version {actual}, expected {expected:?}",
                row.key
            )));
        }
        self.stock.insert(
            row.key.clone(),
            Staged {
                base,
                value: Some(row.clone()),
            },
        );
        Ok(())
    }

    async fn document(
        &mut self,
        business_id: BusinessId,
        id: DocumentId,
    ) -> LedgerResult<Option<DocumentRow>> {
        Ok(self.current_document(&(business_id, id))?.1)
    }

    async fn put_document(
        &mut self,
        row: &DocumentRow,
        expected: ExpectedVersion,
    ) -> LedgerResult<()> {
        let key = (row.business_id, row.id);
        let (base, current) = self.current_document(&key)?;
        let actual = current.as_ref().map(|r| r.version).unwrap_or(0);
        if !expected.matches(actual) {
            return Err(LedgerError::conflict(format!(
                "document {} is at version {actual}, expected {expected:?}",
                row.id
            )));
        }
        self.documents.insert(
            key,
            Staged {
                base,
                value: Some(row.clone()),
            },
        );
        Ok(())
    }

    async fn remove_document(
        &mut self,
        business_id: BusinessId,
        id: DocumentId,
        expected: ExpectedVersion,
    ) -> LedgerResult<()> {
        let key = (business_id, id);
        let (base, current) = self.current_document(&key)?;
        let Some(current) = current else {
            return Err(DomainError::not_found().into());
        };
        if !expected.matches(current.version) {
            return Err(LedgerError::conflict(format!(
                "document {id} is at version {}, expected {expected:?}",
                current.version
            )));
        }
        self.documents.insert(key, Staged { base, value: None });
        Ok(())
    }

    // Allocated outside the transaction: a rollback leaves a gap.
    async fn next_sequence(
        &mut self,
        business_id: BusinessId,
        document_type: DocumentType,
    ) -> LedgerResult<i64> {
        let mut state = self.db.state()?;
        let seq = state.sequences.entry((business_id, document_type)).or_insert(0);
        *seq += 1;
        Ok(*seq)
    }

    async fn append_outbox(&mut self, record: &OutboxRecord) -> LedgerResult<()> {
        if self.db.fail_next_outbox_write.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::Database(sqlx::Error::Protocol(
                "injected outbox write failure".to_string(),
            )));
        }
        self.outbox.push(record.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        let this = *self;
        let mut state = this.db.state()?;

        for (key, staged) in &this.stock {
            let committed = state.stock.get(key).map(|r| r.version).unwrap_or(0);
            if committed != staged.base {
                return Err(LedgerError::conflict(format!(
                    "stock row {key} changed underneath the transaction"
                )));
            }
        }
        for (key, staged) in &this.documents {
            let committed = state.documents.get(key).map(|r| r.version).unwrap_or(0);
            if committed != staged.base {
                return Err(LedgerError::conflict(format!(
                    "document {} changed underneath the transaction",
                    key.1
                )));
            }
        }

        for (key, staged) in this.stock {
            if let Some(row) = staged.value {
                state.stock.insert(key, row);
            }
        }
        for (key, staged) in this.documents {
            match staged.value {
                Some(row) => {
                    state.documents.insert(key, row);
                }
                None => {
                    state.documents.remove(&key);
                }
            }
        }
        state.outbox.extend(this.outbox);
        drop(state);
        // Guards drop here, after the writes are visible.
        drop(this.guards);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> LedgerResult<()> {
        Ok(())
    }
}
