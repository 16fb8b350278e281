//! Stock Command Engine.
//!
//! Turns a [`StockCommand`] into Stock Summary deltas under the business
//! stock lock. This is the only path from a document transition to the
//! ledger.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, instrument};

use stockledger_core::{BusinessId, StockEffect};
use stockledger_inventory::{StockCommand, StockDocument, StockKey, StockPosting, StockSummary};
use stockledger_products::{ProductInterface, ProductResolver};

use crate::error::LedgerResult;
use crate::lock::{StockLock, acquire_stock_lock};
use crate::stock_store::update_stock_summary;
use crate::tx::LedgerTx;

#[derive(Clone)]
pub struct StockCommandEngine {
    products: Arc<dyn ProductResolver>,
}

impl core::fmt::Debug for StockCommandEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StockCommandEngine").finish_non_exhaustive()
    }
}

impl StockCommandEngine {
    pub fn new(products: Arc<dyn ProductResolver>) -> Self {
        Self { products }
    }

    pub fn products(&self) -> &dyn ProductResolver {
        self.products.as_ref()
    }

    /// Run a command inside `tx`.
    ///
    /// No-op commands return before the lock is taken or any row is read.
    /// The first failing posting aborts the command; the caller drops the
    /// transaction, so nothing already applied survives.
    #[instrument(
        skip(self, tx, command),
        fields(
            business_id = %command.business_id,
            document_type = %command.document_type,
            document_id = %command.document_id,
            from = command.old_status,
            to = command.new_status,
            effect = ?command.effect
        ),
        err
    )]
    pub async fn execute(&self, tx: &mut dyn LedgerTx, command: &StockCommand) -> LedgerResult<()> {
        if command.is_noop() {
            debug!("no stock effect");
            return Ok(());
        }

        let lock = acquire_stock_lock(tx, command.business_id).await?;
        self.apply_postings(
            tx,
            &lock,
            command.business_id,
            &command.postings,
            command.effect,
            command.date,
        )
        .await
    }

    /// Apply postings with an already held lock. Untracked products are skipped.
    pub async fn apply_postings(
        &self,
        tx: &mut dyn LedgerTx,
        lock: &StockLock,
        business_id: BusinessId,
        postings: &[StockPosting],
        effect: StockEffect,
        date: NaiveDate,
    ) -> LedgerResult<()> {
        if effect == StockEffect::NoOp {
            return Ok(());
        }
        for posting in postings {
            if !self.is_tracked(business_id, posting)? {
                continue;
            }
            let key = posting.key(business_id);
            update_stock_summary(tx, lock, posting.dimension, &key, posting.delta(effect), date)
                .await?;
        }
        Ok(())
    }

    /// Entry point for a document whose status just changed from `old_status`.
    ///
    /// Returns the executed command so callers can decide on outbox writes.
    pub async fn apply_document_transition<D: StockDocument>(
        &self,
        tx: &mut dyn LedgerTx,
        document: &D,
        old_status: D::Status,
    ) -> LedgerResult<StockCommand> {
        let command = StockCommand::for_transition(document, old_status);
        self.execute(tx, &command).await?;
        Ok(command)
    }

    /// Fail with `NegativeStock` if running `command` would drive any row
    /// negative. Nothing is written.
    pub async fn ensure_reversible(
        &self,
        tx: &mut dyn LedgerTx,
        lock: &StockLock,
        command: &StockCommand,
    ) -> LedgerResult<()> {
        if command.is_noop() {
            return Ok(());
        }
        lock.check(command.business_id)?;

        let mut simulated: HashMap<StockKey, StockSummary> = HashMap::new();
        for posting in &command.postings {
            if !self.is_tracked(command.business_id, posting)? {
                continue;
            }
            let key = posting.key(command.business_id);
            let row = match simulated.remove(&key) {
                Some(row) => row,
                None => tx
                    .stock_summary(&key)
                    .await?
                    .unwrap_or_else(|| StockSummary::empty(key.clone())),
            };
            let next = row.apply(posting.dimension, posting.delta(command.effect), command.date)?;
            simulated.insert(key, next);
        }
        Ok(())
    }

    fn is_tracked(&self, business_id: BusinessId, posting: &StockPosting) -> LedgerResult<bool> {
        if posting.product_type.is_input() {
            return Ok(false);
        }
        let product =
            self.products
                .product_or_variant(business_id, posting.product_type, posting.product_id)?;
        Ok(product.is_inventory_tracked())
    }
}
