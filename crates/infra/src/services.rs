//! Document service: create, edit, status changes, deletion and Void+Clone.
//!
//! Every public operation runs in one transaction and is retried as a whole
//! (fresh transaction) on lock timeouts and version conflicts. Within the
//! transaction the order is always: stock command, order fulfilment, outbox
//! record, document write, commit. The first error drops the transaction.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{Span, info, instrument};

use stockledger_core::{
    BusinessId, DocumentId, DocumentStatus, DocumentType, DomainError, StockEffect,
};
use stockledger_events::OutboxAction;
use stockledger_inventory::{
    FulfillableOrder, FulfilmentRequest, StockCommand, StockDocument, StockKey, StockLevel,
};
use stockledger_purchasing::PurchaseOrder;
use stockledger_sales::SalesOrder;

use crate::error::LedgerResult;
use crate::lock::acquire_stock_lock;
use crate::numbering::Numbering;
use crate::outbox::publish_to_accounting;
use crate::repository::{self, Attachment, Stored};
use crate::retry::RetryPolicy;
use crate::stock_commands::StockCommandEngine;
use crate::stock_store::get_product_stock;
use crate::tx::{Database, LedgerTx};

/// Caller identity for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    pub business_id: BusinessId,
    /// Propagated into outbox records.
    pub correlation_id: Option<String>,
}

impl OperationContext {
    pub fn new(business_id: BusinessId) -> Self {
        Self {
            business_id,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

pub struct DocumentService {
    db: Arc<dyn Database>,
    engine: StockCommandEngine,
    numbering: Numbering,
    retry: RetryPolicy,
}

impl core::fmt::Debug for DocumentService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DocumentService")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl DocumentService {
    pub fn new(
        db: Arc<dyn Database>,
        engine: StockCommandEngine,
        numbering: Numbering,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            engine,
            numbering,
            retry,
        }
    }

    pub fn engine(&self) -> &StockCommandEngine {
        &self.engine
    }

    /// Persist a new document, posting it when it is created in a stock-holding status.
    ///
    /// An empty `document_number` is allocated from the numbering sequence.
    #[instrument(
        skip_all,
        fields(
            business_id = %ctx.business_id,
            document_type = %D::DOCUMENT_TYPE,
            document_id = %document.id()
        ),
        err
    )]
    pub async fn create<D: StockDocument>(
        &self,
        ctx: &OperationContext,
        document: D,
        attachments: Vec<Attachment>,
    ) -> LedgerResult<Stored<D>> {
        self.retry
            .run("create", || {
                self.create_once(ctx, document.clone(), attachments.clone())
            })
            .await
    }

    async fn create_once<D: StockDocument>(
        &self,
        ctx: &OperationContext,
        mut document: D,
        attachments: Vec<Attachment>,
    ) -> LedgerResult<Stored<D>> {
        ensure_business(ctx, &document)?;
        ensure_unfulfilled(&document)?;
        let status = document.status();
        if !status.is_draft() {
            let mut draft = document.clone();
            draft.set_status(D::Status::DRAFT);
            draft.check_transition(status)?;
        }
        document.validate()?;

        let mut tx = self.db.begin().await?;

        if document.header().document_number.is_empty() {
            let header = document.header();
            let (sequence_no, number) = self
                .numbering
                .next_number(tx.as_mut(), header.business_id, header.branch_id, D::DOCUMENT_TYPE)
                .await?;
            let header = document.header_mut();
            header.sequence_no = sequence_no;
            header.document_number = number;
        }

        self.post_transition(tx.as_mut(), ctx, None, &document, D::Status::DRAFT)
            .await?;

        let mut stored = Stored::new(document).with_attachments(attachments);
        repository::save(tx.as_mut(), &mut stored).await?;
        tx.commit().await?;

        info!(
            document_number = %stored.document.header().document_number,
            status = stored.document.status().as_str(),
            "document created"
        );
        Ok(stored)
    }

    /// Replace a document's content without changing its status.
    ///
    /// Drafts accept any edit. Once posted only non-structural fields (notes,
    /// reference number, settlement accumulators) may change; a posted
    /// posting-type document emits an `Update` outbox record.
    #[instrument(
        skip_all,
        fields(
            business_id = %ctx.business_id,
            document_type = %D::DOCUMENT_TYPE,
            document_id = %document.id()
        ),
        err
    )]
    pub async fn update<D: StockDocument>(
        &self,
        ctx: &OperationContext,
        document: D,
    ) -> LedgerResult<Stored<D>> {
        self.retry
            .run("update", || self.update_once(ctx, document.clone()))
            .await
    }

    async fn update_once<D: StockDocument>(
        &self,
        ctx: &OperationContext,
        mut document: D,
    ) -> LedgerResult<Stored<D>> {
        ensure_business(ctx, &document)?;
        let mut tx = self.db.begin().await?;
        let mut stored = repository::load::<D>(tx.as_mut(), ctx.business_id, document.id()).await?;
        let before = stored.document.clone();

        if document.status() != before.status() {
            return Err(DomainError::validation(
                "status changes go through change_status, not update",
            )
            .into());
        }
        {
            let header = document.header_mut();
            header.sequence_no = before.header().sequence_no;
            header.document_number = before.header().document_number.clone();
        }
        document.validate()?;

        let posted = !before.status().is_draft();
        if posted && !before.same_structure(&document) {
            return Err(DomainError::validation(format!(
                "{} {} is {}; structural changes require void and clone",
                D::DOCUMENT_TYPE,
                before.header().document_number,
                before.status().as_str()
            ))
            .into());
        }

        let changed = serde_json::to_value(&before)? != serde_json::to_value(&document)?;
        if changed && posted && D::DOCUMENT_TYPE.is_posting() && before.status().holds_stock() {
            publish_to_accounting(
                tx.as_mut(),
                ctx.business_id,
                Utc::now(),
                document.id(),
                D::DOCUMENT_TYPE,
                Some(&document),
                Some(&before),
                OutboxAction::Update,
                ctx.correlation_id.clone(),
            )
            .await?;
        }

        stored.document = document;
        repository::save(tx.as_mut(), &mut stored).await?;
        tx.commit().await?;
        Ok(stored)
    }

    /// Move a document to `next`, applying or reversing its stock effect.
    #[instrument(
        skip_all,
        fields(
            business_id = %ctx.business_id,
            document_type = %D::DOCUMENT_TYPE,
            document_id = %id,
            to = next.as_str(),
            from = tracing::field::Empty
        ),
        err
    )]
    pub async fn change_status<D: StockDocument>(
        &self,
        ctx: &OperationContext,
        id: DocumentId,
        next: D::Status,
    ) -> LedgerResult<Stored<D>> {
        self.retry
            .run("change_status", || self.change_status_once::<D>(ctx, id, next))
            .await
    }

    async fn change_status_once<D: StockDocument>(
        &self,
        ctx: &OperationContext,
        id: DocumentId,
        next: D::Status,
    ) -> LedgerResult<Stored<D>> {
        let mut tx = self.db.begin().await?;
        let mut stored = repository::load::<D>(tx.as_mut(), ctx.business_id, id).await?;
        let old = stored.document.status();
        Span::current().record("from", old.as_str());
        if old == next {
            return Ok(stored);
        }

        stored.document.check_transition(next)?;
        if old.is_draft() {
            ensure_unfulfilled(&stored.document)?;
        }
        let before = stored.document.clone();
        stored.document.set_status(next);
        stored.document.validate()?;

        self.post_transition(tx.as_mut(), ctx, Some(&before), &stored.document, old)
            .await?;
        repository::save(tx.as_mut(), &mut stored).await?;
        tx.commit().await?;
        Ok(stored)
    }

    /// Delete a document.
    ///
    /// Drafts and documents holding no stock are removed outright. Adjustments
    /// and transfers reverse their stock first; other posted documents must
    /// be voided or cancelled before deletion.
    #[instrument(
        skip_all,
        fields(business_id = %ctx.business_id, document_type = %D::DOCUMENT_TYPE, document_id = %id),
        err
    )]
    pub async fn delete<D: StockDocument>(
        &self,
        ctx: &OperationContext,
        id: DocumentId,
    ) -> LedgerResult<()> {
        self.retry
            .run("delete", || self.delete_once::<D>(ctx, id))
            .await
    }

    async fn delete_once<D: StockDocument>(
        &self,
        ctx: &OperationContext,
        id: DocumentId,
    ) -> LedgerResult<()> {
        let mut tx = self.db.begin().await?;
        let stored = repository::load::<D>(tx.as_mut(), ctx.business_id, id).await?;
        let document = &stored.document;

        if document.status().holds_stock() && !D::DELETE_REVERSES {
            return Err(DomainError::validation(format!(
                "{} {} is {}; void or cancel it before deleting",
                D::DOCUMENT_TYPE,
                document.header().document_number,
                document.status().as_str()
            ))
            .into());
        }

        let command = StockCommand::for_deletion(document);
        self.engine.execute(tx.as_mut(), &command).await?;
        if command.effect == StockEffect::Reverse {
            if let Some(request) = document.order_fulfilment() {
                self.settle_order(tx.as_mut(), ctx.business_id, &request, document.header().date, true)
                    .await?;
            }
            if D::DOCUMENT_TYPE.is_posting() {
                publish_to_accounting::<D>(
                    tx.as_mut(),
                    ctx.business_id,
                    Utc::now(),
                    id,
                    D::DOCUMENT_TYPE,
                    None,
                    Some(document),
                    OutboxAction::Delete,
                    ctx.correlation_id.clone(),
                )
                .await?;
            }
        }

        repository::remove(tx.as_mut(), &stored).await?;
        tx.commit().await?;
        info!("document deleted");
        Ok(())
    }

    /// Correct a posted document by replacement.
    ///
    /// Voids the original (reversing its stock and order fulfilment, emitting
    /// a `Delete` outbox record) and creates a Draft clone with a fresh
    /// number. Returns `(voided, clone)`.
    #[instrument(
        skip_all,
        fields(business_id = %ctx.business_id, document_type = %D::DOCUMENT_TYPE, document_id = %id),
        err
    )]
    pub async fn void_and_clone<D: StockDocument>(
        &self,
        ctx: &OperationContext,
        id: DocumentId,
    ) -> LedgerResult<(Stored<D>, Stored<D>)> {
        self.retry
            .run("void_and_clone", || self.void_and_clone_once::<D>(ctx, id))
            .await
    }

    async fn void_and_clone_once<D: StockDocument>(
        &self,
        ctx: &OperationContext,
        id: DocumentId,
    ) -> LedgerResult<(Stored<D>, Stored<D>)> {
        let Some(void) = D::Status::VOID else {
            return Err(DomainError::validation(format!(
                "{} has no void status",
                D::DOCUMENT_TYPE
            ))
            .into());
        };

        let mut tx = self.db.begin().await?;
        let lock = acquire_stock_lock(tx.as_mut(), ctx.business_id).await?;
        let mut original = repository::load::<D>(tx.as_mut(), ctx.business_id, id).await?;

        if original.document.status() != D::Status::POSTED {
            return Err(DomainError::validation(format!(
                "only {} documents can be voided and cloned (found {})",
                D::Status::POSTED.as_str(),
                original.document.status().as_str()
            ))
            .into());
        }
        if original.document.has_settlements() {
            return Err(DomainError::validation(
                "document has payments or applied credits; remove them first",
            )
            .into());
        }

        self.engine
            .ensure_reversible(tx.as_mut(), &lock, &StockCommand::reversal_of(&original.document))
            .await?;

        let header = original.document.header();
        let (sequence_no, number) = self
            .numbering
            .next_number(tx.as_mut(), header.business_id, header.branch_id, D::DOCUMENT_TYPE)
            .await?;
        let clone = original
            .document
            .cloned_as_draft(DocumentId::new(), sequence_no, number);
        let mut clone = Stored::new(clone).with_attachments(original.attachments.clone());

        let before = original.document.clone();
        original.document.check_transition(void)?;
        original.document.set_status(void);
        self.post_transition(tx.as_mut(), ctx, Some(&before), &original.document, D::Status::POSTED)
            .await?;

        repository::save(tx.as_mut(), &mut original).await?;
        repository::save(tx.as_mut(), &mut clone).await?;
        tx.commit().await?;

        info!(
            clone_id = %clone.document.id(),
            clone_number = %clone.document.header().document_number,
            "document voided and cloned"
        );
        Ok((original, clone))
    }

    pub async fn get<D: StockDocument>(
        &self,
        ctx: &OperationContext,
        id: DocumentId,
    ) -> LedgerResult<Stored<D>> {
        let mut tx = self.db.begin().await?;
        let stored = repository::load::<D>(tx.as_mut(), ctx.business_id, id).await?;
        tx.rollback().await?;
        Ok(stored)
    }

    /// Committed on-hand quantity at `key`.
    pub async fn stock_level(&self, key: &StockKey) -> LedgerResult<StockLevel> {
        let mut tx = self.db.begin().await?;
        let level = get_product_stock(tx.as_mut(), self.engine.products(), key).await?;
        tx.rollback().await?;
        Ok(level)
    }

    /// Stock command, order fulfilment and outbox record for `old_status -> document.status()`.
    async fn post_transition<D: StockDocument>(
        &self,
        tx: &mut dyn LedgerTx,
        ctx: &OperationContext,
        before: Option<&D>,
        document: &D,
        old_status: D::Status,
    ) -> LedgerResult<StockEffect> {
        let command = self
            .engine
            .apply_document_transition(tx, document, old_status)
            .await?;

        let (release, action) = match command.effect {
            StockEffect::NoOp => return Ok(StockEffect::NoOp),
            StockEffect::Apply => (false, OutboxAction::Create),
            StockEffect::Reverse => (true, OutboxAction::Delete),
        };

        if let Some(request) = document.order_fulfilment() {
            self.settle_order(tx, ctx.business_id, &request, document.header().date, release)
                .await?;
        }

        if D::DOCUMENT_TYPE.is_posting() {
            let (new_obj, old_obj) = match action {
                OutboxAction::Create => (Some(document), None),
                _ => (None, Some(before.unwrap_or(document))),
            };
            publish_to_accounting(
                tx,
                ctx.business_id,
                Utc::now(),
                document.id(),
                D::DOCUMENT_TYPE,
                new_obj,
                old_obj,
                action,
                ctx.correlation_id.clone(),
            )
            .await?;
        }
        Ok(command.effect)
    }

    /// Fulfil (or release) order lines for a linked bill or invoice.
    async fn settle_order(
        &self,
        tx: &mut dyn LedgerTx,
        business_id: BusinessId,
        request: &FulfilmentRequest,
        date: NaiveDate,
        release: bool,
    ) -> LedgerResult<()> {
        match request.order_type {
            DocumentType::PurchaseOrder => {
                self.settle_typed::<PurchaseOrder>(tx, business_id, request, date, release)
                    .await
            }
            DocumentType::SalesOrder => {
                self.settle_typed::<SalesOrder>(tx, business_id, request, date, release)
                    .await
            }
            other => Err(DomainError::invariant(format!("{other} is not an order type")).into()),
        }
    }

    async fn settle_typed<O: FulfillableOrder>(
        &self,
        tx: &mut dyn LedgerTx,
        business_id: BusinessId,
        request: &FulfilmentRequest,
        date: NaiveDate,
        release: bool,
    ) -> LedgerResult<()> {
        let lock = acquire_stock_lock(tx, business_id).await?;
        let mut order = repository::load::<O>(tx, business_id, request.order_id).await?;

        let (postings, effect) = if release {
            (order.document.release(&request.lines)?, StockEffect::Apply)
        } else {
            (order.document.fulfil(&request.lines)?, StockEffect::Reverse)
        };
        self.engine
            .apply_postings(tx, &lock, business_id, &postings, effect, date)
            .await?;

        repository::save(tx, &mut order).await
    }
}

fn ensure_business<D: StockDocument>(ctx: &OperationContext, document: &D) -> LedgerResult<()> {
    if document.business_id() != ctx.business_id {
        return Err(DomainError::validation(format!(
            "document belongs to business {}, not {}",
            document.business_id(),
            ctx.business_id
        ))
        .into());
    }
    Ok(())
}

/// Fulfilled quantities are written by linked documents only, never by callers.
fn ensure_unfulfilled<D: StockDocument>(document: &D) -> LedgerResult<()> {
    if document.has_fulfilments() {
        return Err(DomainError::validation(format!(
            "{} carries fulfilled quantities; only linked documents may record them",
            D::DOCUMENT_TYPE
        ))
        .into());
    }
    Ok(())
}
