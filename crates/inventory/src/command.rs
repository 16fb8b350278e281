//! Stock commands: the explicit bridge from a document status transition to
//! ledger deltas.
//!
//! Documents describe *what* they post ([`StockDocument::stock_postings`]);
//! the status table decides *whether* and in which direction
//! ([`DocumentStatus::stock_effect`]). A [`StockCommand`] captures both so
//! that infrastructure can execute it under the business lock.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    BusinessId, DocumentHeader, DocumentId, DocumentStatus, DocumentType, DomainResult,
    StockEffect, WarehouseId,
};
use stockledger_products::{ProductId, ProductType};

use crate::line::DocumentLine;
use crate::stock::{StockDimension, StockKey};

/// One unsigned quantity a document contributes to one dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockPosting {
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub product_type: ProductType,
    pub batch_number: String,
    pub dimension: StockDimension,
    pub qty: Decimal,
}

impl StockPosting {
    pub fn key(&self, business_id: BusinessId) -> StockKey {
        StockKey::new(
            business_id,
            self.warehouse_id,
            self.product_id,
            self.product_type,
            self.batch_number.clone(),
        )
    }

    /// Delta to add for the given effect.
    pub fn delta(&self, effect: StockEffect) -> Decimal {
        self.qty * effect.sign()
    }
}

/// Explicit command produced by a status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StockCommand {
    pub business_id: BusinessId,
    pub document_type: DocumentType,
    pub document_id: DocumentId,
    pub old_status: &'static str,
    pub new_status: &'static str,
    pub effect: StockEffect,
    pub date: NaiveDate,
    pub postings: Vec<StockPosting>,
}

impl StockCommand {
    /// Command for the transition `old_status -> document.status()`.
    ///
    /// Same-status transitions and edges outside the type's table are no-ops.
    pub fn for_transition<D: StockDocument>(document: &D, old_status: D::Status) -> Self {
        let new_status = document.status();
        let effect = if old_status == new_status {
            StockEffect::NoOp
        } else {
            D::Status::stock_effect(old_status, new_status)
        };
        Self::build(document, old_status, effect)
    }

    /// Command undoing the document's current effect when it is deleted.
    pub fn for_deletion<D: StockDocument>(document: &D) -> Self {
        let status = document.status();
        let effect = if D::DELETE_REVERSES && status.holds_stock() {
            StockEffect::Reverse
        } else {
            StockEffect::NoOp
        };
        Self::build(document, status, effect)
    }

    /// Reversal of whatever the document currently holds, used for pre-flight checks.
    pub fn reversal_of<D: StockDocument>(document: &D) -> Self {
        let status = document.status();
        let effect = if status.holds_stock() {
            StockEffect::Reverse
        } else {
            StockEffect::NoOp
        };
        Self::build(document, status, effect)
    }

    fn build<D: StockDocument>(document: &D, old_status: D::Status, effect: StockEffect) -> Self {
        let header = document.header();
        Self {
            business_id: header.business_id,
            document_type: D::DOCUMENT_TYPE,
            document_id: header.id,
            old_status: old_status.as_str(),
            new_status: document.status().as_str(),
            effect,
            date: header.date,
            postings: match effect {
                StockEffect::NoOp => Vec::new(),
                _ => document.stock_postings(),
            },
        }
    }

    pub fn is_noop(&self) -> bool {
        self.effect == StockEffect::NoOp || self.postings.is_empty()
    }
}

/// Quantity a linked document fulfils on one order line.
///
/// Carries the stock key of the fulfilling line so the order can check it
/// against its own line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfilmentLine {
    pub order_line_no: u32,
    pub product_id: ProductId,
    pub product_type: ProductType,
    #[serde(default)]
    pub batch_number: String,
    pub qty: Decimal,
}

impl FulfilmentLine {
    /// Fulfilment of `order_line_no` by `line`.
    pub fn new(order_line_no: u32, line: &DocumentLine) -> Self {
        Self {
            order_line_no,
            product_id: line.product_id,
            product_type: line.product_type,
            batch_number: line.batch_number.clone(),
            qty: line.qty,
        }
    }

    /// Same product, type and batch as `line`.
    pub fn matches(&self, line: &DocumentLine) -> bool {
        self.product_id == line.product_id
            && self.product_type == line.product_type
            && self.batch_number == line.batch_number
    }
}

/// Fulfilment a Bill or SalesInvoice records against its order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfilmentRequest {
    pub order_type: DocumentType,
    pub order_id: DocumentId,
    pub lines: Vec<FulfilmentLine>,
}

/// A business document whose lifecycle drives the stock ledger.
pub trait StockDocument: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const DOCUMENT_TYPE: DocumentType;

    /// Whether deleting a document that holds stock reverses it (instead of being refused).
    const DELETE_REVERSES: bool = false;

    type Status: DocumentStatus;

    fn header(&self) -> &DocumentHeader;
    fn header_mut(&mut self) -> &mut DocumentHeader;

    fn status(&self) -> Self::Status;
    fn set_status(&mut self, status: Self::Status);

    /// Line and field sanity; independent of status.
    fn validate(&self) -> DomainResult<()>;

    /// Whether `other` differs only in non-structural fields.
    fn same_structure(&self, other: &Self) -> bool;

    /// Quantities this document moves when its effect is applied.
    fn stock_postings(&self) -> Vec<StockPosting>;

    /// Payments, applied credits or refunds recorded against the document.
    fn has_settlements(&self) -> bool {
        false
    }

    /// Zero the settlement accumulators (used on clones).
    fn clear_settlements(&mut self) {}

    /// Quantities recorded against this document by linked documents.
    ///
    /// Only the ledger sets them; a newly created document must carry none.
    fn has_fulfilments(&self) -> bool {
        false
    }

    /// Order lines this document fulfils, if it is linked to an order.
    fn order_fulfilment(&self) -> Option<FulfilmentRequest> {
        None
    }

    fn check_transition(&self, next: Self::Status) -> DomainResult<()> {
        self.status().check_transition(next, Self::DOCUMENT_TYPE)
    }

    /// Draft replacement for Void+Clone: fresh identity, same content.
    fn cloned_as_draft(&self, id: DocumentId, sequence_no: i64, document_number: String) -> Self {
        let mut clone = self.clone();
        *clone.header_mut() = self.header().renumbered(id, sequence_no, document_number);
        clone.set_status(Self::Status::DRAFT);
        clone.clear_settlements();
        clone
    }

    fn id(&self) -> DocumentId {
        self.header().id
    }

    fn business_id(&self) -> BusinessId {
        self.header().business_id
    }
}
