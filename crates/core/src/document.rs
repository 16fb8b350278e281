//! Document vocabulary shared by every business document type.
//!
//! A document owns a status drawn from a closed, type-specific transition
//! table. The table decides which transitions create a stock effect (apply),
//! undo it (reverse), or leave the ledger alone.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{BranchId, BusinessId, DocumentId};

/// Every document type whose lifecycle touches the stock ledger.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    PurchaseOrder,
    Bill,
    SalesOrder,
    SalesInvoice,
    CreditNote,
    SupplierCredit,
    InventoryAdjustment,
    TransferOrder,
}

impl DocumentType {
    pub const ALL: [DocumentType; 8] = [
        DocumentType::PurchaseOrder,
        DocumentType::Bill,
        DocumentType::SalesOrder,
        DocumentType::SalesInvoice,
        DocumentType::CreditNote,
        DocumentType::SupplierCredit,
        DocumentType::InventoryAdjustment,
        DocumentType::TransferOrder,
    ];

    /// Stable tag used in storage and in outbox `reference_type`.
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentType::PurchaseOrder => "purchase_order",
            DocumentType::Bill => "bill",
            DocumentType::SalesOrder => "sales_order",
            DocumentType::SalesInvoice => "sales_invoice",
            DocumentType::CreditNote => "credit_note",
            DocumentType::SupplierCredit => "supplier_credit",
            DocumentType::InventoryAdjustment => "inventory_adjustment",
            DocumentType::TransferOrder => "transfer_order",
        }
    }

    pub fn parse(tag: &str) -> DomainResult<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == tag)
            .ok_or_else(|| DomainError::validation(format!("unknown document type '{tag}'")))
    }

    /// Number prefix used when a branch has not configured its own.
    pub fn default_prefix(self) -> &'static str {
        match self {
            DocumentType::PurchaseOrder => "PO-",
            DocumentType::Bill => "BL-",
            DocumentType::SalesOrder => "SO-",
            DocumentType::SalesInvoice => "INV-",
            DocumentType::CreditNote => "CN-",
            DocumentType::SupplierCredit => "SC-",
            DocumentType::InventoryAdjustment => "IA-",
            DocumentType::TransferOrder => "TO-",
        }
    }

    /// Whether transitions of this type are published to accounting.
    ///
    /// Orders are commitments only; they never post.
    pub fn is_posting(self) -> bool {
        !matches!(self, DocumentType::PurchaseOrder | DocumentType::SalesOrder)
    }
}

impl core::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger consequence of a status transition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StockEffect {
    /// Goods or commitments became real: add line quantities.
    Apply,
    /// Undo a previous apply: subtract line quantities.
    Reverse,
    /// Nothing to do.
    NoOp,
}

impl StockEffect {
    /// Multiplier applied to posting quantities.
    pub fn sign(self) -> Decimal {
        match self {
            StockEffect::Apply => Decimal::ONE,
            StockEffect::Reverse => Decimal::NEGATIVE_ONE,
            StockEffect::NoOp => Decimal::ZERO,
        }
    }
}

/// Status enum of one document type together with its transition table.
pub trait DocumentStatus:
    Copy + Eq + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Initial, freely editable state.
    const DRAFT: Self;
    /// Target of the apply edge.
    const POSTED: Self;
    /// Terminal state used by Void+Clone, when the type has one.
    const VOID: Option<Self>;

    fn as_str(self) -> &'static str;

    /// Whether a caller may request `self -> next`.
    fn can_transition_to(self, next: Self) -> bool;

    /// Closed table of ledger effects; anything not listed is `NoOp`.
    fn stock_effect(from: Self, to: Self) -> StockEffect;

    /// Whether a document in this state currently has its stock effect applied.
    fn holds_stock(self) -> bool;

    fn is_draft(self) -> bool {
        self == Self::DRAFT
    }

    fn check_transition(self, next: Self, document_type: DocumentType) -> DomainResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::validation(format!(
                "{document_type} cannot move from {} to {}",
                self.as_str(),
                next.as_str()
            )))
        }
    }
}

/// Fields every document carries regardless of type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentHeader {
    pub id: DocumentId,
    pub business_id: BusinessId,
    pub branch_id: BranchId,
    /// Human-facing number (`<prefix><sequence>`), assigned on creation.
    pub document_number: String,
    pub sequence_no: i64,
    pub date: NaiveDate,
    pub reference_number: Option<String>,
    pub notes: Option<String>,
}

impl DocumentHeader {
    /// A header for a document that has not been numbered yet.
    pub fn new(business_id: BusinessId, branch_id: BranchId, date: NaiveDate) -> Self {
        Self {
            id: DocumentId::new(),
            business_id,
            branch_id,
            document_number: String::new(),
            sequence_no: 0,
            date,
            reference_number: None,
            notes: None,
        }
    }

    /// Structural fields: the ones a posted document may no longer change.
    pub fn same_structure(&self, other: &Self) -> bool {
        self.id == other.id
            && self.business_id == other.business_id
            && self.branch_id == other.branch_id
            && self.date == other.date
    }

    /// Copy for a Void+Clone replacement: fresh identity and numbering.
    pub fn renumbered(&self, id: DocumentId, sequence_no: i64, document_number: String) -> Self {
        Self {
            id,
            sequence_no,
            document_number,
            ..self.clone()
        }
    }
}

/// Aggregate fulfilment of an order, derived from its lines.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FulfilmentState {
    Unfulfilled,
    Partial,
    Fulfilled,
}

impl FulfilmentState {
    /// Derive from `(ordered, fulfilled)` pairs.
    ///
    /// Any line with nothing fulfilled → `Unfulfilled`; otherwise any line
    /// short of its ordered qty → `Partial`; otherwise `Fulfilled`. An order
    /// without lines counts as unfulfilled.
    pub fn derive(lines: impl IntoIterator<Item = (Decimal, Decimal)>) -> Self {
        let mut seen = false;
        let mut partial = false;
        for (ordered, fulfilled) in lines {
            seen = true;
            if fulfilled <= Decimal::ZERO {
                return FulfilmentState::Unfulfilled;
            }
            if fulfilled < ordered {
                partial = true;
            }
        }
        match (seen, partial) {
            (false, _) => FulfilmentState::Unfulfilled,
            (true, true) => FulfilmentState::Partial,
            (true, false) => FulfilmentState::Fulfilled,
        }
    }
}
