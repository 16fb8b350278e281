use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    DocumentHeader, DocumentStatus, DocumentType, DomainError, DomainResult, PartyId,
    StockEffect, WarehouseId,
};
use stockledger_inventory::{
    validate_lines, DocumentLine, StockDimension, StockDocument, StockPosting,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupplierCreditStatus {
    Draft,
    Confirmed,
    Void,
    Closed,
}

impl DocumentStatus for SupplierCreditStatus {
    const DRAFT: Self = SupplierCreditStatus::Draft;
    const POSTED: Self = SupplierCreditStatus::Confirmed;
    const VOID: Option<Self> = Some(SupplierCreditStatus::Void);

    fn as_str(self) -> &'static str {
        match self {
            SupplierCreditStatus::Draft => "draft",
            SupplierCreditStatus::Confirmed => "confirmed",
            SupplierCreditStatus::Void => "void",
            SupplierCreditStatus::Closed => "closed",
        }
    }

    fn can_transition_to(self, next: Self) -> bool {
        use SupplierCreditStatus::*;
        matches!(
            (self, next),
            (Draft, Confirmed) | (Confirmed, Draft) | (Confirmed, Closed) | (Confirmed, Void)
        )
    }

    // Closing a supplier credit returns the goods to stock as well.
    fn stock_effect(from: Self, to: Self) -> StockEffect {
        use SupplierCreditStatus::*;
        match (from, to) {
            (Draft, Confirmed) => StockEffect::Apply,
            (Confirmed, Draft) | (Confirmed, Closed) | (Confirmed, Void) => StockEffect::Reverse,
            _ => StockEffect::NoOp,
        }
    }

    fn holds_stock(self) -> bool {
        self == SupplierCreditStatus::Confirmed
    }
}

/// Goods returned to a supplier: reduces `received_qty`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierCredit {
    pub header: DocumentHeader,
    pub status: SupplierCreditStatus,
    pub supplier_id: PartyId,
    pub warehouse_id: WarehouseId,
    pub lines: Vec<DocumentLine>,
    /// Credits applied to bills plus refunds received.
    #[serde(default)]
    pub applied_amount: Decimal,
}

impl SupplierCredit {
    pub fn new(
        header: DocumentHeader,
        supplier_id: PartyId,
        warehouse_id: WarehouseId,
        lines: Vec<DocumentLine>,
    ) -> Self {
        Self {
            header,
            status: SupplierCreditStatus::Draft,
            supplier_id,
            warehouse_id,
            lines,
            applied_amount: Decimal::ZERO,
        }
    }
}

impl StockDocument for SupplierCredit {
    const DOCUMENT_TYPE: DocumentType = DocumentType::SupplierCredit;

    type Status = SupplierCreditStatus;

    fn header(&self) -> &DocumentHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut DocumentHeader {
        &mut self.header
    }

    fn status(&self) -> SupplierCreditStatus {
        self.status
    }

    fn set_status(&mut self, status: SupplierCreditStatus) {
        self.status = status;
    }

    fn validate(&self) -> DomainResult<()> {
        if self.applied_amount < Decimal::ZERO {
            return Err(DomainError::validation("applied amount cannot be negative"));
        }
        validate_lines(&self.lines)
    }

    fn same_structure(&self, other: &Self) -> bool {
        self.header.same_structure(&other.header)
            && self.supplier_id == other.supplier_id
            && self.warehouse_id == other.warehouse_id
            && self.lines == other.lines
    }

    /// Negative received quantities: applying the credit takes goods out.
    fn stock_postings(&self) -> Vec<StockPosting> {
        self.lines
            .iter()
            .map(|l| StockPosting {
                warehouse_id: self.warehouse_id,
                product_id: l.product_id,
                product_type: l.product_type,
                batch_number: l.batch_number.clone(),
                dimension: StockDimension::Received,
                qty: -l.qty,
            })
            .collect()
    }

    fn has_settlements(&self) -> bool {
        self.applied_amount > Decimal::ZERO
    }

    fn clear_settlements(&mut self) {
        self.applied_amount = Decimal::ZERO;
    }

    fn check_transition(&self, next: SupplierCreditStatus) -> DomainResult<()> {
        self.status.check_transition(next, Self::DOCUMENT_TYPE)?;
        if matches!(next, SupplierCreditStatus::Draft | SupplierCreditStatus::Void)
            && self.has_settlements()
        {
            return Err(DomainError::validation(
                "supplier credit has been applied; remove applications first",
            ));
        }
        Ok(())
    }
}
