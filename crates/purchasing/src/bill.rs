use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    DocumentHeader, DocumentId, DocumentStatus, DocumentType, DomainError, DomainResult,
    PartyId, StockEffect, WarehouseId,
};
use stockledger_inventory::{
    fulfilment_request, validate_links, FulfilmentRequest, LinkedLine, StockDimension,
    StockDocument, StockPosting,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillStatus {
    Draft,
    Confirmed,
    Void,
    PartialPaid,
    Paid,
}

impl DocumentStatus for BillStatus {
    const DRAFT: Self = BillStatus::Draft;
    const POSTED: Self = BillStatus::Confirmed;
    const VOID: Option<Self> = Some(BillStatus::Void);

    fn as_str(self) -> &'static str {
        match self {
            BillStatus::Draft => "draft",
            BillStatus::Confirmed => "confirmed",
            BillStatus::Void => "void",
            BillStatus::PartialPaid => "partial_paid",
            BillStatus::Paid => "paid",
        }
    }

    fn can_transition_to(self, next: Self) -> bool {
        use BillStatus::*;
        match (self, next) {
            (Draft, Confirmed) | (Confirmed, Draft) | (Confirmed, Void) => true,
            // Payment edges, driven by the payments collaborator.
            (a, b) if a != b => a.is_payable() && b.is_payable(),
            _ => false,
        }
    }

    fn stock_effect(from: Self, to: Self) -> StockEffect {
        use BillStatus::*;
        match (from, to) {
            (Draft, Confirmed) => StockEffect::Apply,
            (Confirmed, Draft) | (Confirmed, Void) => StockEffect::Reverse,
            _ => StockEffect::NoOp,
        }
    }

    fn holds_stock(self) -> bool {
        self.is_payable()
    }
}

impl BillStatus {
    fn is_payable(self) -> bool {
        matches!(self, BillStatus::Confirmed | BillStatus::PartialPaid | BillStatus::Paid)
    }
}

/// Supplier bill: receives goods into `received_qty`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bill {
    pub header: DocumentHeader,
    pub status: BillStatus,
    pub supplier_id: PartyId,
    pub warehouse_id: WarehouseId,
    #[serde(default)]
    pub purchase_order_id: Option<DocumentId>,
    pub lines: Vec<LinkedLine>,
    #[serde(default)]
    pub paid_amount: Decimal,
}

impl Bill {
    pub fn new(
        header: DocumentHeader,
        supplier_id: PartyId,
        warehouse_id: WarehouseId,
        lines: Vec<LinkedLine>,
    ) -> Self {
        Self {
            header,
            status: BillStatus::Draft,
            supplier_id,
            warehouse_id,
            purchase_order_id: None,
            lines,
            paid_amount: Decimal::ZERO,
        }
    }

    pub fn for_purchase_order(mut self, purchase_order_id: DocumentId) -> Self {
        self.purchase_order_id = Some(purchase_order_id);
        self
    }
}

impl StockDocument for Bill {
    const DOCUMENT_TYPE: DocumentType = DocumentType::Bill;

    type Status = BillStatus;

    fn header(&self) -> &DocumentHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut DocumentHeader {
        &mut self.header
    }

    fn status(&self) -> BillStatus {
        self.status
    }

    fn set_status(&mut self, status: BillStatus) {
        self.status = status;
    }

    fn validate(&self) -> DomainResult<()> {
        if self.paid_amount < Decimal::ZERO {
            return Err(DomainError::validation("paid amount cannot be negative"));
        }
        validate_links(self.purchase_order_id, &self.lines)
    }

    fn same_structure(&self, other: &Self) -> bool {
        self.header.same_structure(&other.header)
            && self.supplier_id == other.supplier_id
            && self.warehouse_id == other.warehouse_id
            && self.purchase_order_id == other.purchase_order_id
            && self.lines == other.lines
    }

    fn stock_postings(&self) -> Vec<StockPosting> {
        self.lines
            .iter()
            .map(|l| StockPosting {
                warehouse_id: self.warehouse_id,
                product_id: l.line.product_id,
                product_type: l.line.product_type,
                batch_number: l.line.batch_number.clone(),
                dimension: StockDimension::Received,
                qty: l.line.qty,
            })
            .collect()
    }

    fn has_settlements(&self) -> bool {
        self.paid_amount > Decimal::ZERO
    }

    fn clear_settlements(&mut self) {
        self.paid_amount = Decimal::ZERO;
    }

    fn order_fulfilment(&self) -> Option<FulfilmentRequest> {
        fulfilment_request(DocumentType::PurchaseOrder, self.purchase_order_id, &self.lines)
    }

    fn check_transition(&self, next: BillStatus) -> DomainResult<()> {
        self.status.check_transition(next, Self::DOCUMENT_TYPE)?;
        if matches!(next, BillStatus::Draft | BillStatus::Void) && self.has_settlements() {
            return Err(DomainError::validation(
                "bill has payments recorded; remove them first",
            ));
        }
        Ok(())
    }
}
