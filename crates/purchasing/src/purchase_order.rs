use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    DocumentHeader, DocumentStatus, DocumentType, DomainError, DomainResult, PartyId,
    StockEffect, WarehouseId,
};
use stockledger_inventory::{
    validate_lines, DocumentLine, FulfillableOrder, OrderLine, StockDimension, StockDocument,
    StockPosting,
};

/// Purchase order status lifecycle.
///
/// `PartiallyBilled` and fulfilment-driven `Closed` are derived from billed
/// quantities; callers cannot request `PartiallyBilled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseOrderStatus {
    Draft,
    Confirmed,
    PartiallyBilled,
    Closed,
    Cancelled,
}

impl DocumentStatus for PurchaseOrderStatus {
    const DRAFT: Self = PurchaseOrderStatus::Draft;
    const POSTED: Self = PurchaseOrderStatus::Confirmed;
    const VOID: Option<Self> = None;

    fn as_str(self) -> &'static str {
        match self {
            PurchaseOrderStatus::Draft => "draft",
            PurchaseOrderStatus::Confirmed => "confirmed",
            PurchaseOrderStatus::PartiallyBilled => "partially_billed",
            PurchaseOrderStatus::Closed => "closed",
            PurchaseOrderStatus::Cancelled => "cancelled",
        }
    }

    fn can_transition_to(self, next: Self) -> bool {
        use PurchaseOrderStatus::*;
        matches!(
            (self, next),
            (Draft, Confirmed)
                | (Draft, Cancelled)
                | (Confirmed, Draft)
                | (Confirmed, Closed)
                | (Confirmed, Cancelled)
                | (PartiallyBilled, Closed)
                | (PartiallyBilled, Cancelled)
        )
    }

    fn stock_effect(from: Self, to: Self) -> StockEffect {
        use PurchaseOrderStatus::*;
        match (from, to) {
            (Draft, Confirmed) => StockEffect::Apply,
            (Confirmed, Draft) | (Confirmed, Closed) | (Confirmed, Cancelled) => StockEffect::Reverse,
            (PartiallyBilled, Closed) | (PartiallyBilled, Cancelled) => StockEffect::Reverse,
            _ => StockEffect::NoOp,
        }
    }

    fn holds_stock(self) -> bool {
        matches!(
            self,
            PurchaseOrderStatus::Confirmed | PurchaseOrderStatus::PartiallyBilled
        )
    }
}

/// Purchase order: commits `order_qty` for its open (unbilled) quantities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrder {
    pub header: DocumentHeader,
    pub status: PurchaseOrderStatus,
    pub supplier_id: PartyId,
    pub warehouse_id: WarehouseId,
    pub lines: Vec<OrderLine>,
}

impl PurchaseOrder {
    pub fn new(
        header: DocumentHeader,
        supplier_id: PartyId,
        warehouse_id: WarehouseId,
        lines: Vec<DocumentLine>,
    ) -> Self {
        Self {
            header,
            status: PurchaseOrderStatus::Draft,
            supplier_id,
            warehouse_id,
            lines: lines.into_iter().map(OrderLine::new).collect(),
        }
    }

    pub fn billed_qty(&self, line_no: u32) -> Option<Decimal> {
        self.lines
            .iter()
            .find(|l| l.line.line_no == line_no)
            .map(|l| l.fulfilled_qty)
    }
}

impl StockDocument for PurchaseOrder {
    const DOCUMENT_TYPE: DocumentType = DocumentType::PurchaseOrder;

    type Status = PurchaseOrderStatus;

    fn header(&self) -> &DocumentHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut DocumentHeader {
        &mut self.header
    }

    fn status(&self) -> PurchaseOrderStatus {
        self.status
    }

    fn set_status(&mut self, status: PurchaseOrderStatus) {
        self.status = status;
    }

    fn validate(&self) -> DomainResult<()> {
        validate_lines(self.lines.iter().map(|l| &l.line))?;
        for l in &self.lines {
            if l.fulfilled_qty < Decimal::ZERO || l.fulfilled_qty > l.line.qty {
                return Err(DomainError::invariant(format!(
                    "line {} billed qty out of range",
                    l.line.line_no
                )));
            }
        }
        if self.status.is_draft() && self.any_fulfilled() {
            return Err(DomainError::invariant("draft purchase order cannot carry billed qty"));
        }
        Ok(())
    }

    fn same_structure(&self, other: &Self) -> bool {
        self.header.same_structure(&other.header)
            && self.supplier_id == other.supplier_id
            && self.warehouse_id == other.warehouse_id
            && self.lines == other.lines
    }

    fn stock_postings(&self) -> Vec<StockPosting> {
        self.open_postings()
    }

    fn has_fulfilments(&self) -> bool {
        self.any_fulfilled()
    }

    fn check_transition(&self, next: PurchaseOrderStatus) -> DomainResult<()> {
        self.status.check_transition(next, Self::DOCUMENT_TYPE)?;
        if next.is_draft() && self.any_fulfilled() {
            return Err(DomainError::validation(
                "purchase order with billed quantities cannot return to draft",
            ));
        }
        Ok(())
    }
}

impl FulfillableOrder for PurchaseOrder {
    const OPEN_DIMENSION: StockDimension = StockDimension::Order;
    const OVERFULFIL_MESSAGE: &'static str = "bill qty must be equal or less than purchase order qty";

    const CONFIRMED: PurchaseOrderStatus = PurchaseOrderStatus::Confirmed;
    const PARTIAL: PurchaseOrderStatus = PurchaseOrderStatus::PartiallyBilled;
    const CLOSED: PurchaseOrderStatus = PurchaseOrderStatus::Closed;

    fn warehouse_id(&self) -> WarehouseId {
        self.warehouse_id
    }

    fn order_lines(&self) -> &[OrderLine] {
        &self.lines
    }

    fn order_lines_mut(&mut self) -> &mut [OrderLine] {
        &mut self.lines
    }
}
