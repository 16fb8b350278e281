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

/// Sales order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SalesOrderStatus {
    Draft,
    Confirmed,
    PartiallyInvoiced,
    Closed,
    Cancelled,
}

impl DocumentStatus for SalesOrderStatus {
    const DRAFT: Self = SalesOrderStatus::Draft;
    const POSTED: Self = SalesOrderStatus::Confirmed;
    const VOID: Option<Self> = None;

    fn as_str(self) -> &'static str {
        match self {
            SalesOrderStatus::Draft => "draft",
            SalesOrderStatus::Confirmed => "confirmed",
            SalesOrderStatus::PartiallyInvoiced => "partially_invoiced",
            SalesOrderStatus::Closed => "closed",
            SalesOrderStatus::Cancelled => "cancelled",
        }
    }

    fn can_transition_to(self, next: Self) -> bool {
        use SalesOrderStatus::*;
        matches!(
            (self, next),
            (Draft, Confirmed)
                | (Draft, Cancelled)
                | (Confirmed, Draft)
                | (Confirmed, Cancelled)
                | (Confirmed, Closed)
                | (PartiallyInvoiced, Closed)
                | (PartiallyInvoiced, Cancelled)
        )
    }

    fn stock_effect(from: Self, to: Self) -> StockEffect {
        use SalesOrderStatus::*;
        match (from, to) {
            (Draft, Confirmed) => StockEffect::Apply,
            (Confirmed, Draft)
            | (Confirmed, Cancelled)
            | (Confirmed, Closed)
            | (PartiallyInvoiced, Closed)
            | (PartiallyInvoiced, Cancelled) => StockEffect::Reverse,
            _ => StockEffect::NoOp,
        }
    }

    fn holds_stock(self) -> bool {
        matches!(
            self,
            SalesOrderStatus::Confirmed | SalesOrderStatus::PartiallyInvoiced
        )
    }
}

/// Aggregate root: SalesOrder. Commits `committed_qty` for its uninvoiced quantities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesOrder {
    pub header: DocumentHeader,
    pub status: SalesOrderStatus,
    pub customer_id: PartyId,
    pub warehouse_id: WarehouseId,
    pub lines: Vec<OrderLine>,
}

impl SalesOrder {
    pub fn new(
        header: DocumentHeader,
        customer_id: PartyId,
        warehouse_id: WarehouseId,
        lines: Vec<DocumentLine>,
    ) -> Self {
        Self {
            header,
            status: SalesOrderStatus::Draft,
            customer_id,
            warehouse_id,
            lines: lines.into_iter().map(OrderLine::new).collect(),
        }
    }

    pub fn invoiced_qty(&self, line_no: u32) -> Option<Decimal> {
        self.lines
            .iter()
            .find(|l| l.line.line_no == line_no)
            .map(|l| l.fulfilled_qty)
    }
}

impl StockDocument for SalesOrder {
    const DOCUMENT_TYPE: DocumentType = DocumentType::SalesOrder;

    type Status = SalesOrderStatus;

    fn header(&self) -> &DocumentHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut DocumentHeader {
        &mut self.header
    }

    fn status(&self) -> SalesOrderStatus {
        self.status
    }

    fn set_status(&mut self, status: SalesOrderStatus) {
        self.status = status;
    }

    fn validate(&self) -> DomainResult<()> {
        validate_lines(self.lines.iter().map(|l| &l.line))?;
        if self
            .lines
            .iter()
            .any(|l| l.fulfilled_qty < Decimal::ZERO || l.fulfilled_qty > l.line.qty)
        {
            return Err(DomainError::invariant("invoiced qty out of range"));
        }
        if self.status.is_draft() && self.any_fulfilled() {
            return Err(DomainError::invariant("draft sales order cannot carry invoiced qty"));
        }
        Ok(())
    }

    fn same_structure(&self, other: &Self) -> bool {
        self.header.same_structure(&other.header)
            && self.customer_id == other.customer_id
            && self.warehouse_id == other.warehouse_id
            && self.lines == other.lines
    }

    fn stock_postings(&self) -> Vec<StockPosting> {
        self.open_postings()
    }

    fn has_fulfilments(&self) -> bool {
        self.any_fulfilled()
    }

    fn check_transition(&self, next: SalesOrderStatus) -> DomainResult<()> {
        self.status.check_transition(next, Self::DOCUMENT_TYPE)?;
        if next.is_draft() && self.any_fulfilled() {
            return Err(DomainError::validation(
                "sales order with invoiced quantities cannot return to draft",
            ));
        }
        Ok(())
    }
}

impl FulfillableOrder for SalesOrder {
    const OPEN_DIMENSION: StockDimension = StockDimension::Committed;
    const OVERFULFIL_MESSAGE: &'static str = "invoice qty must be equal or less than sales order qty";

    const CONFIRMED: SalesOrderStatus = SalesOrderStatus::Confirmed;
    const PARTIAL: SalesOrderStatus = SalesOrderStatus::PartiallyInvoiced;
    const CLOSED: SalesOrderStatus = SalesOrderStatus::Closed;

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
