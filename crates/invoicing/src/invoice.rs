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

/// Invoice status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Confirmed,
    Void,
    PartialPaid,
    Paid,
}

impl InvoiceStatus {
    /// Issued and still collectable.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            InvoiceStatus::Confirmed | InvoiceStatus::PartialPaid | InvoiceStatus::Paid
        )
    }
}

impl DocumentStatus for InvoiceStatus {
    const DRAFT: Self = InvoiceStatus::Draft;
    const POSTED: Self = InvoiceStatus::Confirmed;
    const VOID: Option<Self> = Some(InvoiceStatus::Void);

    fn as_str(self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Confirmed => "confirmed",
            InvoiceStatus::Void => "void",
            InvoiceStatus::PartialPaid => "partial_paid",
            InvoiceStatus::Paid => "paid",
        }
    }

    fn can_transition_to(self, next: Self) -> bool {
        use InvoiceStatus::*;
        match (self, next) {
            (Draft, Confirmed) | (Confirmed, Draft) | (Confirmed, Void) => true,
            (a, b) => a != b && a.is_open() && b.is_open(),
        }
    }

    fn stock_effect(from: Self, to: Self) -> StockEffect {
        use InvoiceStatus::*;
        match (from, to) {
            (Draft, Confirmed) => StockEffect::Apply,
            (Confirmed, Draft) | (Confirmed, Void) => StockEffect::Reverse,
            _ => StockEffect::NoOp,
        }
    }

    fn holds_stock(self) -> bool {
        self.is_open()
    }
}

/// Sales invoice: ships goods out through `sale_qty`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesInvoice {
    pub header: DocumentHeader,
    pub status: InvoiceStatus,
    pub customer_id: PartyId,
    pub warehouse_id: WarehouseId,
    #[serde(default)]
    pub sales_order_id: Option<DocumentId>,
    pub lines: Vec<LinkedLine>,
    #[serde(default)]
    pub paid_amount: Decimal,
}

impl SalesInvoice {
    pub fn new(
        header: DocumentHeader,
        customer_id: PartyId,
        warehouse_id: WarehouseId,
        lines: Vec<LinkedLine>,
    ) -> Self {
        Self {
            header,
            status: InvoiceStatus::Draft,
            customer_id,
            warehouse_id,
            sales_order_id: None,
            lines,
            paid_amount: Decimal::ZERO,
        }
    }

    pub fn for_sales_order(mut self, sales_order_id: DocumentId) -> Self {
        self.sales_order_id = Some(sales_order_id);
        self
    }
}

impl StockDocument for SalesInvoice {
    const DOCUMENT_TYPE: DocumentType = DocumentType::SalesInvoice;

    type Status = InvoiceStatus;

    fn header(&self) -> &DocumentHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut DocumentHeader {
        &mut self.header
    }

    fn status(&self) -> InvoiceStatus {
        self.status
    }

    fn set_status(&mut self, status: InvoiceStatus) {
        self.status = status;
    }

    fn validate(&self) -> DomainResult<()> {
        if self.paid_amount < Decimal::ZERO {
            return Err(DomainError::validation("paid amount cannot be negative"));
        }
        validate_links(self.sales_order_id, &self.lines)
    }

    fn same_structure(&self, other: &Self) -> bool {
        self.header.same_structure(&other.header)
            && self.customer_id == other.customer_id
            && self.warehouse_id == other.warehouse_id
            && self.sales_order_id == other.sales_order_id
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
                dimension: StockDimension::Sale,
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
        fulfilment_request(DocumentType::SalesOrder, self.sales_order_id, &self.lines)
    }

    fn check_transition(&self, next: InvoiceStatus) -> DomainResult<()> {
        self.status.check_transition(next, Self::DOCUMENT_TYPE)?;
        if matches!(next, InvoiceStatus::Draft | InvoiceStatus::Void) && self.has_settlements() {
            return Err(DomainError::validation(
                "invoice has payments recorded; remove them first",
            ));
        }
        Ok(())
    }
}
