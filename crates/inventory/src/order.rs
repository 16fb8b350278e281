//! Order fulfilment ledger.
//!
//! Purchase and sales orders hold an open commitment (order / committed qty)
//! per line. Linked bills and invoices fulfil lines; the aggregate order
//! status is derived from the fulfilled quantities, never requested.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{DocumentStatus, DomainError, DomainResult, FulfilmentState, WarehouseId};

use crate::command::{FulfilmentLine, StockDocument, StockPosting};
use crate::line::DocumentLine;
use crate::stock::StockDimension;

/// Order line with its fulfilled quantity (billed or invoiced).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub line: DocumentLine,
    #[serde(default)]
    pub fulfilled_qty: Decimal,
}

impl OrderLine {
    pub fn new(line: DocumentLine) -> Self {
        Self {
            line,
            fulfilled_qty: Decimal::ZERO,
        }
    }

    pub fn open_qty(&self) -> Decimal {
        (self.line.qty - self.fulfilled_qty).max(Decimal::ZERO)
    }

    pub fn is_fulfilled(&self) -> bool {
        self.fulfilled_qty >= self.line.qty
    }
}

/// An order whose lines can be fulfilled by linked documents.
pub trait FulfillableOrder: StockDocument {
    /// Dimension holding the open commitment.
    const OPEN_DIMENSION: StockDimension;
    /// Message used when a fulfilment exceeds the ordered quantity.
    const OVERFULFIL_MESSAGE: &'static str;

    const CONFIRMED: Self::Status;
    const PARTIAL: Self::Status;
    const CLOSED: Self::Status;

    fn warehouse_id(&self) -> WarehouseId;
    fn order_lines(&self) -> &[OrderLine];
    fn order_lines_mut(&mut self) -> &mut [OrderLine];

    fn any_fulfilled(&self) -> bool {
        self.order_lines().iter().any(|l| l.fulfilled_qty > Decimal::ZERO)
    }

    fn fulfilment_state(&self) -> FulfilmentState {
        FulfilmentState::derive(self.order_lines().iter().map(|l| (l.line.qty, l.fulfilled_qty)))
    }

    fn status_for(state: FulfilmentState) -> Self::Status {
        match state {
            FulfilmentState::Unfulfilled => Self::CONFIRMED,
            FulfilmentState::Partial => Self::PARTIAL,
            FulfilmentState::Fulfilled => Self::CLOSED,
        }
    }

    /// Open for new fulfilments.
    fn accepts_fulfilment(&self) -> bool {
        let status = self.status();
        status == Self::CONFIRMED || status == Self::PARTIAL
    }

    /// Closed because every line was fulfilled, as opposed to closed by hand.
    fn is_closed_by_fulfilment(&self) -> bool {
        self.status() == Self::CLOSED && self.order_lines().iter().all(OrderLine::is_fulfilled)
    }

    /// Record fulfilment and return the open-commitment postings to release.
    ///
    /// The returned postings are to be applied with `StockEffect::Reverse`.
    fn fulfil(&mut self, lines: &[FulfilmentLine]) -> DomainResult<Vec<StockPosting>> {
        if !self.accepts_fulfilment() {
            return Err(DomainError::validation(format!(
                "{} {} is {} and cannot be fulfilled",
                Self::DOCUMENT_TYPE,
                self.header().document_number,
                self.status().as_str()
            )));
        }

        // Validate every line before touching any.
        let mut pending: HashMap<u32, Decimal> = HashMap::new();
        for req in lines {
            let line = find_line(self.order_lines(), req.order_line_no)?;
            check_key(line, req)?;
            if req.qty <= Decimal::ZERO {
                return Err(DomainError::validation("fulfilled qty must be positive"));
            }
            let requested = pending.entry(req.order_line_no).or_default();
            *requested += req.qty;
            if line.fulfilled_qty + *requested > line.line.qty {
                return Err(DomainError::validation(Self::OVERFULFIL_MESSAGE));
            }
        }

        let warehouse_id = self.warehouse_id();
        let mut postings = Vec::with_capacity(lines.len());
        for req in lines {
            let line = find_line_mut(self.order_lines_mut(), req.order_line_no)?;
            line.fulfilled_qty += req.qty;
            postings.push(open_posting::<Self>(warehouse_id, &line.line, req.qty));
        }

        let derived = Self::status_for(self.fulfilment_state());
        self.set_status(derived);
        Ok(postings)
    }

    /// Undo a fulfilment and return the open-commitment postings to restore.
    ///
    /// Cancelled and manually closed orders only adjust fulfilled quantities;
    /// for them the returned list is empty. Postings are to be applied with
    /// `StockEffect::Apply`.
    fn release(&mut self, lines: &[FulfilmentLine]) -> DomainResult<Vec<StockPosting>> {
        let tracking = self.accepts_fulfilment() || self.is_closed_by_fulfilment();

        let mut pending: HashMap<u32, Decimal> = HashMap::new();
        for req in lines {
            let line = find_line(self.order_lines(), req.order_line_no)?;
            check_key(line, req)?;
            let requested = pending.entry(req.order_line_no).or_default();
            *requested += req.qty;
            if *requested > line.fulfilled_qty {
                return Err(DomainError::invariant(format!(
                    "cannot release {} from line {} with only {} fulfilled",
                    requested, req.order_line_no, line.fulfilled_qty
                )));
            }
        }

        let warehouse_id = self.warehouse_id();
        let mut postings = Vec::new();
        for req in lines {
            let line = find_line_mut(self.order_lines_mut(), req.order_line_no)?;
            line.fulfilled_qty -= req.qty;
            if tracking {
                postings.push(open_posting::<Self>(warehouse_id, &line.line, req.qty));
            }
        }

        if tracking {
            let derived = Self::status_for(self.fulfilment_state());
            self.set_status(derived);
        }
        Ok(postings)
    }

    /// Open-commitment postings for every line (ordered minus fulfilled).
    fn open_postings(&self) -> Vec<StockPosting> {
        let warehouse_id = self.warehouse_id();
        self.order_lines()
            .iter()
            .filter(|l| l.open_qty() > Decimal::ZERO)
            .map(|l| open_posting::<Self>(warehouse_id, &l.line, l.open_qty()))
            .collect()
    }
}

fn open_posting<O: FulfillableOrder>(
    warehouse_id: WarehouseId,
    line: &DocumentLine,
    qty: Decimal,
) -> StockPosting {
    StockPosting {
        warehouse_id,
        product_id: line.product_id,
        product_type: line.product_type,
        batch_number: line.batch_number.clone(),
        dimension: O::OPEN_DIMENSION,
        qty,
    }
}

fn check_key(line: &OrderLine, req: &FulfilmentLine) -> DomainResult<()> {
    if req.matches(&line.line) {
        return Ok(());
    }
    Err(DomainError::validation(format!(
        "line for product {} ({}, batch '{}') cannot fulfil order line {} of product {} ({}, batch '{}')",
        req.product_id,
        req.product_type,
        req.batch_number,
        req.order_line_no,
        line.line.product_id,
        line.line.product_type,
        line.line.batch_number
    )))
}

fn find_line(lines: &[OrderLine], line_no: u32) -> DomainResult<&OrderLine> {
    lines
        .iter()
        .find(|l| l.line.line_no == line_no)
        .ok_or_else(|| DomainError::validation(format!("order line {line_no} not found")))
}

fn find_line_mut(lines: &mut [OrderLine], line_no: u32) -> DomainResult<&mut OrderLine> {
    lines
        .iter_mut()
        .find(|l| l.line.line_no == line_no)
        .ok_or_else(|| DomainError::validation(format!("order line {line_no} not found")))
}
