use std::collections::HashSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{DocumentId, DocumentType, DomainError, DomainResult};
use stockledger_products::{ProductId, ProductType};

use crate::command::{FulfilmentLine, FulfilmentRequest};

/// Detail line shared by purchase, sales and transfer documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentLine {
    pub line_no: u32,
    pub product_id: ProductId,
    pub product_type: ProductType,
    #[serde(default)]
    pub batch_number: String,
    pub qty: Decimal,
}

impl DocumentLine {
    pub fn new(line_no: u32, product_id: ProductId, product_type: ProductType, qty: Decimal) -> Self {
        Self {
            line_no,
            product_id,
            product_type,
            batch_number: String::new(),
            qty,
        }
    }

    pub fn with_batch(mut self, batch_number: impl Into<String>) -> Self {
        self.batch_number = batch_number.into();
        self
    }
}

/// Line of a bill or invoice, optionally pointing at the order line it fulfils.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedLine {
    pub line: DocumentLine,
    #[serde(default)]
    pub order_line_no: Option<u32>,
}

impl LinkedLine {
    pub fn unlinked(line: DocumentLine) -> Self {
        Self {
            line,
            order_line_no: None,
        }
    }

    pub fn linked(line: DocumentLine, order_line_no: u32) -> Self {
        Self {
            line,
            order_line_no: Some(order_line_no),
        }
    }
}

/// Fulfilment a linked document records against `order_id`.
///
/// `None` when there is no order or no line points at one.
pub fn fulfilment_request(
    order_type: DocumentType,
    order_id: Option<DocumentId>,
    lines: &[LinkedLine],
) -> Option<FulfilmentRequest> {
    let order_id = order_id?;
    let lines: Vec<FulfilmentLine> = lines
        .iter()
        .filter_map(|l| {
            l.order_line_no
                .map(|order_line_no| FulfilmentLine::new(order_line_no, &l.line))
        })
        .collect();
    if lines.is_empty() {
        return None;
    }
    Some(FulfilmentRequest {
        order_type,
        order_id,
        lines,
    })
}

/// Linked lines require an order; unlinked documents may not reference order lines.
pub fn validate_links(order_id: Option<DocumentId>, lines: &[LinkedLine]) -> DomainResult<()> {
    if order_id.is_none() && lines.iter().any(|l| l.order_line_no.is_some()) {
        return Err(DomainError::validation(
            "order line reference requires a linked order",
        ));
    }
    validate_lines(lines.iter().map(|l| &l.line))
}

/// Lines must exist, carry positive quantities and unique line numbers.
pub fn validate_lines<'a>(lines: impl IntoIterator<Item = &'a DocumentLine>) -> DomainResult<()> {
    let mut seen = HashSet::new();
    for line in lines {
        if line.qty <= Decimal::ZERO {
            return Err(DomainError::validation(format!(
                "line {} qty must be positive",
                line.line_no
            )));
        }
        if !seen.insert(line.line_no) {
            return Err(DomainError::validation(format!(
                "duplicate line number {}",
                line.line_no
            )));
        }
    }
    if seen.is_empty() {
        return Err(DomainError::validation("document must have at least one line"));
    }
    Ok(())
}
