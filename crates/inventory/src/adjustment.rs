use std::collections::HashSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    DocumentHeader, DocumentStatus, DocumentType, DomainError, DomainResult, StockEffect,
    WarehouseId,
};
use stockledger_products::{ProductId, ProductType};

use crate::command::{StockDocument, StockPosting};
use crate::stock::StockDimension;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentStatus {
    Draft,
    Adjusted,
}

impl DocumentStatus for AdjustmentStatus {
    const DRAFT: Self = AdjustmentStatus::Draft;
    const POSTED: Self = AdjustmentStatus::Adjusted;
    const VOID: Option<Self> = None;

    fn as_str(self) -> &'static str {
        match self {
            AdjustmentStatus::Draft => "draft",
            AdjustmentStatus::Adjusted => "adjusted",
        }
    }

    fn can_transition_to(self, next: Self) -> bool {
        matches!((self, next), (AdjustmentStatus::Draft, AdjustmentStatus::Adjusted))
    }

    // The reverse edge is deletion, handled through `DELETE_REVERSES`.
    fn stock_effect(from: Self, to: Self) -> StockEffect {
        match (from, to) {
            (AdjustmentStatus::Draft, AdjustmentStatus::Adjusted) => StockEffect::Apply,
            _ => StockEffect::NoOp,
        }
    }

    fn holds_stock(self) -> bool {
        self == AdjustmentStatus::Adjusted
    }
}

/// Signed adjustment line: positive adds stock, negative removes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentLine {
    pub line_no: u32,
    pub product_id: ProductId,
    pub product_type: ProductType,
    #[serde(default)]
    pub batch_number: String,
    pub qty_adjusted: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryAdjustment {
    pub header: DocumentHeader,
    pub status: AdjustmentStatus,
    pub warehouse_id: WarehouseId,
    pub reason: String,
    pub lines: Vec<AdjustmentLine>,
}

impl InventoryAdjustment {
    pub fn new(
        header: DocumentHeader,
        warehouse_id: WarehouseId,
        reason: impl Into<String>,
        lines: Vec<AdjustmentLine>,
    ) -> Self {
        Self {
            header,
            status: AdjustmentStatus::Draft,
            warehouse_id,
            reason: reason.into(),
            lines,
        }
    }
}

impl StockDocument for InventoryAdjustment {
    const DOCUMENT_TYPE: DocumentType = DocumentType::InventoryAdjustment;
    const DELETE_REVERSES: bool = true;

    type Status = AdjustmentStatus;

    fn header(&self) -> &DocumentHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut DocumentHeader {
        &mut self.header
    }

    fn status(&self) -> AdjustmentStatus {
        self.status
    }

    fn set_status(&mut self, status: AdjustmentStatus) {
        self.status = status;
    }

    fn validate(&self) -> DomainResult<()> {
        if self.reason.trim().is_empty() {
            return Err(DomainError::validation("adjustment reason cannot be empty"));
        }
        if self.lines.is_empty() {
            return Err(DomainError::validation("document must have at least one line"));
        }
        let mut seen = HashSet::new();
        for line in &self.lines {
            if line.qty_adjusted.is_zero() {
                return Err(DomainError::validation(format!(
                    "line {} adjusted qty cannot be zero",
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
        Ok(())
    }

    fn same_structure(&self, other: &Self) -> bool {
        self.header.same_structure(&other.header)
            && self.warehouse_id == other.warehouse_id
            && self.lines == other.lines
    }

    fn stock_postings(&self) -> Vec<StockPosting> {
        self.lines
            .iter()
            .map(|l| {
                let dimension = if l.qty_adjusted.is_sign_negative() {
                    StockDimension::AdjustedOut
                } else {
                    StockDimension::AdjustedIn
                };
                StockPosting {
                    warehouse_id: self.warehouse_id,
                    product_id: l.product_id,
                    product_type: l.product_type,
                    batch_number: l.batch_number.clone(),
                    dimension,
                    qty: l.qty_adjusted.abs(),
                }
            })
            .collect()
    }
}
