use serde::{Deserialize, Serialize};

use stockledger_core::{
    DocumentHeader, DocumentStatus, DocumentType, DomainError, DomainResult, StockEffect,
    WarehouseId,
};

use crate::command::{StockDocument, StockPosting};
use crate::line::{validate_lines, DocumentLine};
use crate::stock::StockDimension;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Draft,
    Confirmed,
}

impl DocumentStatus for TransferStatus {
    const DRAFT: Self = TransferStatus::Draft;
    const POSTED: Self = TransferStatus::Confirmed;
    const VOID: Option<Self> = None;

    fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Draft => "draft",
            TransferStatus::Confirmed => "confirmed",
        }
    }

    fn can_transition_to(self, next: Self) -> bool {
        matches!((self, next), (TransferStatus::Draft, TransferStatus::Confirmed))
    }

    fn stock_effect(from: Self, to: Self) -> StockEffect {
        match (from, to) {
            (TransferStatus::Draft, TransferStatus::Confirmed) => StockEffect::Apply,
            _ => StockEffect::NoOp,
        }
    }

    fn holds_stock(self) -> bool {
        self == TransferStatus::Confirmed
    }
}

/// Moves stock between two warehouses of the same business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOrder {
    pub header: DocumentHeader,
    pub status: TransferStatus,
    pub source_warehouse_id: WarehouseId,
    pub destination_warehouse_id: WarehouseId,
    pub lines: Vec<DocumentLine>,
}

impl TransferOrder {
    pub fn new(
        header: DocumentHeader,
        source_warehouse_id: WarehouseId,
        destination_warehouse_id: WarehouseId,
        lines: Vec<DocumentLine>,
    ) -> Self {
        Self {
            header,
            status: TransferStatus::Draft,
            source_warehouse_id,
            destination_warehouse_id,
            lines,
        }
    }
}

impl StockDocument for TransferOrder {
    const DOCUMENT_TYPE: DocumentType = DocumentType::TransferOrder;
    const DELETE_REVERSES: bool = true;

    type Status = TransferStatus;

    fn header(&self) -> &DocumentHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut DocumentHeader {
        &mut self.header
    }

    fn status(&self) -> TransferStatus {
        self.status
    }

    fn set_status(&mut self, status: TransferStatus) {
        self.status = status;
    }

    fn validate(&self) -> DomainResult<()> {
        if self.source_warehouse_id == self.destination_warehouse_id {
            return Err(DomainError::validation(
                "source and destination warehouse must differ",
            ));
        }
        validate_lines(&self.lines)
    }

    fn same_structure(&self, other: &Self) -> bool {
        self.header.same_structure(&other.header)
            && self.source_warehouse_id == other.source_warehouse_id
            && self.destination_warehouse_id == other.destination_warehouse_id
            && self.lines == other.lines
    }

    /// Outgoing postings first, so a short source fails before anything lands.
    fn stock_postings(&self) -> Vec<StockPosting> {
        let leg = |warehouse_id, dimension, line: &DocumentLine| StockPosting {
            warehouse_id,
            product_id: line.product_id,
            product_type: line.product_type,
            batch_number: line.batch_number.clone(),
            dimension,
            qty: line.qty,
        };
        let outgoing = self
            .lines
            .iter()
            .map(|l| leg(self.source_warehouse_id, StockDimension::TransferOut, l));
        let incoming = self
            .lines
            .iter()
            .map(|l| leg(self.destination_warehouse_id, StockDimension::TransferIn, l));
        outgoing.chain(incoming).collect()
    }
}
