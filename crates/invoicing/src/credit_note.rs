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
pub enum CreditNoteStatus {
    Draft,
    Confirmed,
    Void,
    Closed,
}

impl DocumentStatus for CreditNoteStatus {
    const DRAFT: Self = CreditNoteStatus::Draft;
    const POSTED: Self = CreditNoteStatus::Confirmed;
    const VOID: Option<Self> = Some(CreditNoteStatus::Void);

    fn as_str(self) -> &'static str {
        match self {
            CreditNoteStatus::Draft => "draft",
            CreditNoteStatus::Confirmed => "confirmed",
            CreditNoteStatus::Void => "void",
            CreditNoteStatus::Closed => "closed",
        }
    }

    fn can_transition_to(self, next: Self) -> bool {
        use CreditNoteStatus::*;
        matches!(
            (self, next),
            (Draft, Confirmed) | (Confirmed, Draft) | (Confirmed, Void) | (Confirmed, Closed)
        )
    }

    // Closing (fully applied) keeps the returned goods in stock.
    fn stock_effect(from: Self, to: Self) -> StockEffect {
        use CreditNoteStatus::*;
        match (from, to) {
            (Draft, Confirmed) => StockEffect::Apply,
            (Confirmed, Draft) | (Confirmed, Void) => StockEffect::Reverse,
            _ => StockEffect::NoOp,
        }
    }

    fn holds_stock(self) -> bool {
        matches!(self, CreditNoteStatus::Confirmed | CreditNoteStatus::Closed)
    }
}

/// Customer return: goods come back in through `received_qty`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditNote {
    pub header: DocumentHeader,
    pub status: CreditNoteStatus,
    pub customer_id: PartyId,
    pub warehouse_id: WarehouseId,
    pub lines: Vec<DocumentLine>,
    /// Credits used against invoices plus refunds paid out.
    #[serde(default)]
    pub applied_amount: Decimal,
}

impl CreditNote {
    pub fn new(
        header: DocumentHeader,
        customer_id: PartyId,
        warehouse_id: WarehouseId,
        lines: Vec<DocumentLine>,
    ) -> Self {
        Self {
            header,
            status: CreditNoteStatus::Draft,
            customer_id,
            warehouse_id,
            lines,
            applied_amount: Decimal::ZERO,
        }
    }
}

impl StockDocument for CreditNote {
    const DOCUMENT_TYPE: DocumentType = DocumentType::CreditNote;

    type Status = CreditNoteStatus;

    fn header(&self) -> &DocumentHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut DocumentHeader {
        &mut self.header
    }

    fn status(&self) -> CreditNoteStatus {
        self.status
    }

    fn set_status(&mut self, status: CreditNoteStatus) {
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
            && self.customer_id == other.customer_id
            && self.warehouse_id == other.warehouse_id
            && self.lines == other.lines
    }

    fn stock_postings(&self) -> Vec<StockPosting> {
        self.lines
            .iter()
            .map(|l| StockPosting {
                warehouse_id: self.warehouse_id,
                product_id: l.product_id,
                product_type: l.product_type,
                batch_number: l.batch_number.clone(),
                dimension: StockDimension::Received,
                qty: l.qty,
            })
            .collect()
    }

    fn has_settlements(&self) -> bool {
        self.applied_amount > Decimal::ZERO
    }

    fn clear_settlements(&mut self) {
        self.applied_amount = Decimal::ZERO;
    }

    fn check_transition(&self, next: CreditNoteStatus) -> DomainResult<()> {
        self.status.check_transition(next, Self::DOCUMENT_TYPE)?;
        if matches!(next, CreditNoteStatus::Draft | CreditNoteStatus::Void) && self.has_settlements()
        {
            return Err(DomainError::validation(
                "credit note has been used or refunded; remove those first",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use stockledger_core::{BranchId, BusinessId};
    use stockledger_inventory::StockCommand;
    use stockledger_products::{ProductId, ProductType};

    fn test_credit_note() -> CreditNote {
        let header = DocumentHeader::new(
            BusinessId::new(),
            BranchId(1),
            NaiveDate::from_ymd_opt(2024, 3, 8).unwrap(),
        );
        CreditNote::new(
            header,
            PartyId(9),
            WarehouseId(1),
            vec![DocumentLine::new(1, ProductId(7), ProductType::Single, Decimal::from(1))],
        )
    }

    #[test]
    fn confirm_returns_goods_to_stock() {
        let mut cn = test_credit_note();
        cn.set_status(CreditNoteStatus::Confirmed);
        let cmd = StockCommand::for_transition(&cn, CreditNoteStatus::Draft);
        assert_eq!(cmd.effect, StockEffect::Apply);
        assert_eq!(cmd.postings[0].dimension, StockDimension::Received);
    }

    #[test]
    fn closing_keeps_stock() {
        let mut cn = test_credit_note();
        cn.set_status(CreditNoteStatus::Closed);
        assert!(StockCommand::for_transition(&cn, CreditNoteStatus::Confirmed).is_noop());
    }

    #[test]
    fn applied_credit_cannot_be_voided() {
        let mut cn = test_credit_note();
        cn.set_status(CreditNoteStatus::Confirmed);
        cn.applied_amount = Decimal::from(10);
        assert!(cn.check_transition(CreditNoteStatus::Void).is_err());
        assert!(cn.check_transition(CreditNoteStatus::Closed).is_ok());
    }
}
