//! Stock Summary rows and their arithmetic.
//!
//! A row aggregates every quantity dimension for one
//! `(business, warehouse, product, product type, batch)` key. Rows are only
//! ever changed by relative deltas; [`StockSummary::apply`] performs the add,
//! recomputes on-hand and enforces non-negativity as a single step.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{AggregateRoot, BusinessId, DomainError, DomainResult, WarehouseId};
use stockledger_products::{ProductId, ProductType};

/// Sentinel returned to callers that expect a plain number for untracked products.
pub const STOCK_NOT_TRACKED: Decimal = Decimal::NEGATIVE_ONE;

/// Identity of a Stock Summary row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StockKey {
    pub business_id: BusinessId,
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub product_type: ProductType,
    /// Empty when the product is not batch-managed.
    pub batch_number: String,
}

impl StockKey {
    pub fn new(
        business_id: BusinessId,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        product_type: ProductType,
        batch_number: impl Into<String>,
    ) -> Self {
        Self {
            business_id,
            warehouse_id,
            product_id,
            product_type,
            batch_number: batch_number.into(),
        }
    }
}

impl core::fmt::Display for StockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "warehouse {} product {} ({})",
            self.warehouse_id, self.product_id, self.product_type
        )?;
        if !self.batch_number.is_empty() {
            write!(f, " batch {}", self.batch_number)?;
        }
        Ok(())
    }
}

/// One quantity column of a Stock Summary row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockDimension {
    Order,
    Committed,
    Received,
    Sale,
    AdjustedIn,
    AdjustedOut,
    TransferIn,
    TransferOut,
}

impl StockDimension {
    pub const ALL: [StockDimension; 8] = [
        StockDimension::Order,
        StockDimension::Committed,
        StockDimension::Received,
        StockDimension::Sale,
        StockDimension::AdjustedIn,
        StockDimension::AdjustedOut,
        StockDimension::TransferIn,
        StockDimension::TransferOut,
    ];

    /// Column name in `stock_summaries`.
    pub fn column(self) -> &'static str {
        match self {
            StockDimension::Order => "order_qty",
            StockDimension::Committed => "committed_qty",
            StockDimension::Received => "received_qty",
            StockDimension::Sale => "sale_qty",
            StockDimension::AdjustedIn => "adjusted_qty_in",
            StockDimension::AdjustedOut => "adjusted_qty_out",
            StockDimension::TransferIn => "transfer_qty_in",
            StockDimension::TransferOut => "transfer_qty_out",
        }
    }

    /// How a unit of this dimension moves on-hand quantity.
    ///
    /// Commitments (order, committed) do not touch on-hand.
    pub fn on_hand_sign(self) -> Decimal {
        match self {
            StockDimension::Order | StockDimension::Committed => Decimal::ZERO,
            StockDimension::Received | StockDimension::AdjustedIn | StockDimension::TransferIn => {
                Decimal::ONE
            }
            StockDimension::Sale | StockDimension::AdjustedOut | StockDimension::TransferOut => {
                Decimal::NEGATIVE_ONE
            }
        }
    }
}

impl core::fmt::Display for StockDimension {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.column())
    }
}

/// Aggregate stock row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSummary {
    pub key: StockKey,
    pub order_qty: Decimal,
    pub committed_qty: Decimal,
    pub received_qty: Decimal,
    pub sale_qty: Decimal,
    pub adjusted_qty_in: Decimal,
    pub adjusted_qty_out: Decimal,
    pub transfer_qty_in: Decimal,
    pub transfer_qty_out: Decimal,
    pub current_qty: Decimal,
    pub last_movement_date: Option<NaiveDate>,
    pub version: u64,
}

impl StockSummary {
    /// A row that has never received a delta.
    pub fn empty(key: StockKey) -> Self {
        Self {
            key,
            order_qty: Decimal::ZERO,
            committed_qty: Decimal::ZERO,
            received_qty: Decimal::ZERO,
            sale_qty: Decimal::ZERO,
            adjusted_qty_in: Decimal::ZERO,
            adjusted_qty_out: Decimal::ZERO,
            transfer_qty_in: Decimal::ZERO,
            transfer_qty_out: Decimal::ZERO,
            current_qty: Decimal::ZERO,
            last_movement_date: None,
            version: 0,
        }
    }

    pub fn quantity(&self, dimension: StockDimension) -> Decimal {
        match dimension {
            StockDimension::Order => self.order_qty,
            StockDimension::Committed => self.committed_qty,
            StockDimension::Received => self.received_qty,
            StockDimension::Sale => self.sale_qty,
            StockDimension::AdjustedIn => self.adjusted_qty_in,
            StockDimension::AdjustedOut => self.adjusted_qty_out,
            StockDimension::TransferIn => self.transfer_qty_in,
            StockDimension::TransferOut => self.transfer_qty_out,
        }
    }

    fn quantity_mut(&mut self, dimension: StockDimension) -> &mut Decimal {
        match dimension {
            StockDimension::Order => &mut self.order_qty,
            StockDimension::Committed => &mut self.committed_qty,
            StockDimension::Received => &mut self.received_qty,
            StockDimension::Sale => &mut self.sale_qty,
            StockDimension::AdjustedIn => &mut self.adjusted_qty_in,
            StockDimension::AdjustedOut => &mut self.adjusted_qty_out,
            StockDimension::TransferIn => &mut self.transfer_qty_in,
            StockDimension::TransferOut => &mut self.transfer_qty_out,
        }
    }

    /// `received + adjusted_in − adjusted_out + transfer_in − transfer_out − sale`.
    pub fn computed_current(&self) -> Decimal {
        self.received_qty + self.adjusted_qty_in - self.adjusted_qty_out + self.transfer_qty_in
            - self.transfer_qty_out
            - self.sale_qty
    }

    /// Add `delta` to one dimension and return the next row state.
    ///
    /// Fails with `NegativeStock` when the delta lowers on-hand below zero;
    /// `self` is untouched either way. A successful apply bumps `version`.
    pub fn apply(
        &self,
        dimension: StockDimension,
        delta: Decimal,
        effective_date: NaiveDate,
    ) -> DomainResult<StockSummary> {
        let mut next = self.clone();
        *next.quantity_mut(dimension) += delta;
        next.current_qty = next.computed_current();

        if next.current_qty < self.current_qty && next.current_qty < Decimal::ZERO {
            return Err(DomainError::negative_stock(
                self.key.to_string(),
                next.current_qty,
            ));
        }

        next.last_movement_date = match self.last_movement_date {
            Some(d) if d >= effective_date => Some(d),
            _ => Some(effective_date),
        };
        next.version = self.version + 1;
        Ok(next)
    }
}

impl AggregateRoot for StockSummary {
    type Id = StockKey;

    fn id(&self) -> &Self::Id {
        &self.key
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// On-hand quantity as seen by stock queries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockLevel {
    Tracked(Decimal),
    NotTracked,
}

impl StockLevel {
    /// Plain-number form; untracked products report [`STOCK_NOT_TRACKED`].
    pub fn as_sentinel(self) -> Decimal {
        match self {
            StockLevel::Tracked(q) => q,
            StockLevel::NotTracked => STOCK_NOT_TRACKED,
        }
    }
}
