//! Stock Summary Store.
//!
//! Every write goes through [`update_stock_summary`]: locate or create the
//! row, apply the delta (add, recompute on-hand, reject negative stock) and
//! write it back against the version that was read. Writes demand a
//! [`StockLock`] so the negative-stock decision is always made under the
//! business lock.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::{debug, instrument};

use stockledger_core::{DomainError, ExpectedVersion};
use stockledger_inventory::{StockDimension, StockKey, StockLevel, StockSummary};
use stockledger_products::{ProductInterface, ProductResolver};

use crate::error::LedgerResult;
use crate::lock::{LockDomain, StockLock};
use crate::tx::LedgerTx;

/// Add `delta` to one dimension of the row at `key`.
///
/// Returns the resulting row, or `None` for Input-type products, which never
/// get a row. A zero delta returns the current row without writing.
#[instrument(
    skip(tx, lock),
    fields(key = %key, dimension = %dimension, delta = %delta),
    err
)]
pub async fn update_stock_summary(
    tx: &mut dyn LedgerTx,
    lock: &StockLock,
    dimension: StockDimension,
    key: &StockKey,
    delta: Decimal,
    effective_date: NaiveDate,
) -> LedgerResult<Option<StockSummary>> {
    lock.check(key.business_id)?;
    if !tx.holds_lock(key.business_id, LockDomain::Stock) {
        return Err(DomainError::invariant(format!(
            "stock lock of business {} is not held by this transaction",
            key.business_id
        ))
        .into());
    }

    if key.product_type.is_input() {
        return Ok(None);
    }

    let current = tx.stock_summary(key).await?;
    if delta.is_zero() {
        return Ok(current);
    }

    let current = current.unwrap_or_else(|| StockSummary::empty(key.clone()));
    let next = current.apply(dimension, delta, effective_date)?;
    tx.put_stock_summary(&next, ExpectedVersion::Exact(current.version))
        .await?;

    debug!(current_qty = %next.current_qty, version = next.version, "stock summary updated");
    Ok(Some(next))
}

macro_rules! dimension_updates {
    ($($name:ident => $dimension:ident),* $(,)?) => {
        $(
            #[doc = concat!("[`update_stock_summary`] on `StockDimension::", stringify!($dimension), "`.")]
            pub async fn $name(
                tx: &mut dyn LedgerTx,
                lock: &StockLock,
                key: &StockKey,
                delta: Decimal,
                effective_date: NaiveDate,
            ) -> LedgerResult<Option<StockSummary>> {
                update_stock_summary(tx, lock, StockDimension::$dimension, key, delta, effective_date).await
            }
        )*
    };
}

dimension_updates! {
    update_stock_summary_order_qty => Order,
    update_stock_summary_committed_qty => Committed,
    update_stock_summary_received_qty => Received,
    update_stock_summary_sale_qty => Sale,
    update_stock_summary_adjusted_qty_in => AdjustedIn,
    update_stock_summary_adjusted_qty_out => AdjustedOut,
    update_stock_summary_transfer_qty_in => TransferIn,
    update_stock_summary_transfer_qty_out => TransferOut,
}

/// On-hand quantity at `key`, including this transaction's own deltas.
///
/// Input-type and untracked products are `NotTracked`; a tracked product
/// without a row has zero stock.
pub async fn get_product_stock(
    tx: &mut dyn LedgerTx,
    products: &dyn ProductResolver,
    key: &StockKey,
) -> LedgerResult<StockLevel> {
    if key.product_type.is_input() {
        return Ok(StockLevel::NotTracked);
    }
    let product = products.product_or_variant(key.business_id, key.product_type, key.product_id)?;
    if !product.is_inventory_tracked() {
        return Ok(StockLevel::NotTracked);
    }

    let row = tx.stock_summary(key).await?;
    Ok(StockLevel::Tracked(
        row.map(|r| r.current_qty).unwrap_or(Decimal::ZERO),
    ))
}
