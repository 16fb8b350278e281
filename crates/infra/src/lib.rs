//! Infrastructure layer: transactions, business locks, the Stock Summary
//! Store, the Stock Command Engine, the transactional outbox and the
//! document service that drives them.

pub mod config;
pub mod error;
pub mod lock;
pub mod numbering;
pub mod outbox;
pub mod repository;
pub mod retry;
pub mod services;
pub mod stock_commands;
pub mod stock_store;
pub mod tx;

#[cfg(test)]
mod integration_tests;

pub use config::{DatabaseConfig, LedgerConfig, LockConfig, OutboxConfig, RetryConfig};
pub use error::{LedgerError, LedgerResult};
pub use lock::{LockDomain, StockLock, acquire_stock_lock, lock_key};
pub use numbering::{DefaultPrefixes, Numbering, PrefixProvider};
pub use outbox::{OutboxRelay, RelayReport, publish_to_accounting};
pub use repository::{Attachment, Stored};
pub use retry::RetryPolicy;
pub use services::{DocumentService, OperationContext};
pub use stock_commands::StockCommandEngine;
pub use stock_store::{
    get_product_stock, update_stock_summary, update_stock_summary_adjusted_qty_in,
    update_stock_summary_adjusted_qty_out, update_stock_summary_committed_qty,
    update_stock_summary_order_qty, update_stock_summary_received_qty,
    update_stock_summary_sale_qty, update_stock_summary_transfer_qty_in,
    update_stock_summary_transfer_qty_out,
};
pub use tx::{Database, DocumentRow, InMemoryDatabase, LedgerTx, PgDatabase, PgLedgerTx};
