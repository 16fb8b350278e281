//! Inventory domain module.
//!
//! Stock Summary arithmetic and the stock-command vocabulary shared by every
//! document type, implemented purely as deterministic domain logic (no IO,
//! no storage).

pub mod adjustment;
pub mod command;
pub mod line;
pub mod order;
pub mod stock;
pub mod transfer;

pub use adjustment::{AdjustmentLine, AdjustmentStatus, InventoryAdjustment};
pub use command::{FulfilmentLine, FulfilmentRequest, StockCommand, StockDocument, StockPosting};
pub use line::{fulfilment_request, validate_lines, validate_links, DocumentLine, LinkedLine};
pub use order::{FulfillableOrder, OrderLine};
pub use stock::{StockDimension, StockKey, StockLevel, StockSummary, STOCK_NOT_TRACKED};
pub use transfer::{TransferOrder, TransferStatus};
