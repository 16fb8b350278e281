//! Sales Orders domain module.
//!
//! This crate contains business rules for sales orders, implemented purely as
//! deterministic domain logic (no IO, no HTTP, no storage).

pub mod order;

pub use order::{SalesOrder, SalesOrderStatus};
