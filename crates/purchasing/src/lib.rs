//! Purchasing domain module.
//!
//! Purchase orders, supplier bills and supplier credits with their status
//! tables, implemented purely as deterministic domain logic (no IO).

pub mod bill;
pub mod purchase_order;
pub mod supplier_credit;

pub use bill::{Bill, BillStatus};
pub use purchase_order::{PurchaseOrder, PurchaseOrderStatus};
pub use supplier_credit::{SupplierCredit, SupplierCreditStatus};
