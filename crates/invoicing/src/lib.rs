//! Invoicing domain module.
//!
//! Sales invoices and customer credit notes, implemented purely as
//! deterministic domain logic (no IO, no HTTP, no storage).

pub mod credit_note;
pub mod invoice;

pub use credit_note::{CreditNote, CreditNoteStatus};
pub use invoice::{InvoiceStatus, SalesInvoice};
