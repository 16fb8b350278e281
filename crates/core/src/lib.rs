//! `stockledger-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod document;
pub mod error;
pub mod id;

pub use aggregate::{AggregateRoot, ExpectedVersion};
pub use document::{DocumentHeader, DocumentStatus, DocumentType, FulfilmentState, StockEffect};
pub use error::{DomainError, DomainResult};
pub use id::{BranchId, BusinessId, DocumentId, PartyId, WarehouseId};
