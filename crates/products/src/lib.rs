//! Products domain module.
//!
//! Resolves the catalogue facts the stock ledger needs: which products exist,
//! which type they are, and whether they are inventory-tracked.

pub mod catalog;
pub mod product;

pub use catalog::InMemoryProductCatalog;
pub use product::{
    Product, ProductId, ProductInterface, ProductOrVariant, ProductResolver, ProductType,
    ProductVariant,
};
