use serde::{Deserialize, Serialize};

use stockledger_core::{AggregateRoot, BusinessId, DomainError, DomainResult};

/// Product identifier (scoped by business).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub i64);

impl ProductId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl core::fmt::Display for ProductId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<i64> for ProductId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Kind of catalogue entry a document line points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductType {
    Single,
    Group,
    Variant,
    Composite,
    /// Raw input consumed by production; never stock-tracked.
    Input,
}

impl ProductType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProductType::Single => "single",
            ProductType::Group => "group",
            ProductType::Variant => "variant",
            ProductType::Composite => "composite",
            ProductType::Input => "input",
        }
    }

    pub fn parse(tag: &str) -> DomainResult<Self> {
        match tag {
            "single" => Ok(ProductType::Single),
            "group" => Ok(ProductType::Group),
            "variant" => Ok(ProductType::Variant),
            "composite" => Ok(ProductType::Composite),
            "input" => Ok(ProductType::Input),
            other => Err(DomainError::validation(format!("unknown product type '{other}'"))),
        }
    }

    pub fn is_input(self) -> bool {
        self == ProductType::Input
    }
}

impl core::fmt::Display for ProductType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the ledger needs to know about a product or a variant.
pub trait ProductInterface {
    /// `<= 0` means the product is not inventory-tracked.
    fn inventory_account_id(&self) -> i64;

    fn is_inventory_tracked(&self) -> bool {
        self.inventory_account_id() > 0
    }
}

/// Catalogue product (single, group, composite or input).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub business_id: BusinessId,
    pub product_type: ProductType,
    pub name: String,
    pub sku: String,
    pub inventory_account_id: i64,
}

impl Product {
    pub fn new(
        business_id: BusinessId,
        id: ProductId,
        product_type: ProductType,
        name: impl Into<String>,
        inventory_account_id: i64,
    ) -> DomainResult<Self> {
        if product_type == ProductType::Variant {
            return Err(DomainError::validation(
                "variants are registered as ProductVariant, not Product",
            ));
        }
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::validation("product name cannot be empty"));
        }
        Ok(Self {
            id,
            business_id,
            product_type,
            sku: String::new(),
            name,
            inventory_account_id,
        })
    }

    pub fn with_sku(mut self, sku: impl Into<String>) -> Self {
        self.sku = sku.into();
        self
    }
}

impl ProductInterface for Product {
    fn inventory_account_id(&self) -> i64 {
        self.inventory_account_id
    }
}

impl AggregateRoot for Product {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    // Catalogue rows are owned by another service; the ledger only reads them.
    fn version(&self) -> u64 {
        0
    }
}

/// Variant of a group product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductVariant {
    pub id: ProductId,
    pub business_id: BusinessId,
    pub group_id: ProductId,
    pub name: String,
    pub sku: String,
    pub inventory_account_id: i64,
}

impl ProductInterface for ProductVariant {
    fn inventory_account_id(&self) -> i64 {
        self.inventory_account_id
    }
}

/// Result of resolving a `(product_type, product_id)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProductOrVariant {
    Product(Product),
    Variant(ProductVariant),
}

impl ProductInterface for ProductOrVariant {
    fn inventory_account_id(&self) -> i64 {
        match self {
            ProductOrVariant::Product(p) => p.inventory_account_id,
            ProductOrVariant::Variant(v) => v.inventory_account_id,
        }
    }
}

/// Catalogue lookup consumed by the stock engine.
pub trait ProductResolver: Send + Sync {
    /// Resolve a product, or a variant when `product_type` is `Variant`.
    ///
    /// Unknown ids are `DomainError::NotFound`.
    fn product_or_variant(
        &self,
        business_id: BusinessId,
        product_type: ProductType,
        product_id: ProductId,
    ) -> DomainResult<ProductOrVariant>;
}
