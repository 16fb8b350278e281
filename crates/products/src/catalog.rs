use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use stockledger_core::{BusinessId, DomainError, DomainResult};

use crate::product::{Product, ProductId, ProductOrVariant, ProductResolver, ProductType, ProductVariant};

impl<R> ProductResolver for Arc<R>
where
    R: ProductResolver + ?Sized,
{
    fn product_or_variant(
        &self,
        business_id: BusinessId,
        product_type: ProductType,
        product_id: ProductId,
    ) -> DomainResult<ProductOrVariant> {
        (**self).product_or_variant(business_id, product_type, product_id)
    }
}

/// In-memory, business-isolated catalogue for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryProductCatalog {
    products: RwLock<HashMap<(BusinessId, ProductId), Product>>,
    variants: RwLock<HashMap<(BusinessId, ProductId), ProductVariant>>,
}

impl InMemoryProductCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking writer cannot leave a map half-updated, so poisoned locks
    // are recovered rather than reported.

    pub fn insert_product(&self, product: Product) {
        let mut map = self.products.write().unwrap_or_else(PoisonError::into_inner);
        map.insert((product.business_id, product.id), product);
    }

    pub fn insert_variant(&self, variant: ProductVariant) {
        let mut map = self.variants.write().unwrap_or_else(PoisonError::into_inner);
        map.insert((variant.business_id, variant.id), variant);
    }
}

impl ProductResolver for InMemoryProductCatalog {
    fn product_or_variant(
        &self,
        business_id: BusinessId,
        product_type: ProductType,
        product_id: ProductId,
    ) -> DomainResult<ProductOrVariant> {
        if product_type == ProductType::Variant {
            let map = self.variants.read().unwrap_or_else(PoisonError::into_inner);
            return map
                .get(&(business_id, product_id))
                .cloned()
                .map(ProductOrVariant::Variant)
                .ok_or_else(DomainError::not_found);
        }

        let map = self.products.read().unwrap_or_else(PoisonError::into_inner);
        match map.get(&(business_id, product_id)) {
            Some(p) if p.product_type == product_type => Ok(ProductOrVariant::Product(p.clone())),
            Some(p) => Err(DomainError::validation(format!(
                "product {product_id} is {} not {product_type}",
                p.product_type
            ))),
            None => Err(DomainError::not_found()),
        }
    }
}
