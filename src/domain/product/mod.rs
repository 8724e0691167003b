// ============================================================================
// Product Catalog - read-only view owned by product management
// ============================================================================
//
// The order engine never writes products. It only needs to know whether a
// product exists (and is not soft-deleted) and what it costs right now.
//
// ============================================================================

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::order::Money;
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub Uuid);

impl ProductId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ProductId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Product as seen at lookup time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub id: ProductId,
    pub name: String,
    pub price: Money,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ProductSnapshot {
    pub fn new(id: ProductId, name: impl Into<String>, price: Money) -> Self {
        Self {
            id,
            name: name.into(),
            price,
            deleted_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// `StoreError::NotFound` when the product does not exist.
    async fn find_by_id(&self, id: ProductId) -> Result<ProductSnapshot, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_active_until_deleted() {
        let mut product = ProductSnapshot::new(ProductId::new(), "X-Burger", Money::from_cents(1990));
        assert!(product.is_active());

        product.deleted_at = Some(Utc::now());
        assert!(!product.is_active());
    }
}
