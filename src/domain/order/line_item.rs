use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::product::{ProductId, ProductSnapshot};

use super::errors::OrderError;
use super::value_objects::{LineItemId, Money, OrderId, Quantity};

pub const MAX_NOTES_LEN: usize = 500;

// ============================================================================
// Line Item (order-product) Entity
// ============================================================================
//
// A line item is never edited in place. Its subtotal is fixed from the
// product price read when it was added; changing the quantity means removing
// the line and adding a new one.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: LineItemId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: Quantity,
    pub notes: Option<String>,
    /// Product price captured at add-time
    pub unit_price: Money,
    pub total: Money,
    pub created_at: DateTime<Utc>,
}

impl LineItem {
    pub fn new(
        order_id: OrderId,
        product: &ProductSnapshot,
        quantity: Quantity,
        notes: Option<String>,
    ) -> Result<Self, OrderError> {
        let notes = normalize_notes(notes)?;
        let total = product.price.times(quantity).ok_or_else(|| {
            OrderError::Internal(format!(
                "line total overflow for product {} x {}",
                product.id,
                quantity.get()
            ))
        })?;

        Ok(Self {
            id: LineItemId::new(),
            order_id,
            product_id: product.id,
            quantity,
            notes,
            unit_price: product.price,
            total,
            created_at: Utc::now(),
        })
    }
}

/// Blank notes are dropped; long ones are rejected.
fn normalize_notes(notes: Option<String>) -> Result<Option<String>, OrderError> {
    match notes {
        Some(text) if text.trim().is_empty() => Ok(None),
        Some(text) if text.chars().count() > MAX_NOTES_LEN => {
            Err(OrderError::NotesTooLong { max: MAX_NOTES_LEN })
        }
        other => Ok(other),
    }
}
