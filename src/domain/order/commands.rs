use serde::{Deserialize, Serialize};

use crate::domain::product::ProductId;

use super::value_objects::Quantity;

// ============================================================================
// Order Commands - Represent user intent
// ============================================================================

/// Request to put `quantity` units of a product on an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddProduct {
    pub product_id: ProductId,
    pub quantity: Quantity,
    #[serde(default)]
    pub notes: Option<String>,
}

impl AddProduct {
    pub fn new(product_id: ProductId, quantity: Quantity) -> Self {
        Self {
            product_id,
            quantity,
            notes: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Status movements exposed by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Pay,
    ConfirmPayment,
    Prepare,
    Complete,
    Cancel,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Pay => "pay",
            Transition::ConfirmPayment => "confirm_payment",
            Transition::Prepare => "prepare",
            Transition::Complete => "complete",
            Transition::Cancel => "cancel",
        }
    }
}
