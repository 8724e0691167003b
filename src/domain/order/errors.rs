use crate::domain::customer::CustomerId;
use crate::domain::product::ProductId;
use crate::store::StoreError;
use crate::utils::IsTransient;

use super::value_objects::{LineItemId, OrderId};

// ============================================================================
// Order Business Rule Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Order not found")]
    OrderNotFound,

    #[error("Order product not found: {0}")]
    OrderProductNotFound(LineItemId),

    #[error("Product not found: {0}")]
    ProductNotFound(ProductId),

    #[error("Customer not found: {0}")]
    CustomerNotFound(CustomerId),

    #[error("Order already processing")]
    AlreadyProcessing,

    #[error("Order already started")]
    AlreadyStarted,

    #[error("Order already done")]
    AlreadyDone,

    #[error("Order already cancelled")]
    AlreadyCancelled,

    #[error("Order is not awaiting payment settlement")]
    PaymentNotPending,

    #[error("Invalid item quantity: {0}")]
    InvalidQuantity(u16),

    #[error("Notes exceed {max} characters")]
    NotesTooLong { max: usize },

    #[error("Order {0} was modified concurrently")]
    Conflict(OrderId),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrderError {
    /// Request refused by a lifecycle precondition, as opposed to a lookup
    /// miss or an infrastructure failure.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            OrderError::AlreadyProcessing
                | OrderError::AlreadyStarted
                | OrderError::AlreadyDone
                | OrderError::AlreadyCancelled
                | OrderError::PaymentNotPending
        )
    }
}

impl From<StoreError> for OrderError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { order_id, .. } => OrderError::Conflict(order_id),
            other => OrderError::Internal(other.to_string()),
        }
    }
}

/// Only lost optimistic-concurrency races are worth re-running.
impl IsTransient for OrderError {
    fn is_transient(&self) -> bool {
        matches!(self, OrderError::Conflict(_))
    }
}
