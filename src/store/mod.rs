// ============================================================================
// Order Store - Persistence Contract
// ============================================================================
//
// The order engine reaches durable state only through these traits.
//
// Responsibilities of an implementation:
// 1. Conflict-detecting writes: every order write carries the revision the
//    caller read, and a stale revision fails with `StoreError::Conflict`
// 2. Line-item insert/delete commit atomically with the order patch
// 3. Partial patch semantics: only `Some` fields of an `OrderPatch` are written
// 4. At most one open order per customer
//
// ============================================================================

mod memory;
mod postgres;

use async_trait::async_trait;

use crate::domain::customer::CustomerId;
use crate::domain::order::{LineItem, LineItemId, Order, OrderId, OrderPatch, TrackingNumber};

pub use memory::{
    AtomicTrackingSequence, InMemoryCustomerDirectory, InMemoryOrderRepository,
    InMemoryProductCatalog,
};
pub use postgres::{
    PgCustomerDirectory, PgOrderRepository, PgProductCatalog, PgStore, PgTrackingSequence,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Record not found")]
    NotFound,

    #[error("Concurrency conflict on order {order_id}: expected revision {expected}")]
    Conflict { order_id: OrderId, expected: i64 },

    #[error("Customer {0} already has an open order")]
    ActiveOrderExists(CustomerId),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Any stored order, soft-cancelled ones included.
    async fn find_order_by_id(&self, id: OrderId) -> Result<Order, StoreError>;

    /// The customer's order that is neither soft-deleted, cancelled nor done.
    async fn find_active_order_by_customer(
        &self,
        customer_id: CustomerId,
    ) -> Result<Option<Order>, StoreError>;

    /// Non-deleted orders that are neither cancelled nor done, earliest
    /// pipeline stage first.
    async fn list_active_non_terminal(&self) -> Result<Vec<Order>, StoreError>;

    /// Fails with `ActiveOrderExists` if the customer already has an open order.
    async fn create_order(&self, order: &Order) -> Result<(), StoreError>;

    async fn update_order_fields(
        &self,
        id: OrderId,
        patch: &OrderPatch,
        expected_revision: i64,
    ) -> Result<Order, StoreError>;

    /// Insert the line item and patch its order in one atomic write.
    async fn save_line_item(
        &self,
        item: &LineItem,
        patch: &OrderPatch,
        expected_revision: i64,
    ) -> Result<Order, StoreError>;

    /// Delete the line item and patch its order in one atomic write.
    /// `NotFound` when the item does not exist on that order.
    async fn delete_line_item(
        &self,
        order_id: OrderId,
        item_id: LineItemId,
        patch: &OrderPatch,
        expected_revision: i64,
    ) -> Result<Order, StoreError>;

    /// `NotFound` unless the item exists and belongs to `order_id`.
    async fn find_line_item_by_id(
        &self,
        order_id: OrderId,
        item_id: LineItemId,
    ) -> Result<LineItem, StoreError>;

    /// Line items of an order, oldest first.
    async fn list_line_items(&self, order_id: OrderId) -> Result<Vec<LineItem>, StoreError>;
}

/// Shared, persisted counter behind tracking numbers.
#[async_trait]
pub trait TrackingSequence: Send + Sync {
    /// Next value of the cyclic `[1, 999]` sequence. Concurrent callers each
    /// get a distinct value until the cycle wraps.
    async fn next_value(&self) -> Result<TrackingNumber, StoreError>;

    /// Restart the sequence so the next value is 1.
    async fn reset(&self) -> Result<(), StoreError>;
}
