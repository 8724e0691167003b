use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::customer::{CustomerDirectory, CustomerId, CustomerRecord};
use crate::domain::order::{
    LineItem, LineItemId, Money, Order, OrderId, OrderPatch, TrackingNumber,
};
use crate::domain::product::{ProductCatalog, ProductId, ProductSnapshot};

use super::{OrderRepository, StoreError, TrackingSequence};

// ============================================================================
// In-Memory Store
// ============================================================================
//
// Orders and line items share one lock so a line-item write and its order
// patch are observed together.
//
// ============================================================================

#[derive(Default)]
struct MemoryState {
    orders: HashMap<OrderId, Order>,
    line_items: HashMap<LineItemId, LineItem>,
}

impl MemoryState {
    fn checked_order_mut(
        &mut self,
        id: OrderId,
        expected_revision: i64,
    ) -> Result<&mut Order, StoreError> {
        let order = self.orders.get_mut(&id).ok_or(StoreError::NotFound)?;
        if order.revision != expected_revision {
            tracing::debug!(
                order_id = %id,
                expected = expected_revision,
                current = order.revision,
                "Rejecting stale order write"
            );
            return Err(StoreError::Conflict {
                order_id: id,
                expected: expected_revision,
            });
        }
        Ok(order)
    }
}

#[derive(Default)]
pub struct InMemoryOrderRepository {
    state: RwLock<MemoryState>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn find_order_by_id(&self, id: OrderId) -> Result<Order, StoreError> {
        let state = self.state.read().await;
        state.orders.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn find_active_order_by_customer(
        &self,
        customer_id: CustomerId,
    ) -> Result<Option<Order>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .orders
            .values()
            .filter(|o| o.customer_id == customer_id && o.is_open())
            .max_by_key(|o| o.created_at)
            .cloned())
    }

    async fn list_active_non_terminal(&self) -> Result<Vec<Order>, StoreError> {
        let state = self.state.read().await;
        let mut orders: Vec<Order> = state.orders.values().filter(|o| o.is_open()).cloned().collect();
        orders.sort_by(|a, b| {
            a.status
                .rank()
                .cmp(&b.status.rank())
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(orders)
    }

    async fn create_order(&self, order: &Order) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state
            .orders
            .values()
            .any(|o| o.customer_id == order.customer_id && o.is_open())
        {
            return Err(StoreError::ActiveOrderExists(order.customer_id));
        }
        state.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn update_order_fields(
        &self,
        id: OrderId,
        patch: &OrderPatch,
        expected_revision: i64,
    ) -> Result<Order, StoreError> {
        let mut state = self.state.write().await;
        let order = state.checked_order_mut(id, expected_revision)?;
        order.apply_patch(patch);
        Ok(order.clone())
    }

    async fn save_line_item(
        &self,
        item: &LineItem,
        patch: &OrderPatch,
        expected_revision: i64,
    ) -> Result<Order, StoreError> {
        let mut state = self.state.write().await;
        let order = state.checked_order_mut(item.order_id, expected_revision)?;
        order.apply_patch(patch);
        let updated = order.clone();
        state.line_items.insert(item.id, item.clone());
        Ok(updated)
    }

    async fn delete_line_item(
        &self,
        order_id: OrderId,
        item_id: LineItemId,
        patch: &OrderPatch,
        expected_revision: i64,
    ) -> Result<Order, StoreError> {
        let mut state = self.state.write().await;
        match state.line_items.get(&item_id) {
            Some(item) if item.order_id == order_id => {}
            _ => return Err(StoreError::NotFound),
        }
        let order = state.checked_order_mut(order_id, expected_revision)?;
        order.apply_patch(patch);
        let updated = order.clone();
        state.line_items.remove(&item_id);
        Ok(updated)
    }

    async fn find_line_item_by_id(
        &self,
        order_id: OrderId,
        item_id: LineItemId,
    ) -> Result<LineItem, StoreError> {
        let state = self.state.read().await;
        state
            .line_items
            .get(&item_id)
            .filter(|item| item.order_id == order_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_line_items(&self, order_id: OrderId) -> Result<Vec<LineItem>, StoreError> {
        let state = self.state.read().await;
        let mut items: Vec<LineItem> = state
            .line_items
            .values()
            .filter(|item| item.order_id == order_id)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.created_at);
        Ok(items)
    }
}

// ============================================================================
// Tracking Sequence
// ============================================================================

/// Process-local cyclic counter. Holds the last issued value, 0 before the
/// first allocation.
#[derive(Debug, Default)]
pub struct AtomicTrackingSequence {
    last: AtomicU16,
}

impl AtomicTrackingSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence whose next value is the successor of `last`.
    pub fn starting_after(last: TrackingNumber) -> Self {
        Self {
            last: AtomicU16::new(last.get()),
        }
    }
}

#[async_trait]
impl TrackingSequence for AtomicTrackingSequence {
    async fn next_value(&self) -> Result<TrackingNumber, StoreError> {
        let successor = |last: u16| match TrackingNumber::new(last) {
            Some(number) => number.next(),
            None => TrackingNumber::first(),
        };

        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(successor(last).get()))
            .map_err(|_| StoreError::Corrupt("tracking sequence update rejected".to_string()))?;

        Ok(successor(previous))
    }

    async fn reset(&self) -> Result<(), StoreError> {
        self.last.store(0, Ordering::Release);
        Ok(())
    }
}

// ============================================================================
// Catalog and Directory Doubles
// ============================================================================

#[derive(Default)]
pub struct InMemoryProductCatalog {
    products: RwLock<HashMap<ProductId, ProductSnapshot>>,
}

impl InMemoryProductCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, product: ProductSnapshot) {
        self.products.write().await.insert(product.id, product);
    }

    pub async fn set_price(&self, id: ProductId, price: Money) -> Result<(), StoreError> {
        let mut products = self.products.write().await;
        let product = products.get_mut(&id).ok_or(StoreError::NotFound)?;
        product.price = price;
        Ok(())
    }

    pub async fn soft_delete(&self, id: ProductId) -> Result<(), StoreError> {
        let mut products = self.products.write().await;
        let product = products.get_mut(&id).ok_or(StoreError::NotFound)?;
        product.deleted_at = Some(chrono::Utc::now());
        Ok(())
    }
}

#[async_trait]
impl ProductCatalog for InMemoryProductCatalog {
    async fn find_by_id(&self, id: ProductId) -> Result<ProductSnapshot, StoreError> {
        self.products.read().await.get(&id).cloned().ok_or(StoreError::NotFound)
    }
}

#[derive(Default)]
pub struct InMemoryCustomerDirectory {
    customers: RwLock<HashMap<CustomerId, CustomerRecord>>,
}

impl InMemoryCustomerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, customer: CustomerRecord) {
        self.customers.write().await.insert(customer.id, customer);
    }
}

#[async_trait]
impl CustomerDirectory for InMemoryCustomerDirectory {
    async fn find_by_id(&self, id: CustomerId) -> Result<CustomerRecord, StoreError> {
        self.customers.read().await.get(&id).cloned().ok_or(StoreError::NotFound)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
