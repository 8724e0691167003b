use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::domain::customer::{CustomerDirectory, CustomerId};
use crate::domain::product::{ProductCatalog, ProductId, ProductSnapshot};
use crate::metrics::Metrics;
use crate::store::{OrderRepository, StoreError, TrackingSequence};
use crate::utils::{retry_on_transient, KeyedLocks, RetryConfig};

use super::aggregate::{Order, OrderDetails};
use super::commands::{AddProduct, Transition};
use super::errors::OrderError;
use super::line_item::LineItem;
use super::patch::OrderPatch;
use super::tracking::TrackingNumberAllocator;
use super::value_objects::{LineItemId, OrderId, OrderStatus};

// ============================================================================
// Order Service - Lifecycle & Composition Engine
// ============================================================================
//
// Orchestrates: Lock → Load → Entity rule → Patch → Conditional write
//
// Every mutation of one order runs under that order's lock and writes with
// the revision it read. A stale revision (another instance got there first)
// re-runs the whole read-modify-write; nothing else is retried.
//
// ============================================================================

#[derive(Clone, Debug)]
pub struct ServiceSettings {
    /// Simulated payment gateway round-trip before `confirmed`
    pub settlement_delay: Duration,
    pub conflict_retry: RetryConfig,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            settlement_delay: Duration::from_secs(5),
            conflict_retry: RetryConfig::conflict(3),
        }
    }
}

/// Which orders a lookup may return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lookup {
    /// Soft-cancelled orders read as missing
    Live,
    /// Soft-cancelled orders included, for rules that report them
    Any,
}

#[derive(Clone)]
pub struct OrderService {
    orders: Arc<dyn OrderRepository>,
    products: Arc<dyn ProductCatalog>,
    customers: Arc<dyn CustomerDirectory>,
    tracking: TrackingNumberAllocator,
    order_locks: Arc<KeyedLocks<OrderId>>,
    customer_locks: Arc<KeyedLocks<CustomerId>>,
    metrics: Arc<Metrics>,
    settings: ServiceSettings,
}

impl OrderService {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        products: Arc<dyn ProductCatalog>,
        customers: Arc<dyn CustomerDirectory>,
        tracking_sequence: Arc<dyn TrackingSequence>,
        metrics: Arc<Metrics>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            orders,
            products,
            customers,
            tracking: TrackingNumberAllocator::new(tracking_sequence),
            order_locks: Arc::new(KeyedLocks::new()),
            customer_locks: Arc::new(KeyedLocks::new()),
            metrics,
            settings,
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get_by_id(&self, order_id: OrderId) -> Result<Order, OrderError> {
        self.load(order_id, Lookup::Live).await
    }

    /// The customer's open order.
    pub async fn get_by_customer(&self, customer_id: CustomerId) -> Result<Order, OrderError> {
        self.orders
            .find_active_order_by_customer(customer_id)
            .await?
            .ok_or(OrderError::OrderNotFound)
    }

    pub async fn get_details(&self, order_id: OrderId) -> Result<OrderDetails, OrderError> {
        let order = self.load(order_id, Lookup::Live).await?;
        let line_items = self.orders.list_line_items(order_id).await?;

        tracing::debug!(
            order_id = %order_id,
            line_items = line_items.len(),
            total = %order.total,
            "Loaded order details"
        );
        Ok(OrderDetails { order, line_items })
    }

    /// Open orders, earliest pipeline stage first.
    pub async fn list(&self) -> Result<Vec<Order>, OrderError> {
        let orders = self.orders.list_active_non_terminal().await?;
        tracing::debug!(count = orders.len(), "Listed open orders");
        Ok(orders)
    }

    // ========================================================================
    // Composition
    // ========================================================================

    /// Reuse the customer's open order (or open a new one), then add `items`
    /// in order. Stops at the first failing item; items added before it stay
    /// on the order, which remains reachable through `get_by_customer`.
    pub async fn create_or_get_active(
        &self,
        customer_id: CustomerId,
        items: Vec<AddProduct>,
    ) -> Result<OrderId, OrderError> {
        self.ensure_customer(customer_id).await?;

        let order_id = {
            let _guard = self.customer_locks.lock(customer_id).await;
            self.find_or_open(customer_id).await?
        };

        for (index, item) in items.into_iter().enumerate() {
            if let Err(e) = self.add_product(order_id, item).await {
                tracing::warn!(
                    order_id = %order_id,
                    customer_id = %customer_id,
                    failed_item = index,
                    error = %e,
                    "Stopped adding items; earlier items remain on the order"
                );
                return Err(e);
            }
        }

        Ok(order_id)
    }

    pub async fn add_product(
        &self,
        order_id: OrderId,
        command: AddProduct,
    ) -> Result<LineItem, OrderError> {
        let _guard = self.order_locks.lock(order_id).await;
        let item = self
            .with_conflict_retry(|| self.add_product_once(order_id, &command))
            .await?;

        self.metrics.line_items_added.inc();
        tracing::info!(
            order_id = %order_id,
            line_item_id = %item.id,
            product_id = %item.product_id,
            quantity = item.quantity.get(),
            line_total = %item.total,
            "Line item added"
        );
        Ok(item)
    }

    async fn add_product_once(
        &self,
        order_id: OrderId,
        command: &AddProduct,
    ) -> Result<LineItem, OrderError> {
        let order = self.load(order_id, Lookup::Any).await?;
        order.ensure_modifiable()?;

        let product = self.resolve_product(command.product_id).await?;
        let item = LineItem::new(order.id, &product, command.quantity, command.notes.clone())?;

        let mut updated = order.clone();
        updated.add_to_total(item.total)?;

        let tracking_number = self.tracking.get_or_assign(order.tracking_number).await?;
        updated.assign_tracking_number(tracking_number);

        let patch = OrderPatch::diff(&order, &updated);
        let saved = self
            .orders
            .save_line_item(&item, &patch, order.revision)
            .await?;

        // Only count a number once an order actually holds it
        if order.tracking_number.is_none() && saved.tracking_number.is_some() {
            self.metrics.tracking_numbers_issued.inc();
        }
        Ok(item)
    }

    pub async fn remove_product(
        &self,
        order_id: OrderId,
        line_item_id: LineItemId,
    ) -> Result<Order, OrderError> {
        let _guard = self.order_locks.lock(order_id).await;
        let order = self
            .with_conflict_retry(|| self.remove_product_once(order_id, line_item_id))
            .await?;

        self.metrics.line_items_removed.inc();
        tracing::info!(
            order_id = %order_id,
            line_item_id = %line_item_id,
            total = %order.total,
            "Line item removed"
        );
        Ok(order)
    }

    async fn remove_product_once(
        &self,
        order_id: OrderId,
        line_item_id: LineItemId,
    ) -> Result<Order, OrderError> {
        let order = self.load(order_id, Lookup::Any).await?;
        order.ensure_modifiable()?;

        let item = self
            .orders
            .find_line_item_by_id(order_id, line_item_id)
            .await
            .map_err(|e| line_item_error(e, line_item_id))?;

        let mut updated = order.clone();
        updated.subtract_from_total(item.total)?;

        let patch = OrderPatch::diff(&order, &updated);
        self.orders
            .delete_line_item(order_id, line_item_id, &patch, order.revision)
            .await
            .map_err(|e| line_item_error(e, line_item_id))
    }

    // ========================================================================
    // Pipeline
    // ========================================================================

    /// pending → processing, then confirmed once settlement completes.
    ///
    /// The order lock is released before the settlement wait; the deferred
    /// confirmation takes it again only to apply its own write. The returned
    /// handle may be awaited or dropped; dropping it does not cancel the
    /// settlement.
    pub async fn pay(&self, order_id: OrderId) -> Result<Settlement, OrderError> {
        let order = {
            let _guard = self.order_locks.lock(order_id).await;
            self.transition(order_id, Transition::Pay).await?
        };

        let requested_at = Instant::now();
        let delay = self.settings.settlement_delay;
        let service = self.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let result = service.confirm_payment(order_id).await;
            match &result {
                Ok(_) => service
                    .metrics
                    .record_settlement(requested_at.elapsed().as_secs_f64()),
                Err(e) => tracing::warn!(
                    order_id = %order_id,
                    error = %e,
                    "Settlement did not confirm the order"
                ),
            }
            result
        });

        Ok(Settlement { order, handle })
    }

    /// Settlement callback: processing → confirmed.
    pub async fn confirm_payment(&self, order_id: OrderId) -> Result<Order, OrderError> {
        let _guard = self.order_locks.lock(order_id).await;
        self.transition(order_id, Transition::ConfirmPayment).await
    }

    /// confirmed → started.
    pub async fn prepare(&self, order_id: OrderId) -> Result<Order, OrderError> {
        let _guard = self.order_locks.lock(order_id).await;
        self.transition(order_id, Transition::Prepare).await
    }

    /// started → done.
    pub async fn complete(&self, order_id: OrderId) -> Result<Order, OrderError> {
        let _guard = self.order_locks.lock(order_id).await;
        self.transition(order_id, Transition::Complete).await
    }

    /// Soft-cancel an order that has not been handed over.
    pub async fn cancel(&self, order_id: OrderId) -> Result<Order, OrderError> {
        let _guard = self.order_locks.lock(order_id).await;
        self.transition(order_id, Transition::Cancel).await
    }

    pub async fn reset_tracking_numbers(&self) -> Result<(), OrderError> {
        self.tracking.reset().await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Caller holds the order lock.
    async fn transition(
        &self,
        order_id: OrderId,
        transition: Transition,
    ) -> Result<Order, OrderError> {
        let lookup = match transition {
            Transition::Cancel => Lookup::Any,
            _ => Lookup::Live,
        };

        let result = self
            .with_conflict_retry(|| async move {
                let order = self.load(order_id, lookup).await?;
                let mut updated = order.clone();
                apply_transition(transition, &mut updated)?;

                let patch = OrderPatch::diff(&order, &updated);
                let saved = self
                    .orders
                    .update_order_fields(order_id, &patch, order.revision)
                    .await?;
                Ok::<Order, OrderError>(saved)
            })
            .await;

        match &result {
            Ok(order) => {
                self.metrics.record_transition(transition.as_str(), true);
                tracing::info!(
                    order_id = %order_id,
                    transition = transition.as_str(),
                    status = %order.status,
                    "✅ Order transitioned"
                );
            }
            Err(e) if e.is_rejection() => {
                self.metrics.record_transition(transition.as_str(), false);
                tracing::warn!(
                    order_id = %order_id,
                    transition = transition.as_str(),
                    error = %e,
                    "Order transition rejected"
                );
            }
            Err(e) => {
                tracing::warn!(
                    order_id = %order_id,
                    transition = transition.as_str(),
                    error = %e,
                    "Order transition failed"
                );
            }
        }
        result
    }

    /// Re-run `operation` while it loses optimistic-concurrency races.
    async fn with_conflict_retry<T, F, Fut>(&self, mut operation: F) -> Result<T, OrderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OrderError>>,
    {
        let metrics = &self.metrics;
        retry_on_transient(self.settings.conflict_retry.clone(), |_attempt| {
            let attempt = operation();
            async move {
                let result = attempt.await;
                if let Err(OrderError::Conflict(order_id)) = &result {
                    metrics.record_write_conflict();
                    tracing::warn!(order_id = %order_id, "Order write lost a concurrent update");
                }
                result
            }
        })
        .await
        .into_result()
    }

    async fn load(&self, order_id: OrderId, lookup: Lookup) -> Result<Order, OrderError> {
        let order = self
            .orders
            .find_order_by_id(order_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => OrderError::OrderNotFound,
                other => other.into(),
            })?;

        if lookup == Lookup::Live && !order.is_active() {
            return Err(OrderError::OrderNotFound);
        }
        Ok(order)
    }

    /// Caller holds the customer lock.
    async fn find_or_open(&self, customer_id: CustomerId) -> Result<OrderId, OrderError> {
        if let Some(order) = self.orders.find_active_order_by_customer(customer_id).await? {
            tracing::debug!(
                order_id = %order.id,
                customer_id = %customer_id,
                status = %order.status,
                "Reusing open order"
            );
            return Ok(order.id);
        }

        let order = Order::create(customer_id);
        match self.orders.create_order(&order).await {
            Ok(()) => {
                self.metrics.orders_created.inc();
                tracing::info!(
                    order_id = %order.id,
                    customer_id = %customer_id,
                    "✅ Order created"
                );
                Ok(order.id)
            }
            // Another instance opened one between our read and insert
            Err(StoreError::ActiveOrderExists(_)) => self
                .orders
                .find_active_order_by_customer(customer_id)
                .await?
                .map(|existing| existing.id)
                .ok_or_else(|| {
                    OrderError::Internal(format!(
                        "customer {customer_id} has an open order that cannot be read back"
                    ))
                }),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_customer(&self, customer_id: CustomerId) -> Result<(), OrderError> {
        match self.customers.find_by_id(customer_id).await {
            Ok(customer) if customer.is_active() => Ok(()),
            Ok(_) | Err(StoreError::NotFound) => Err(OrderError::CustomerNotFound(customer_id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_product(&self, product_id: ProductId) -> Result<ProductSnapshot, OrderError> {
        match self.products.find_by_id(product_id).await {
            Ok(product) if product.is_active() => Ok(product),
            Ok(_) | Err(StoreError::NotFound) => Err(OrderError::ProductNotFound(product_id)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Status preconditions of each pipeline step.
fn apply_transition(transition: Transition, order: &mut Order) -> Result<(), OrderError> {
    match transition {
        Transition::Pay => order.pay(),
        Transition::ConfirmPayment => order.confirm_payment(),
        Transition::Prepare => {
            if order.status != OrderStatus::Confirmed {
                return Err(OrderError::AlreadyStarted);
            }
            order.start()
        }
        Transition::Complete => {
            if order.status != OrderStatus::Started {
                return Err(OrderError::AlreadyDone);
            }
            order.complete()
        }
        Transition::Cancel => {
            if order.status == OrderStatus::Done {
                return Err(OrderError::AlreadyDone);
            }
            order.cancel()
        }
    }
}

fn line_item_error(err: StoreError, line_item_id: LineItemId) -> OrderError {
    match err {
        StoreError::NotFound => OrderError::OrderProductNotFound(line_item_id),
        other => other.into(),
    }
}

// ============================================================================
// Settlement Handle
// ============================================================================

/// Outcome of `pay`: the order as written (`processing`) plus the pending
/// confirmation.
pub struct Settlement {
    order: Order,
    handle: JoinHandle<Result<Order, OrderError>>,
}

impl Settlement {
    /// The order right after payment was requested.
    pub fn order(&self) -> &Order {
        &self.order
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the deferred confirmation and return the confirmed order.
    pub async fn wait(self) -> Result<Order, OrderError> {
        self.handle
            .await
            .map_err(|e| OrderError::Internal(format!("settlement task failed: {e}")))?
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::customer::CustomerRecord;
    use crate::domain::order::{Money, Quantity, TrackingNumber};
    use crate::store::{
        AtomicTrackingSequence, InMemoryCustomerDirectory, InMemoryOrderRepository,
        InMemoryProductCatalog,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    const ALICE: CustomerId = CustomerId(11122233344);

    struct Fixture {
        service: OrderService,
        products: Arc<InMemoryProductCatalog>,
        customers: Arc<InMemoryCustomerDirectory>,
        metrics: Arc<Metrics>,
    }

    fn fast_settings() -> ServiceSettings {
        ServiceSettings {
            settlement_delay: Duration::ZERO,
            conflict_retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                multiplier: 2.0,
            },
        }
    }

    async fn fixture_with(orders: Arc<dyn OrderRepository>, settings: ServiceSettings) -> Fixture {
        let products = Arc::new(InMemoryProductCatalog::new());
        let customers = Arc::new(InMemoryCustomerDirectory::new());
        customers
            .insert(CustomerRecord::new(ALICE, "Alice", "Moreira", "alice@example.com"))
            .await;
        let metrics = Arc::new(Metrics::new().unwrap());

        let service = OrderService::new(
            orders,
            products.clone(),
            customers.clone(),
            Arc::new(AtomicTrackingSequence::new()),
            metrics.clone(),
            settings,
        );

        Fixture {
            service,
            products,
            customers,
            metrics,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(Arc::new(InMemoryOrderRepository::new()), fast_settings()).await
    }

    impl Fixture {
        async fn product(&self, name: &str, price_cents: u64) -> ProductId {
            let id = ProductId::new();
            self.products
                .insert(ProductSnapshot::new(id, name, Money::from_cents(price_cents)))
                .await;
            id
        }

        async fn order_with(&self, product_id: ProductId, quantity: u16) -> OrderId {
            self.service
                .create_or_get_active(ALICE, vec![item(product_id, quantity)])
                .await
                .unwrap()
        }

        async fn confirmed_order(&self) -> OrderId {
            let burger = self.product("X-Burger", 1500).await;
            let order_id = self.order_with(burger, 1).await;
            self.service.pay(order_id).await.unwrap().wait().await.unwrap();
            order_id
        }
    }

    fn item(product_id: ProductId, quantity: u16) -> AddProduct {
        AddProduct::new(product_id, Quantity::new(quantity).unwrap())
    }

    // ------------------------------------------------------------------------
    // Creation and composition
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_create_then_reuse_active_order() {
        let fx = fixture().await;
        let fries = fx.product("Fries", 800).await;
        let soda = fx.product("Soda", 550).await;

        let first = fx.order_with(fries, 2).await;
        let order = fx.service.get_by_id(first).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.total, Money::from_cents(1600));
        let number = order.tracking_number.unwrap();
        assert!((TrackingNumber::MIN..=TrackingNumber::MAX).contains(&number.get()));

        let second = fx
            .service
            .create_or_get_active(ALICE, vec![item(soda, 1)])
            .await
            .unwrap();
        assert_eq!(second, first);

        let order = fx.service.get_by_id(first).await.unwrap();
        assert_eq!(order.total, Money::from_cents(2150));
        assert_eq!(order.tracking_number, Some(number));
        assert_eq!(fx.metrics.orders_created.get(), 1);
        assert_eq!(fx.metrics.tracking_numbers_issued.get(), 1);
    }

    #[tokio::test]
    async fn test_total_matches_line_items() {
        let fx = fixture().await;
        let burger = fx.product("X-Bacon", 1890).await;
        let shake = fx.product("Shake", 1275).await;
        let order_id = fx.order_with(burger, 3).await;

        fx.service
            .add_product(order_id, item(shake, 2).with_notes("no whipped cream"))
            .await
            .unwrap();

        let details = fx.service.get_details(order_id).await.unwrap();
        assert_eq!(details.line_items.len(), 2);
        assert_eq!(details.order.total, Money::from_cents(3 * 1890 + 2 * 1275));
        assert_eq!(details.line_items_total(), Some(details.order.total));
        assert_eq!(details.line_items[1].notes.as_deref(), Some("no whipped cream"));
    }

    #[tokio::test]
    async fn test_remove_product_subtracts_its_total_only() {
        let fx = fixture().await;
        let burger = fx.product("X-Burger", 1500).await;
        let fries = fx.product("Fries", 800).await;
        let order_id = fx.order_with(burger, 2).await;
        let fries_item = fx.service.add_product(order_id, item(fries, 1)).await.unwrap();

        let order = fx.service.remove_product(order_id, fries_item.id).await.unwrap();
        assert_eq!(order.total, Money::from_cents(3000));

        let details = fx.service.get_details(order_id).await.unwrap();
        assert_eq!(details.line_items.len(), 1);
        assert_eq!(details.line_items[0].total, Money::from_cents(3000));
    }

    #[tokio::test]
    async fn test_remove_unknown_line_item() {
        let fx = fixture().await;
        let burger = fx.product("X-Burger", 1500).await;
        let order_id = fx.order_with(burger, 1).await;

        let missing = LineItemId::new();
        let result = fx.service.remove_product(order_id, missing).await;
        assert!(matches!(result, Err(OrderError::OrderProductNotFound(id)) if id == missing));

        let order = fx.service.get_by_id(order_id).await.unwrap();
        assert_eq!(order.total, Money::from_cents(1500));
    }

    #[tokio::test]
    async fn test_remove_line_item_of_another_order() {
        let fx = fixture().await;
        let burger = fx.product("X-Burger", 1500).await;
        let bob = CustomerId(55566677788);
        fx.customers
            .insert(CustomerRecord::new(bob, "Bob", "Silva", "bob@example.com"))
            .await;

        let alice_order = fx.order_with(burger, 1).await;
        let bob_order = fx
            .service
            .create_or_get_active(bob, vec![item(burger, 1)])
            .await
            .unwrap();
        let bob_item = fx.service.get_details(bob_order).await.unwrap().line_items[0].id;

        let result = fx.service.remove_product(alice_order, bob_item).await;
        assert!(matches!(result, Err(OrderError::OrderProductNotFound(_))));
        assert_eq!(
            fx.service.get_by_id(bob_order).await.unwrap().total,
            Money::from_cents(1500)
        );
    }

    #[tokio::test]
    async fn test_remove_from_unknown_order() {
        let fx = fixture().await;
        let result = fx.service.remove_product(OrderId::new(), LineItemId::new()).await;
        assert!(matches!(result, Err(OrderError::OrderNotFound)));
    }

    #[tokio::test]
    async fn test_unknown_or_deleted_product() {
        let fx = fixture().await;
        let burger = fx.product("X-Burger", 1500).await;
        let order_id = fx.order_with(burger, 1).await;

        let ghost = ProductId::new();
        let result = fx.service.add_product(order_id, item(ghost, 1)).await;
        assert!(matches!(result, Err(OrderError::ProductNotFound(id)) if id == ghost));

        fx.products.soft_delete(burger).await.unwrap();
        let result = fx.service.add_product(order_id, item(burger, 1)).await;
        assert!(matches!(result, Err(OrderError::ProductNotFound(_))));
    }

    #[tokio::test]
    async fn test_unknown_customer() {
        let fx = fixture().await;
        let burger = fx.product("X-Burger", 1500).await;

        let result = fx
            .service
            .create_or_get_active(CustomerId(1), vec![item(burger, 1)])
            .await;
        assert!(matches!(result, Err(OrderError::CustomerNotFound(CustomerId(1)))));
        assert_eq!(fx.metrics.orders_created.get(), 0);
    }

    #[tokio::test]
    async fn test_partial_apply_keeps_earlier_items() {
        let fx = fixture().await;
        let burger = fx.product("X-Burger", 1500).await;
        let fries = fx.product("Fries", 800).await;

        let result = fx
            .service
            .create_or_get_active(
                ALICE,
                vec![item(burger, 1), item(ProductId::new(), 1), item(fries, 1)],
            )
            .await;
        assert!(matches!(result, Err(OrderError::ProductNotFound(_))));

        let order = fx.service.get_by_customer(ALICE).await.unwrap();
        let details = fx.service.get_details(order.id).await.unwrap();
        assert_eq!(details.line_items.len(), 1);
        assert_eq!(details.order.total, Money::from_cents(1500));
    }

    #[tokio::test]
    async fn test_price_change_does_not_touch_existing_items() {
        let fx = fixture().await;
        let burger = fx.product("X-Burger", 1500).await;
        let order_id = fx.order_with(burger, 2).await;

        fx.products
            .set_price(burger, Money::from_cents(9900))
            .await
            .unwrap();

        let details = fx.service.get_details(order_id).await.unwrap();
        assert_eq!(details.order.total, Money::from_cents(3000));
        assert_eq!(details.line_items[0].unit_price, Money::from_cents(1500));
    }

    #[tokio::test]
    async fn test_concurrent_adds_do_not_lose_updates() {
        let fx = fixture().await;
        let nuggets = fx.product("Nuggets", 325).await;
        let order_id = fx.order_with(nuggets, 1).await;

        let mut handles = Vec::new();
        for _ in 0..25 {
            let service = fx.service.clone();
            handles.push(tokio::spawn(async move {
                service.add_product(order_id, item(nuggets, 1)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let details = fx.service.get_details(order_id).await.unwrap();
        assert_eq!(details.line_items.len(), 26);
        assert_eq!(details.order.total, Money::from_cents(26 * 325));
        assert_eq!(fx.metrics.tracking_numbers_issued.get(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_create_yields_single_order() {
        let fx = fixture().await;
        let soda = fx.product("Soda", 550).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let service = fx.service.clone();
            handles.push(tokio::spawn(async move {
                service.create_or_get_active(ALICE, vec![item(soda, 1)]).await
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(fx.metrics.orders_created.get(), 1);
        assert_eq!(
            fx.service.get_by_id(ids[0]).await.unwrap().total,
            Money::from_cents(5500)
        );
    }

    // ------------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_full_lifecycle() {
        let fx = fixture().await;
        let burger = fx.product("X-Burger", 1500).await;
        let order_id = fx.order_with(burger, 1).await;

        let settlement = fx.service.pay(order_id).await.unwrap();
        assert_eq!(settlement.order().status, OrderStatus::Processing);

        let confirmed = settlement.wait().await.unwrap();
        assert_eq!(confirmed.status, OrderStatus::Confirmed);

        let started = fx.service.prepare(order_id).await.unwrap();
        assert_eq!(started.status, OrderStatus::Started);
        let started_at = started.started_at.unwrap();

        let done = fx.service.complete(order_id).await.unwrap();
        assert_eq!(done.status, OrderStatus::Done);
        assert_eq!(done.started_at, Some(started_at));
        assert!(done.ready_at.is_some());

        assert!(matches!(
            fx.service.complete(order_id).await,
            Err(OrderError::AlreadyDone)
        ));
        let after = fx.service.get_by_id(order_id).await.unwrap();
        assert_eq!(after.ready_at, done.ready_at);
        assert_eq!(after.revision, done.revision);
    }

    #[tokio::test]
    async fn test_pay_twice_is_already_processing() {
        let fx = fixture().await;
        let burger = fx.product("X-Burger", 1500).await;
        let order_id = fx.order_with(burger, 1).await;

        let settlement = fx.service.pay(order_id).await.unwrap();
        let second = fx.service.pay(order_id).await;
        assert!(matches!(second, Err(OrderError::AlreadyProcessing)));

        settlement.wait().await.unwrap();
        assert!(matches!(
            fx.service.pay(order_id).await,
            Err(OrderError::AlreadyProcessing)
        ));
    }

    #[tokio::test]
    async fn test_prepare_pending_order_is_rejected_without_change() {
        let fx = fixture().await;
        let burger = fx.product("X-Burger", 1500).await;
        let order_id = fx.order_with(burger, 1).await;
        let before = fx.service.get_by_id(order_id).await.unwrap();

        let result = fx.service.prepare(order_id).await;
        assert!(matches!(result, Err(OrderError::AlreadyStarted)));

        let after = fx.service.get_by_id(order_id).await.unwrap();
        assert_eq!(after, before);
        assert_eq!(
            fx.metrics
                .transition_rejections
                .with_label_values(&["prepare"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_prepare_twice_is_already_started() {
        let fx = fixture().await;
        let order_id = fx.confirmed_order().await;

        fx.service.prepare(order_id).await.unwrap();
        assert!(matches!(
            fx.service.prepare(order_id).await,
            Err(OrderError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_complete_before_start_is_rejected() {
        let fx = fixture().await;
        let order_id = fx.confirmed_order().await;

        assert!(matches!(
            fx.service.complete(order_id).await,
            Err(OrderError::AlreadyDone)
        ));
        let order = fx.service.get_by_id(order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Confirmed);
        assert!(order.ready_at.is_none());
    }

    #[tokio::test]
    async fn test_settlement_does_not_hold_order_lock() {
        let settings = ServiceSettings {
            settlement_delay: Duration::from_millis(300),
            ..fast_settings()
        };
        let fx = fixture_with(Arc::new(InMemoryOrderRepository::new()), settings).await;
        let burger = fx.product("X-Burger", 1500).await;
        let order_id = fx.order_with(burger, 1).await;

        let settlement = fx.service.pay(order_id).await.unwrap();

        // The order stays writable while settlement is pending
        let added = tokio::time::timeout(
            Duration::from_millis(150),
            fx.service.add_product(order_id, item(burger, 1)),
        )
        .await;
        assert!(matches!(added, Ok(Ok(_))));
        assert!(!settlement.is_finished());
        assert_eq!(
            fx.service.get_by_id(order_id).await.unwrap().status,
            OrderStatus::Processing
        );

        let confirmed = settlement.wait().await.unwrap();
        assert_eq!(confirmed.status, OrderStatus::Confirmed);
        assert_eq!(confirmed.total, Money::from_cents(3000));
        assert_eq!(fx.metrics.settlement_duration.get_sample_count(), 1);
    }

    #[tokio::test]
    async fn test_confirm_payment_requires_processing() {
        let fx = fixture().await;
        let burger = fx.product("X-Burger", 1500).await;
        let order_id = fx.order_with(burger, 1).await;

        assert!(matches!(
            fx.service.confirm_payment(order_id).await,
            Err(OrderError::PaymentNotPending)
        ));
        assert_eq!(
            fx.service.get_by_id(order_id).await.unwrap().status,
            OrderStatus::Pending
        );
    }

    // ------------------------------------------------------------------------
    // Cancellation and listing
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_cancel_hides_order_and_blocks_changes() {
        let fx = fixture().await;
        let burger = fx.product("X-Burger", 1500).await;
        let order_id = fx.order_with(burger, 1).await;
        let line_item = fx.service.get_details(order_id).await.unwrap().line_items[0].id;

        let cancelled = fx.service.cancel(order_id).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(!cancelled.is_active());

        assert!(matches!(
            fx.service.cancel(order_id).await,
            Err(OrderError::AlreadyCancelled)
        ));
        assert!(matches!(
            fx.service.add_product(order_id, item(burger, 1)).await,
            Err(OrderError::AlreadyCancelled)
        ));
        assert!(matches!(
            fx.service.remove_product(order_id, line_item).await,
            Err(OrderError::AlreadyCancelled)
        ));
        assert!(matches!(
            fx.service.get_by_id(order_id).await,
            Err(OrderError::OrderNotFound)
        ));
        assert!(matches!(
            fx.service.pay(order_id).await,
            Err(OrderError::OrderNotFound)
        ));
    }

    #[tokio::test]
    async fn test_cancel_during_settlement_stops_confirmation() {
        let settings = ServiceSettings {
            settlement_delay: Duration::from_millis(100),
            ..fast_settings()
        };
        let fx = fixture_with(Arc::new(InMemoryOrderRepository::new()), settings).await;
        let burger = fx.product("X-Burger", 1500).await;
        let order_id = fx.order_with(burger, 1).await;

        let settlement = fx.service.pay(order_id).await.unwrap();
        fx.service.cancel(order_id).await.unwrap();

        assert!(matches!(settlement.wait().await, Err(OrderError::OrderNotFound)));
    }

    #[tokio::test]
    async fn test_done_order_cannot_be_changed_or_cancelled() {
        let fx = fixture().await;
        let order_id = fx.confirmed_order().await;
        fx.service.prepare(order_id).await.unwrap();
        fx.service.complete(order_id).await.unwrap();

        let fries = fx.product("Fries", 800).await;
        assert!(matches!(
            fx.service.add_product(order_id, item(fries, 1)).await,
            Err(OrderError::AlreadyDone)
        ));
        assert!(matches!(
            fx.service.cancel(order_id).await,
            Err(OrderError::AlreadyDone)
        ));

        // A done order frees the customer to open a new one
        let next = fx.order_with(fries, 1).await;
        assert_ne!(next, order_id);
    }

    #[tokio::test]
    async fn test_list_groups_by_stage_and_skips_closed() {
        let fx = fixture().await;
        let burger = fx.product("X-Burger", 1500).await;
        let mut customers = Vec::new();
        for n in 0..4u64 {
            let id = CustomerId(1000 + n);
            fx.customers
                .insert(CustomerRecord::new(id, "Guest", "Number", "guest@example.com"))
                .await;
            customers.push(id);
        }

        let mut orders = Vec::new();
        for customer in &customers {
            orders.push(
                fx.service
                    .create_or_get_active(*customer, vec![item(burger, 1)])
                    .await
                    .unwrap(),
            );
        }

        // orders[0]: started, orders[1]: pending, orders[2]: cancelled, orders[3]: confirmed
        fx.service.pay(orders[0]).await.unwrap().wait().await.unwrap();
        fx.service.prepare(orders[0]).await.unwrap();
        fx.service.cancel(orders[2]).await.unwrap();
        fx.service.pay(orders[3]).await.unwrap().wait().await.unwrap();

        let listed: Vec<(OrderId, OrderStatus)> = fx
            .service
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|o| (o.id, o.status))
            .collect();

        assert_eq!(
            listed,
            vec![
                (orders[1], OrderStatus::Pending),
                (orders[3], OrderStatus::Confirmed),
                (orders[0], OrderStatus::Started),
            ]
        );
    }

    #[tokio::test]
    async fn test_get_by_customer_without_open_order() {
        let fx = fixture().await;
        assert!(matches!(
            fx.service.get_by_customer(ALICE).await,
            Err(OrderError::OrderNotFound)
        ));
    }

    #[tokio::test]
    async fn test_reset_tracking_numbers() {
        let fx = fixture().await;
        let burger = fx.product("X-Burger", 1500).await;
        let first = fx.order_with(burger, 1).await;
        fx.service.cancel(first).await.unwrap();
        let second = fx.order_with(burger, 1).await;
        assert_eq!(
            fx.service.get_by_id(second).await.unwrap().tracking_number,
            TrackingNumber::new(2)
        );

        fx.service.reset_tracking_numbers().await.unwrap();
        fx.service.cancel(second).await.unwrap();
        let third = fx.order_with(burger, 1).await;
        assert_eq!(
            fx.service.get_by_id(third).await.unwrap().tracking_number,
            TrackingNumber::new(1)
        );
    }

    // ------------------------------------------------------------------------
    // Conflict handling
    // ------------------------------------------------------------------------

    /// Repository whose first `conflicts` order updates lose a race.
    struct ContendedRepository {
        inner: InMemoryOrderRepository,
        conflicts: AtomicU32,
    }

    impl ContendedRepository {
        fn new(conflicts: u32) -> Self {
            Self {
                inner: InMemoryOrderRepository::new(),
                conflicts: AtomicU32::new(conflicts),
            }
        }

        fn lose_race(&self, order_id: OrderId, expected: i64) -> Result<(), StoreError> {
            let remaining = self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            match remaining {
                Ok(_) => Err(StoreError::Conflict { order_id, expected }),
                Err(_) => Ok(()),
            }
        }
    }

    #[async_trait]
    impl OrderRepository for ContendedRepository {
        async fn find_order_by_id(&self, id: OrderId) -> Result<Order, StoreError> {
            self.inner.find_order_by_id(id).await
        }

        async fn find_active_order_by_customer(
            &self,
            customer_id: CustomerId,
        ) -> Result<Option<Order>, StoreError> {
            self.inner.find_active_order_by_customer(customer_id).await
        }

        async fn list_active_non_terminal(&self) -> Result<Vec<Order>, StoreError> {
            self.inner.list_active_non_terminal().await
        }

        async fn create_order(&self, order: &Order) -> Result<(), StoreError> {
            self.inner.create_order(order).await
        }

        async fn update_order_fields(
            &self,
            id: OrderId,
            patch: &OrderPatch,
            expected_revision: i64,
        ) -> Result<Order, StoreError> {
            self.lose_race(id, expected_revision)?;
            self.inner.update_order_fields(id, patch, expected_revision).await
        }

        async fn save_line_item(
            &self,
            item: &LineItem,
            patch: &OrderPatch,
            expected_revision: i64,
        ) -> Result<Order, StoreError> {
            self.lose_race(item.order_id, expected_revision)?;
            self.inner.save_line_item(item, patch, expected_revision).await
        }

        async fn delete_line_item(
            &self,
            order_id: OrderId,
            item_id: LineItemId,
            patch: &OrderPatch,
            expected_revision: i64,
        ) -> Result<Order, StoreError> {
            self.lose_race(order_id, expected_revision)?;
            self.inner
                .delete_line_item(order_id, item_id, patch, expected_revision)
                .await
        }

        async fn find_line_item_by_id(
            &self,
            order_id: OrderId,
            item_id: LineItemId,
        ) -> Result<LineItem, StoreError> {
            self.inner.find_line_item_by_id(order_id, item_id).await
        }

        async fn list_line_items(&self, order_id: OrderId) -> Result<Vec<LineItem>, StoreError> {
            self.inner.list_line_items(order_id).await
        }
    }

    #[tokio::test]
    async fn test_write_conflict_is_retried() {
        let fx = fixture_with(Arc::new(ContendedRepository::new(2)), fast_settings()).await;
        let burger = fx.product("X-Burger", 1500).await;

        let order_id = fx.order_with(burger, 1).await;
        let details = fx.service.get_details(order_id).await.unwrap();
        assert_eq!(details.line_items.len(), 1);
        assert_eq!(details.order.total, Money::from_cents(1500));
        assert_eq!(fx.metrics.write_conflicts.get(), 2);
    }

    #[tokio::test]
    async fn test_tracking_numbers_counted_only_when_saved() {
        let fx = fixture_with(Arc::new(ContendedRepository::new(2)), fast_settings()).await;
        let burger = fx.product("X-Burger", 1500).await;

        // Two lost races draw two numbers that no order keeps
        let order_id = fx.order_with(burger, 1).await;
        let order = fx.service.get_by_id(order_id).await.unwrap();
        assert_eq!(order.tracking_number, TrackingNumber::new(3));
        assert_eq!(fx.metrics.tracking_numbers_issued.get(), 1);

        let contended = Arc::new(ContendedRepository::new(u32::MAX));
        let fresh = Order::create(CustomerId(98765432100));
        contended.inner.create_order(&fresh).await.unwrap();
        let service = OrderService {
            orders: contended,
            ..fx.service.clone()
        };

        let result = service.add_product(fresh.id, item(burger, 1)).await;
        assert!(matches!(result, Err(OrderError::Conflict(_))));
        assert_eq!(fx.metrics.tracking_numbers_issued.get(), 1);
    }

    #[tokio::test]
    async fn test_persistent_conflict_surfaces_as_conflict() {
        let fx = fixture_with(Arc::new(ContendedRepository::new(0)), fast_settings()).await;
        let burger = fx.product("X-Burger", 1500).await;
        let order_id = fx.order_with(burger, 1).await;

        // Swap in a repository that keeps losing for the pay attempt
        let contended = Arc::new(ContendedRepository::new(u32::MAX));
        contended
            .inner
            .create_order(&fx.service.get_by_id(order_id).await.unwrap())
            .await
            .unwrap();
        let service = OrderService {
            orders: contended,
            ..fx.service.clone()
        };

        let result = service.pay(order_id).await;
        assert!(matches!(result, Err(OrderError::Conflict(id)) if id == order_id));
        assert_eq!(fx.metrics.write_conflicts.get(), 3);
    }
}
