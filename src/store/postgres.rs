use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::domain::customer::{CustomerDirectory, CustomerId, CustomerRecord};
use crate::domain::order::{
    LineItem, LineItemId, Money, Order, OrderId, OrderPatch, OrderStatus, Quantity,
    TrackingNumber,
};
use crate::domain::product::{ProductCatalog, ProductId, ProductSnapshot};

use super::{OrderRepository, StoreError, TrackingSequence};

// ============================================================================
// PostgreSQL Store
// ============================================================================
//
// Orders carry a `revision` column. Every order write is a single
// `UPDATE ... WHERE id = $1 AND revision = $2`; zero affected rows means the
// caller lost a race (or the order does not exist).
//
// Line-item writes run in a transaction with the order patch so a line item
// never exists without its order total reflecting it.
//
// ============================================================================

const TRACKING_SEQUENCE: &str = "order_tracking_number_sequence";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS customers (
        id BIGINT PRIMARY KEY,
        first_name TEXT NOT NULL,
        last_name TEXT NOT NULL,
        email TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        deleted_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS products (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        price_cents BIGINT NOT NULL CHECK (price_cents >= 0),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        deleted_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orders (
        id UUID PRIMARY KEY,
        revision BIGINT NOT NULL DEFAULT 0,
        customer_id BIGINT NOT NULL REFERENCES customers (id),
        status SMALLINT NOT NULL,
        total_cents BIGINT NOT NULL DEFAULT 0 CHECK (total_cents >= 0),
        tracking_number SMALLINT,
        created_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ,
        ready_at TIMESTAMPTZ,
        deleted_at TIMESTAMPTZ
    )
    "#,
    // One open order per customer
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS orders_one_open_per_customer
        ON orders (customer_id)
        WHERE deleted_at IS NULL AND status NOT IN (4, 5)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS order_products (
        id UUID PRIMARY KEY,
        order_id UUID NOT NULL REFERENCES orders (id),
        product_id UUID NOT NULL REFERENCES products (id),
        quantity INTEGER NOT NULL CHECK (quantity > 0),
        notes VARCHAR(500),
        unit_price_cents BIGINT NOT NULL,
        total_cents BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS order_products_order_id ON order_products (order_id)
    "#,
    r#"
    CREATE SEQUENCE IF NOT EXISTS order_tracking_number_sequence
        START 1
        INCREMENT 1
        MINVALUE 1
        MAXVALUE 999
        CYCLE
    "#,
];

const ORDER_COLUMNS: &str = "id, revision, customer_id, status, total_cents, tracking_number, \
                             created_at, started_at, ready_at, deleted_at";

const LINE_ITEM_COLUMNS: &str =
    "id, order_id, product_id, quantity, notes, unit_price_cents, total_cents, created_at";

/// Connection pool plus factories for the repositories that share it.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        tracing::info!(max_connections, "✅ Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables, indexes and the tracking sequence if missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!(statements = SCHEMA.len(), "✅ Schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn orders(&self) -> PgOrderRepository {
        PgOrderRepository { pool: self.pool.clone() }
    }

    pub fn tracking_sequence(&self) -> PgTrackingSequence {
        PgTrackingSequence { pool: self.pool.clone() }
    }

    pub fn products(&self) -> PgProductCatalog {
        PgProductCatalog { pool: self.pool.clone() }
    }

    pub fn customers(&self) -> PgCustomerDirectory {
        PgCustomerDirectory { pool: self.pool.clone() }
    }
}

// ============================================================================
// Orders
// ============================================================================

pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    /// Conditional patch of one order row inside `tx`.
    async fn patch_order(
        tx: &mut Transaction<'_, Postgres>,
        id: OrderId,
        patch: &OrderPatch,
        expected_revision: i64,
    ) -> Result<Order, StoreError> {
        let total = patch.total.map(money_to_db).transpose()?;

        let sql = format!(
            "UPDATE orders SET \
                status = COALESCE($3, status), \
                total_cents = COALESCE($4, total_cents), \
                tracking_number = COALESCE($5, tracking_number), \
                started_at = COALESCE($6, started_at), \
                ready_at = COALESCE($7, ready_at), \
                deleted_at = COALESCE($8, deleted_at), \
                revision = revision + 1 \
             WHERE id = $1 AND revision = $2 \
             RETURNING {ORDER_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(expected_revision)
            .bind(patch.status.map(|s| s.rank()))
            .bind(total)
            .bind(patch.tracking_number.map(tracking_to_db))
            .bind(patch.started_at)
            .bind(patch.ready_at)
            .bind(patch.deleted_at)
            .fetch_optional(&mut **tx)
            .await?;

        match row {
            Some(row) => Order::try_from(OrderRow::from_pg_row(&row)?),
            None => {
                let exists = sqlx::query("SELECT 1 FROM orders WHERE id = $1")
                    .bind(id.as_uuid())
                    .fetch_optional(&mut **tx)
                    .await?
                    .is_some();

                if exists {
                    tracing::debug!(order_id = %id, expected = expected_revision, "Rejecting stale order write");
                    Err(StoreError::Conflict {
                        order_id: id,
                        expected: expected_revision,
                    })
                } else {
                    Err(StoreError::NotFound)
                }
            }
        }
    }
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn find_order_by_id(&self, id: OrderId) -> Result<Order, StoreError> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;

        Order::try_from(OrderRow::from_pg_row(&row)?)
    }

    async fn find_active_order_by_customer(
        &self,
        customer_id: CustomerId,
    ) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE customer_id = $1 AND deleted_at IS NULL AND status NOT IN ($2, $3) \
             ORDER BY created_at DESC \
             LIMIT 1"
        ))
        .bind(customer_to_db(customer_id)?)
        .bind(OrderStatus::Done.rank())
        .bind(OrderStatus::Cancelled.rank())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| Order::try_from(OrderRow::from_pg_row(&row)?))
            .transpose()
    }

    async fn list_active_non_terminal(&self) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE deleted_at IS NULL AND status NOT IN ($1, $2) \
             ORDER BY status ASC, created_at ASC"
        ))
        .bind(OrderStatus::Done.rank())
        .bind(OrderStatus::Cancelled.rank())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Order::try_from(OrderRow::from_pg_row(row)?))
            .collect()
    }

    async fn create_order(&self, order: &Order) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO orders (id, revision, customer_id, status, total_cents, tracking_number, \
                                 created_at, started_at, ready_at, deleted_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(order.id.as_uuid())
        .bind(order.revision)
        .bind(customer_to_db(order.customer_id)?)
        .bind(order.status.rank())
        .bind(money_to_db(order.total)?)
        .bind(order.tracking_number.map(tracking_to_db))
        .bind(order.created_at)
        .bind(order.started_at)
        .bind(order.ready_at)
        .bind(order.deleted_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::ActiveOrderExists(order.customer_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_order_fields(
        &self,
        id: OrderId,
        patch: &OrderPatch,
        expected_revision: i64,
    ) -> Result<Order, StoreError> {
        let mut tx = self.pool.begin().await?;
        let order = Self::patch_order(&mut tx, id, patch, expected_revision).await?;
        tx.commit().await?;
        Ok(order)
    }

    async fn save_line_item(
        &self,
        item: &LineItem,
        patch: &OrderPatch,
        expected_revision: i64,
    ) -> Result<Order, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Patch first: a stale revision aborts before the insert
        let order = Self::patch_order(&mut tx, item.order_id, patch, expected_revision).await?;

        sqlx::query(&format!(
            "INSERT INTO order_products ({LINE_ITEM_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(item.id.as_uuid())
        .bind(item.order_id.as_uuid())
        .bind(item.product_id.as_uuid())
        .bind(quantity_to_db(item.quantity))
        .bind(item.notes.as_deref())
        .bind(money_to_db(item.unit_price)?)
        .bind(money_to_db(item.total)?)
        .bind(item.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(order)
    }

    async fn delete_line_item(
        &self,
        order_id: OrderId,
        item_id: LineItemId,
        patch: &OrderPatch,
        expected_revision: i64,
    ) -> Result<Order, StoreError> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM order_products WHERE id = $1 AND order_id = $2")
            .bind(item_id.as_uuid())
            .bind(order_id.as_uuid())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if deleted == 0 {
            tx.rollback().await?;
            return Err(StoreError::NotFound);
        }

        // Dropping `tx` on error rolls the delete back
        let order = Self::patch_order(&mut tx, order_id, patch, expected_revision).await?;
        tx.commit().await?;
        Ok(order)
    }

    async fn find_line_item_by_id(
        &self,
        order_id: OrderId,
        item_id: LineItemId,
    ) -> Result<LineItem, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LINE_ITEM_COLUMNS} FROM order_products WHERE id = $1 AND order_id = $2"
        ))
        .bind(item_id.as_uuid())
        .bind(order_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;

        LineItem::try_from(LineItemRow::from_pg_row(&row)?)
    }

    async fn list_line_items(&self, order_id: OrderId) -> Result<Vec<LineItem>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LINE_ITEM_COLUMNS} FROM order_products WHERE order_id = $1 ORDER BY created_at ASC"
        ))
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| LineItem::try_from(LineItemRow::from_pg_row(row)?))
            .collect()
    }
}

// ============================================================================
// Tracking Sequence
// ============================================================================

pub struct PgTrackingSequence {
    pool: PgPool,
}

#[async_trait]
impl TrackingSequence for PgTrackingSequence {
    async fn next_value(&self) -> Result<TrackingNumber, StoreError> {
        let value: i64 = sqlx::query_scalar(&format!("SELECT nextval('{TRACKING_SEQUENCE}')"))
            .fetch_one(&self.pool)
            .await?;

        tracking_number_from_db(value)
    }

    async fn reset(&self) -> Result<(), StoreError> {
        sqlx::query(&format!("ALTER SEQUENCE {TRACKING_SEQUENCE} RESTART WITH 1"))
            .execute(&self.pool)
            .await?;
        tracing::info!(sequence = TRACKING_SEQUENCE, "Tracking sequence restarted");
        Ok(())
    }
}

// ============================================================================
// Catalog and Directory
// ============================================================================

pub struct PgProductCatalog {
    pool: PgPool,
}

#[async_trait]
impl ProductCatalog for PgProductCatalog {
    async fn find_by_id(&self, id: ProductId) -> Result<ProductSnapshot, StoreError> {
        let row = sqlx::query("SELECT id, name, price_cents, deleted_at FROM products WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;

        let price: i64 = row.try_get("price_cents")?;
        Ok(ProductSnapshot {
            id: ProductId(row.try_get("id")?),
            name: row.try_get("name")?,
            price: money_from_db(price, "products.price_cents")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}

pub struct PgCustomerDirectory {
    pool: PgPool,
}

#[async_trait]
impl CustomerDirectory for PgCustomerDirectory {
    async fn find_by_id(&self, id: CustomerId) -> Result<CustomerRecord, StoreError> {
        let row = sqlx::query(
            "SELECT id, first_name, last_name, email, deleted_at FROM customers WHERE id = $1",
        )
        .bind(customer_to_db(id)?)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;

        let raw_id: i64 = row.try_get("id")?;
        Ok(CustomerRecord {
            id: customer_from_db(raw_id)?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            email: row.try_get("email")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}

// ============================================================================
// Row Mapping
// ============================================================================

/// Raw `orders` row, before domain validation.
#[derive(Debug, Clone)]
struct OrderRow {
    id: Uuid,
    revision: i64,
    customer_id: i64,
    status: i16,
    total_cents: i64,
    tracking_number: Option<i16>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ready_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
}

impl OrderRow {
    fn from_pg_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            revision: row.try_get("revision")?,
            customer_id: row.try_get("customer_id")?,
            status: row.try_get("status")?,
            total_cents: row.try_get("total_cents")?,
            tracking_number: row.try_get("tracking_number")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            ready_at: row.try_get("ready_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let status = OrderStatus::from_rank(row.status).ok_or_else(|| {
            StoreError::Corrupt(format!("order {} has unknown status {}", row.id, row.status))
        })?;
        let tracking_number = row
            .tracking_number
            .map(|n| tracking_number_from_db(n as i64))
            .transpose()?;

        Ok(Order {
            id: OrderId(row.id),
            revision: row.revision,
            customer_id: customer_from_db(row.customer_id)?,
            status,
            total: money_from_db(row.total_cents, "orders.total_cents")?,
            tracking_number,
            created_at: row.created_at,
            started_at: row.started_at,
            ready_at: row.ready_at,
            deleted_at: row.deleted_at,
        })
    }
}

/// Raw `order_products` row.
#[derive(Debug, Clone)]
struct LineItemRow {
    id: Uuid,
    order_id: Uuid,
    product_id: Uuid,
    quantity: i32,
    notes: Option<String>,
    unit_price_cents: i64,
    total_cents: i64,
    created_at: DateTime<Utc>,
}

impl LineItemRow {
    fn from_pg_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            order_id: row.try_get("order_id")?,
            product_id: row.try_get("product_id")?,
            quantity: row.try_get("quantity")?,
            notes: row.try_get("notes")?,
            unit_price_cents: row.try_get("unit_price_cents")?,
            total_cents: row.try_get("total_cents")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<LineItemRow> for LineItem {
    type Error = StoreError;

    fn try_from(row: LineItemRow) -> Result<Self, Self::Error> {
        let quantity = u16::try_from(row.quantity)
            .ok()
            .and_then(|q| Quantity::new(q).ok())
            .ok_or_else(|| {
                StoreError::Corrupt(format!("line item {} has quantity {}", row.id, row.quantity))
            })?;

        Ok(LineItem {
            id: LineItemId(row.id),
            order_id: OrderId(row.order_id),
            product_id: ProductId(row.product_id),
            quantity,
            notes: row.notes,
            unit_price: money_from_db(row.unit_price_cents, "order_products.unit_price_cents")?,
            total: money_from_db(row.total_cents, "order_products.total_cents")?,
            created_at: row.created_at,
        })
    }
}

// Tracking numbers never exceed 999
fn tracking_to_db(number: TrackingNumber) -> i16 {
    number.get() as i16
}

fn quantity_to_db(quantity: Quantity) -> i32 {
    i32::from(quantity.get())
}

fn money_to_db(money: Money) -> Result<i64, StoreError> {
    i64::try_from(money.cents())
        .map_err(|_| StoreError::Corrupt(format!("amount {} exceeds BIGINT", money.cents())))
}

fn money_from_db(cents: i64, column: &str) -> Result<Money, StoreError> {
    u64::try_from(cents)
        .map(Money::from_cents)
        .map_err(|_| StoreError::Corrupt(format!("{column} is negative: {cents}")))
}

fn customer_to_db(id: CustomerId) -> Result<i64, StoreError> {
    i64::try_from(id.get())
        .map_err(|_| StoreError::Corrupt(format!("customer id {id} exceeds BIGINT")))
}

fn customer_from_db(id: i64) -> Result<CustomerId, StoreError> {
    u64::try_from(id)
        .map(CustomerId)
        .map_err(|_| StoreError::Corrupt(format!("negative customer id {id}")))
}

fn tracking_number_from_db(value: i64) -> Result<TrackingNumber, StoreError> {
    u16::try_from(value)
        .ok()
        .and_then(TrackingNumber::new)
        .ok_or_else(|| StoreError::Corrupt(format!("tracking number {value} out of range")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ============================================================================
// Unit Tests
// ============================================================================
//
// Row conversion only; statements against a live database are exercised by
// the binary against `DATABASE_URL`.
