use std::sync::Arc;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fastfood_orders::domain::customer::{CustomerDirectory, CustomerId, CustomerRecord};
use fastfood_orders::domain::order::{AddProduct, Money, OrderService, Quantity};
use fastfood_orders::domain::product::{ProductCatalog, ProductId, ProductSnapshot};
use fastfood_orders::metrics::{self, Metrics, Readiness};
use fastfood_orders::store::{
    AtomicTrackingSequence, InMemoryCustomerDirectory, InMemoryOrderRepository,
    InMemoryProductCatalog, OrderRepository, PgStore, TrackingSequence,
};
use fastfood_orders::utils::{retry_with_backoff, RetryConfig};
use fastfood_orders::AppConfig;

/// Records the demo run works with.
struct DemoMenu {
    customer: CustomerRecord,
    burger: ProductSnapshot,
    fries: ProductSnapshot,
}

impl DemoMenu {
    fn new() -> Self {
        Self {
            customer: CustomerRecord::new(
                CustomerId(12345678900),
                "Maria",
                "Souza",
                "maria.souza@example.com",
            ),
            burger: ProductSnapshot::new(ProductId::new(), "X-Bacon", Money::from_cents(2490)),
            fries: ProductSnapshot::new(ProductId::new(), "Fries", Money::from_cents(990)),
        }
    }
}

struct Backend {
    orders: Arc<dyn OrderRepository>,
    products: Arc<dyn ProductCatalog>,
    customers: Arc<dyn CustomerDirectory>,
    tracking: Arc<dyn TrackingSequence>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with environment-based filtering
    // Default to INFO level, can be overridden with RUST_LOG env var
    // Example: RUST_LOG=debug cargo run
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,fastfood_orders=debug")),
        )
        .init();

    tracing::info!("🚀 Starting fast-food order engine");

    let config = AppConfig::from_env()?;
    tracing::debug!(
        postgres = config.database_url.is_some(),
        settlement_delay_ms = config.settlement_delay.as_millis() as u64,
        metrics_port = ?config.metrics_port,
        conflict_retry_attempts = config.conflict_retry_attempts,
        "Configuration loaded"
    );

    // === 1. Prometheus metrics ===
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!(
        "📊 Metrics registry created with {} metrics",
        metrics.registry().gather().len()
    );

    let readiness = Readiness::new();
    if let Some(port) = config.metrics_port {
        // actix-web gets its own runtime on a dedicated thread
        let metrics_registry = Arc::new(metrics.registry().clone());
        let readiness = readiness.clone();
        std::thread::spawn(move || {
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!("Metrics runtime error: {}", e);
                    return;
                }
            };
            rt.block_on(async {
                if let Err(e) = metrics::start_metrics_server(metrics_registry, readiness, port).await {
                    tracing::error!("Metrics server error: {}", e);
                }
            });
        });
    }

    // === 2. Storage backend ===
    let menu = DemoMenu::new();
    let (backend, backend_name) = match config.database_url.as_deref() {
        Some(url) => (postgres_backend(url, &config, &menu).await?, "postgres"),
        None => (memory_backend(&menu).await, "memory"),
    };

    // === 3. Order engine ===
    let service = OrderService::new(
        backend.orders,
        backend.products,
        backend.customers,
        backend.tracking,
        metrics.clone(),
        config.service_settings(),
    );
    readiness.mark_ready(backend_name);
    tracing::info!(backend = backend_name, "Order engine ready");

    // === 4. Demonstrate the order lifecycle ===
    run_demo(&service, &menu).await?;

    tracing::info!("🎉 Demo complete!");
    Ok(())
}

async fn memory_backend(menu: &DemoMenu) -> Backend {
    tracing::info!("Using in-memory storage (set DATABASE_URL for PostgreSQL)");

    let products = Arc::new(InMemoryProductCatalog::new());
    products.insert(menu.burger.clone()).await;
    products.insert(menu.fries.clone()).await;

    let customers = Arc::new(InMemoryCustomerDirectory::new());
    customers.insert(menu.customer.clone()).await;

    Backend {
        orders: Arc::new(InMemoryOrderRepository::new()),
        products,
        customers,
        tracking: Arc::new(AtomicTrackingSequence::new()),
    }
}

async fn postgres_backend(url: &str, config: &AppConfig, menu: &DemoMenu) -> anyhow::Result<Backend> {
    tracing::info!("Connecting to PostgreSQL...");
    let store = retry_with_backoff(RetryConfig::startup(), |_attempt| {
        PgStore::connect(url, config.database_max_connections)
    })
    .await
    .into_result()?;

    store.migrate().await?;
    seed_menu(&store, menu).await?;

    Ok(Backend {
        orders: Arc::new(store.orders()),
        products: Arc::new(store.products()),
        customers: Arc::new(store.customers()),
        tracking: Arc::new(store.tracking_sequence()),
    })
}

/// Customer and product rows are owned by other services; the demo
/// inserts its own so it can run against an empty database.
async fn seed_menu(store: &PgStore, menu: &DemoMenu) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO customers (id, first_name, last_name, email) VALUES ($1, $2, $3, $4) \
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(i64::try_from(menu.customer.id.get())?)
    .bind(&menu.customer.first_name)
    .bind(&menu.customer.last_name)
    .bind(&menu.customer.email)
    .execute(store.pool())
    .await?;

    for product in [&menu.burger, &menu.fries] {
        sqlx::query("INSERT INTO products (id, name, price_cents) VALUES ($1, $2, $3)")
            .bind(product.id.as_uuid())
            .bind(&product.name)
            .bind(i64::try_from(product.price.cents())?)
            .execute(store.pool())
            .await?;
    }

    tracing::info!(customer_id = %menu.customer.id, products = 2, "Seeded demo menu");
    Ok(())
}

async fn run_demo(service: &OrderService, menu: &DemoMenu) -> anyhow::Result<()> {
    tracing::info!("📝 Demonstrating order lifecycle");

    let customer_id = menu.customer.id;

    // A previous run may have left an open order for the demo customer
    if let Ok(stale) = service.get_by_customer(customer_id).await {
        service.cancel(stale.id).await?;
    }

    let order_id = service
        .create_or_get_active(
            customer_id,
            vec![
                AddProduct::new(menu.burger.id, Quantity::new(2)?),
                AddProduct::new(menu.fries.id, Quantity::new(1)?).with_notes("extra salt"),
            ],
        )
        .await?;

    let details = service.get_details(order_id).await?;
    tracing::info!(
        order_id = %order_id,
        total = %details.order.total,
        tracking_number = ?details.order.tracking_number.map(|n| n.to_string()),
        line_items = details.line_items.len(),
        "✅ Order composed"
    );

    // Drop the fries again
    if let Some(fries) = details.line_items.iter().find(|i| i.product_id == menu.fries.id) {
        let order = service.remove_product(order_id, fries.id).await?;
        tracing::info!(order_id = %order_id, total = %order.total, "✅ Line item removed");
    }

    let settlement = service.pay(order_id).await?;
    tracing::info!(
        order_id = %order_id,
        status = %settlement.order().status,
        "⏳ Waiting for payment settlement..."
    );
    settlement.wait().await?;

    service.prepare(order_id).await?;

    let open = service.list().await?;
    tracing::info!(open_orders = open.len(), "Kitchen board refreshed");

    let done = service.complete(order_id).await?;
    tracing::info!(
        order_id = %order_id,
        status = %done.status,
        total = %done.total,
        "✅ Order handed over"
    );

    Ok(())
}
