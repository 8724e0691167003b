use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Whether the order engine can take requests.
///
/// Starts out not ready; the binary marks it once the storage backend is
/// connected and migrated. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct Readiness {
    ready: Arc<AtomicBool>,
    backend: Arc<OnceLock<&'static str>>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self, backend: &'static str) {
        let _ = self.backend.set(backend);
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn backend(&self) -> Option<&'static str> {
        self.backend.get().copied()
    }
}

/// Start the metrics HTTP server
/// Runs until the actix system stops; spawn it next to the engine.
pub async fn start_metrics_server(
    registry: Arc<Registry>,
    readiness: Readiness,
    port: u16,
) -> std::io::Result<()> {
    tracing::info!("📊 Starting metrics server on http://0.0.0.0:{}/metrics", port);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(registry.clone()))
            .app_data(web::Data::new(readiness.clone()))
            .route("/metrics", web::get().to(metrics_handler))
            .route("/health", web::get().to(health_handler))
    })
    .workers(1)
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

async fn metrics_handler(registry: web::Data<Arc<Registry>>) -> impl Responder {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(buffer)
}

/// 503 until the engine has a backend, so load balancers hold traffic back.
async fn health_handler(readiness: web::Data<Readiness>) -> impl Responder {
    let body = serde_json::json!({
        "service": "fastfood-orders",
        "status": if readiness.is_ready() { "ready" } else { "starting" },
        "backend": readiness.backend(),
    });

    if readiness.is_ready() {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}
