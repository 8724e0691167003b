// ============================================================================
// Fast-Food Order Engine
// ============================================================================
//
// Order lifecycle and composition for a quick-service restaurant: customers
// build an order incrementally, it moves through a fixed fulfillment
// pipeline, and it carries a bounded tracking number for the kitchen board.
//
// ============================================================================

pub mod config;
pub mod domain;
pub mod metrics;
pub mod store;
pub mod utils;

pub use config::{AppConfig, ConfigError};
pub use domain::order::{OrderError, OrderService, ServiceSettings, Settlement};
