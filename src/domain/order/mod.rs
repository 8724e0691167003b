// ============================================================================
// Order Domain - Lifecycle & Composition
// ============================================================================
//
// This module contains ALL Order-specific code:
// - Value objects (OrderId, Money, Quantity, TrackingNumber, OrderStatus)
// - Entities (Order, LineItem) and the OrderPatch partial update
// - Commands (AddProduct, Transition)
// - Errors (OrderError enum)
// - Tracking number allocation
// - The OrderService engine
//
// Persistence is reached only through the `store` contracts.
//
// ============================================================================

pub mod value_objects;
pub mod commands;
pub mod errors;
pub mod aggregate;
pub mod line_item;
pub mod patch;
pub mod tracking;
pub mod service;

// Re-export for convenience
pub use value_objects::*;
pub use commands::*;
pub use errors::*;
pub use aggregate::*;
pub use line_item::*;
pub use patch::*;
pub use tracking::*;
pub use service::*;
