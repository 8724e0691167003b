// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// `order` owns the lifecycle rules. `product` and `customer` are read-only
// views of records managed elsewhere; the engine only asks whether they exist
// and, for products, what they cost right now.
//
// ============================================================================

pub mod order;
pub mod product;
pub mod customer;
