// =============================================================================
// STORE MODULE
// =============================================================================
// The cart engine talks to three collaborators. Each one is a trait so the
// engine does not care whether it runs against PostgreSQL (db.rs) or the
// in-memory stores used by the tests (memory.rs).
//
// LEARNING NOTE:
// Async functions in trait objects (Arc<dyn Trait>) need the async_trait
// macro: it rewrites `async fn` into a method returning a boxed future.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{Cart, Coupon, Product};

/// Read path of the product catalog.
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn find_product(&self, id: Uuid) -> AppResult<Option<Product>>;

    /// Batch lookup. Ids without a catalog entry are absent from the map.
    async fn find_products(&self, ids: &[Uuid]) -> AppResult<HashMap<Uuid, Product>>;
}

/// Read path of the coupon directory.
#[async_trait]
pub trait CouponDirectory: Send + Sync {
    /// Coupon with this (already normalized) code that is active and whose
    /// validity window contains `now`.
    async fn find_redeemable(&self, code: &str, now: DateTime<Utc>) -> AppResult<Option<Coupon>>;

    /// Unfiltered lookup, used to render the coupon attached to a cart.
    async fn find_coupon(&self, id: Uuid) -> AppResult<Option<Coupon>>;
}

/// Persistent carts, keyed by user.
#[async_trait]
pub trait CartStore: Send + Sync {
    async fn load_cart(&self, user_id: Uuid) -> AppResult<Option<Cart>>;

    /// Writes the whole cart atomically, creating it on first save.
    async fn save_cart(&self, cart: &Cart) -> AppResult<()>;

    async fn health_check(&self) -> bool;
}
