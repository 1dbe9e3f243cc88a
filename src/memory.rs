// =============================================================================
// MEMORY MODULE (tests only)
// =============================================================================
// In-memory stand-ins for PostgreSQL and Redis, plus product/coupon fixtures.
//
// LEARNING NOTES:
// - The cart engine only sees the traits in store.rs, so tests can hand it
//   these types instead of a database
// - tokio's RwLock keeps the stores usable from async tests
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::SessionResolver;
use crate::error::AppResult;
use crate::models::{Cart, Coupon, DiscountType, Inventory, Pricing, Product};
use crate::store::{CartStore, CouponDirectory, ProductCatalog};

/// Catalog, coupon directory and cart store in one.
#[derive(Default)]
pub struct MemoryStore {
    products: RwLock<HashMap<Uuid, Product>>,
    coupons: RwLock<Vec<Coupon>>,
    carts: RwLock<HashMap<Uuid, Cart>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_product(&self, product: Product) {
        self.products.write().await.insert(product.id, product);
    }

    pub async fn remove_product(&self, id: Uuid) {
        self.products.write().await.remove(&id);
    }

    pub async fn put_coupon(&self, coupon: Coupon) {
        let mut coupons = self.coupons.write().await;
        coupons.retain(|c| c.id != coupon.id);
        coupons.push(coupon);
    }

    pub async fn stored_cart(&self, user_id: Uuid) -> Option<Cart> {
        self.carts.read().await.get(&user_id).cloned()
    }
}

#[async_trait]
impl ProductCatalog for MemoryStore {
    async fn find_product(&self, id: Uuid) -> AppResult<Option<Product>> {
        Ok(self.products.read().await.get(&id).cloned())
    }

    async fn find_products(&self, ids: &[Uuid]) -> AppResult<HashMap<Uuid, Product>> {
        let products = self.products.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| products.get(id).map(|p| (*id, p.clone())))
            .collect())
    }
}

#[async_trait]
impl CouponDirectory for MemoryStore {
    async fn find_redeemable(&self, code: &str, now: DateTime<Utc>) -> AppResult<Option<Coupon>> {
        Ok(self
            .coupons
            .read()
            .await
            .iter()
            .find(|c| c.code == code && c.is_redeemable_at(now))
            .cloned())
    }

    async fn find_coupon(&self, id: Uuid) -> AppResult<Option<Coupon>> {
        Ok(self.coupons.read().await.iter().find(|c| c.id == id).cloned())
    }
}

#[async_trait]
impl CartStore for MemoryStore {
    async fn load_cart(&self, user_id: Uuid) -> AppResult<Option<Cart>> {
        Ok(self.carts.read().await.get(&user_id).cloned())
    }

    async fn save_cart(&self, cart: &Cart) -> AppResult<()> {
        self.carts.write().await.insert(cart.user_id, cart.clone());
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Token -> user table.
#[derive(Default)]
pub struct MemorySessions {
    sessions: RwLock<HashMap<String, Uuid>>,
}

impl MemorySessions {
    pub async fn insert(&self, token: &str, user_id: Uuid) {
        self.sessions.write().await.insert(token.to_string(), user_id);
    }
}

#[async_trait]
impl SessionResolver for MemorySessions {
    async fn resolve(&self, token: &str) -> AppResult<Option<Uuid>> {
        Ok(self.sessions.read().await.get(token).copied())
    }

    async fn ping(&self) -> bool {
        true
    }
}

// -----------------------------------------------------------------------------
// FIXTURES
// -----------------------------------------------------------------------------

pub fn product(base_price: i64, stock: i32) -> Product {
    Product {
        id: Uuid::new_v4(),
        name: "Glazed Ceramic Wall Tile".to_string(),
        images: vec!["https://cdn.example.com/tiles/glazed.jpg".to_string()],
        pricing: Pricing {
            base_price: Decimal::from(base_price),
            sale_price: None,
        },
        inventory: Inventory {
            stock,
            allow_out_of_stock_purchase: false,
        },
    }
}

pub fn coupon(code: &str, discount_type: DiscountType, value: i64) -> Coupon {
    let now = Utc::now();
    Coupon {
        id: Uuid::new_v4(),
        code: code.to_string(),
        description: None,
        discount_type,
        discount_value: Decimal::from(value),
        min_order_value: None,
        max_discount: None,
        start_date: now - chrono::Duration::days(7),
        end_date: now + chrono::Duration::days(7),
        usage_limit: None,
        used_count: 0,
        is_active: true,
    }
}
