// =============================================================================
// CART MODULE - Cart & Pricing Engine
// =============================================================================
// Owns the per-user cart: line items, coupon attachment and the derived
// discount/total. Products and coupons are only ever read.
//
// RULES WORTH KNOWING:
// - Every item mutation refreshes price snapshots from the catalog and
//   re-derives total = max(0, subtotal - discount).
// - The discount is sticky: item mutations reuse the stored discount and do
//   not re-check the coupon. Only apply/revalidate recompute it.
// - The store write is the last step of every operation, so a failed
//   operation persists nothing.
// - Mutations for one user are serialized with an in-process lock.
// =============================================================================

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Cart, CartItem, CartItemView, CartView, Coupon, Product};
use crate::store::{CartStore, CouponDirectory, ProductCatalog};

/// Lock entries are pruned once the table grows past this size.
const LOCK_TABLE_PRUNE_AT: usize = 1024;

/// Upper bound for a single line's quantity.
pub const MAX_LINE_QUANTITY: i32 = 9_999;

/// Engine settings, resolved from configuration at startup.
#[derive(Debug, Clone)]
pub struct CartSettings {
    /// Currency code reported in cart views
    pub currency: String,

    /// Quantity used when an add-item request does not name one
    pub default_quantity: i32,
}

/// Outcome of re-checking the coupon attached to a cart.
#[derive(Debug, Clone, PartialEq)]
pub enum Revalidation {
    /// Still applicable; the discount was recomputed.
    Kept,
    /// No longer applicable; the coupon was detached for this reason.
    Dropped(String),
}

// -----------------------------------------------------------------------------
// PER-USER SERIALIZATION
// -----------------------------------------------------------------------------
#[derive(Default)]
struct UserLocks {
    table: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl UserLocks {
    async fn acquire(&self, user_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock().await;
            if table.len() >= LOCK_TABLE_PRUNE_AT {
                table.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            table.entry(user_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

// =============================================================================
// ENGINE
// =============================================================================
pub struct CartEngine {
    products: Arc<dyn ProductCatalog>,
    coupons: Arc<dyn CouponDirectory>,
    carts: Arc<dyn CartStore>,
    settings: CartSettings,
    locks: UserLocks,
}

impl CartEngine {
    pub fn new(
        products: Arc<dyn ProductCatalog>,
        coupons: Arc<dyn CouponDirectory>,
        carts: Arc<dyn CartStore>,
        settings: CartSettings,
    ) -> Self {
        Self {
            products,
            coupons,
            carts,
            settings,
            locks: UserLocks::default(),
        }
    }

    /// Whether the cart store is reachable.
    pub async fn store_healthy(&self) -> bool {
        self.carts.health_check().await
    }

    // -------------------------------------------------------------------------
    // READ
    // -------------------------------------------------------------------------

    /// The user's cart, or an empty view if they never had one.
    pub async fn get_cart(&self, user_id: Uuid) -> AppResult<CartView> {
        match self.load_cart(user_id).await? {
            Some(cart) => self.render(&cart).await,
            None => Ok(CartView::empty(&self.settings.currency)),
        }
    }

    // -------------------------------------------------------------------------
    // ITEM MUTATIONS
    // -------------------------------------------------------------------------

    /// Adds `quantity` units of a product, merging into an existing line.
    ///
    /// Stock is checked against the resulting line quantity. The cart is
    /// created on first use.
    pub async fn add_item(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: Option<i32>,
    ) -> AppResult<CartView> {
        let quantity = quantity.unwrap_or(self.settings.default_quantity);
        if quantity < 1 {
            return Err(AppError::InvalidArgument(
                "Quantity must be at least 1".to_string(),
            ));
        }

        ensure_within_limit(quantity)?;

        let product = self.find_product(product_id).await?;
        ensure_stock(&product, quantity)?;

        let _guard = self.locks.acquire(user_id).await;
        let mut cart = self
            .load_cart(user_id)
            .await?
            .unwrap_or_else(|| Cart::new(user_id));

        let price = product.pricing.effective_price();
        match cart.line_for_product_mut(product_id) {
            Some(line) => {
                let merged = line.quantity.saturating_add(quantity);
                ensure_within_limit(merged)?;
                ensure_stock(&product, merged)?;
                line.quantity = merged;
                line.price = price;
            }
            None => cart.items.push(CartItem::new(product_id, quantity, price)),
        }

        let products = self.recompute(&mut cart).await?;
        self.carts.save_cart(&cart).await?;

        info!(%user_id, %product_id, quantity, total = %cart.total, "Item added to cart");
        self.view(&cart, &products).await
    }

    /// Sets the absolute quantity of a line item.
    pub async fn update_item(
        &self,
        user_id: Uuid,
        item_id: Uuid,
        quantity: Option<i32>,
    ) -> AppResult<CartView> {
        let quantity = match quantity {
            Some(q) if q >= 1 => q,
            _ => {
                return Err(AppError::InvalidArgument(
                    "Valid quantity is required".to_string(),
                ))
            }
        };
        ensure_within_limit(quantity)?;

        let _guard = self.locks.acquire(user_id).await;
        let mut cart = self.existing_cart(user_id).await?;

        let product_id = cart
            .items
            .iter()
            .find(|item| item.id == item_id)
            .map(|item| item.product_id)
            .ok_or_else(|| AppError::NotFound("Item not found in cart".to_string()))?;

        let product = self.find_product(product_id).await?;
        ensure_stock(&product, quantity)?;

        if let Some(line) = cart.item_mut(item_id) {
            line.quantity = quantity;
        }

        let products = self.recompute(&mut cart).await?;
        self.carts.save_cart(&cart).await?;

        info!(%user_id, %item_id, quantity, total = %cart.total, "Cart item updated");
        self.view(&cart, &products).await
    }

    /// Removes a line item. An unknown item id leaves the cart unchanged
    /// and still succeeds.
    pub async fn remove_item(&self, user_id: Uuid, item_id: Uuid) -> AppResult<CartView> {
        let _guard = self.locks.acquire(user_id).await;
        let mut cart = self.existing_cart(user_id).await?;

        let before = cart.items.len();
        cart.items.retain(|item| item.id != item_id);
        if cart.items.len() == before {
            debug!(%user_id, %item_id, "No line item matched; nothing removed");
        }

        let products = self.recompute(&mut cart).await?;
        self.carts.save_cart(&cart).await?;

        info!(%user_id, %item_id, total = %cart.total, "Item removed from cart");
        self.view(&cart, &products).await
    }

    /// Empties the cart and drops its coupon.
    pub async fn clear_cart(&self, user_id: Uuid) -> AppResult<CartView> {
        let _guard = self.locks.acquire(user_id).await;
        let mut cart = self.existing_cart(user_id).await?;

        cart.clear();
        self.carts.save_cart(&cart).await?;

        info!(%user_id, "Cart cleared");
        self.view(&cart, &HashMap::new()).await
    }

    // -------------------------------------------------------------------------
    // COUPONS
    // -------------------------------------------------------------------------

    /// Validates a coupon code and attaches it with a freshly computed
    /// discount. The coupon's usage count is not touched.
    pub async fn apply_coupon(&self, user_id: Uuid, code: Option<&str>) -> AppResult<CartView> {
        let code = code
            .map(Coupon::normalize_code)
            .filter(|code| !code.is_empty())
            .ok_or_else(|| AppError::InvalidArgument("Coupon code is required".to_string()))?;

        let coupon = self
            .coupons
            .find_redeemable(&code, Utc::now())
            .await?
            .ok_or_else(invalid_or_expired)?;
        ensure_usage_left(&coupon)?;

        let _guard = self.locks.acquire(user_id).await;
        let mut cart = self
            .load_cart(user_id)
            .await?
            .ok_or_else(cart_is_empty)?;

        let discount = discount_against(&cart, &coupon)?;
        cart.attach_coupon(coupon.id, discount);
        self.carts.save_cart(&cart).await?;

        info!(%user_id, code = %coupon.code, %discount, total = %cart.total, "Coupon applied");
        self.render(&cart).await
    }

    /// Detaches the coupon; total goes back to the subtotal.
    pub async fn remove_coupon(&self, user_id: Uuid) -> AppResult<CartView> {
        let _guard = self.locks.acquire(user_id).await;
        let mut cart = self.existing_cart(user_id).await?;

        cart.detach_coupon();
        self.carts.save_cart(&cart).await?;

        info!(%user_id, total = %cart.total, "Coupon removed");
        self.render(&cart).await
    }

    /// Re-runs the coupon rules for the attached coupon against the current
    /// subtotal. A coupon that no longer qualifies is detached.
    pub async fn revalidate_coupon(&self, user_id: Uuid) -> AppResult<(Revalidation, CartView)> {
        let _guard = self.locks.acquire(user_id).await;
        let mut cart = self.existing_cart(user_id).await?;

        let coupon_id = cart
            .coupon_id
            .ok_or_else(|| AppError::NotFound("No coupon applied to cart".to_string()))?;

        let now = Utc::now();
        let verdict = match self.coupons.find_coupon(coupon_id).await? {
            Some(coupon) if coupon.is_redeemable_at(now) => ensure_usage_left(&coupon)
                .and_then(|_| discount_against(&cart, &coupon)),
            _ => Err(invalid_or_expired()),
        };

        let outcome = match verdict {
            Ok(discount) => {
                cart.attach_coupon(coupon_id, discount);
                Revalidation::Kept
            }
            Err(reason) => {
                warn!(%user_id, %coupon_id, reason = %reason, "Attached coupon no longer applies");
                cart.detach_coupon();
                Revalidation::Dropped(reason.public_message())
            }
        };
        self.carts.save_cart(&cart).await?;

        let view = self.render(&cart).await?;
        Ok((outcome, view))
    }

    // -------------------------------------------------------------------------
    // INTERNALS
    // -------------------------------------------------------------------------

    /// Loads the stored cart, releasing a discount left without a coupon.
    async fn load_cart(&self, user_id: Uuid) -> AppResult<Option<Cart>> {
        let mut cart = self.carts.load_cart(user_id).await?;
        if let Some(cart) = cart.as_mut() {
            if cart.release_orphaned_discount() {
                warn!(%user_id, "Cart discount had no coupon; released");
            }
        }
        Ok(cart)
    }

    async fn existing_cart(&self, user_id: Uuid) -> AppResult<Cart> {
        self.load_cart(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Cart not found".to_string()))
    }

    async fn find_product(&self, product_id: Uuid) -> AppResult<Product> {
        self.products
            .find_product(product_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Product not found".to_string()))
    }

    /// Refreshes every price snapshot from the catalog, then re-derives the
    /// total with the stored discount. Returns the products it read.
    async fn recompute(&self, cart: &mut Cart) -> AppResult<HashMap<Uuid, Product>> {
        let ids: Vec<Uuid> = cart.items.iter().map(|item| item.product_id).collect();
        let products = self.products.find_products(&ids).await?;

        for item in &mut cart.items {
            match products.get(&item.product_id) {
                Some(product) => item.price = product.pricing.effective_price(),
                None => warn!(
                    product_id = %item.product_id,
                    price = %item.price,
                    "Product missing from catalog; keeping price snapshot"
                ),
            }
        }

        cart.settle_total();
        Ok(products)
    }

    async fn render(&self, cart: &Cart) -> AppResult<CartView> {
        let ids: Vec<Uuid> = cart.items.iter().map(|item| item.product_id).collect();
        let products = if ids.is_empty() {
            HashMap::new()
        } else {
            self.products.find_products(&ids).await?
        };
        self.view(cart, &products).await
    }

    async fn view(&self, cart: &Cart, products: &HashMap<Uuid, Product>) -> AppResult<CartView> {
        let coupon = match cart.coupon_id {
            Some(id) => self.coupons.find_coupon(id).await?.map(|c| c.summary()),
            None => None,
        };

        let items = cart
            .items
            .iter()
            .map(|item| CartItemView {
                id: item.id,
                product_id: item.product_id,
                product: products.get(&item.product_id).cloned(),
                quantity: item.quantity,
                price: item.price,
                line_total: item.line_total(),
            })
            .collect();

        Ok(CartView {
            items,
            item_count: cart.item_count(),
            subtotal: cart.subtotal(),
            discount: cart.discount,
            total: cart.total,
            coupon,
            currency: self.settings.currency.clone(),
            updated_at: Some(cart.updated_at),
        })
    }
}

// -----------------------------------------------------------------------------
// RULES
// -----------------------------------------------------------------------------

fn ensure_stock(product: &Product, requested: i32) -> AppResult<()> {
    if product.inventory.can_supply(requested) {
        Ok(())
    } else {
        Err(AppError::InsufficientStock {
            available: product.inventory.stock,
            requested,
        })
    }
}

fn ensure_within_limit(quantity: i32) -> AppResult<()> {
    if quantity > MAX_LINE_QUANTITY {
        Err(AppError::InvalidArgument(format!(
            "Quantity cannot exceed {MAX_LINE_QUANTITY}"
        )))
    } else {
        Ok(())
    }
}

fn ensure_usage_left(coupon: &Coupon) -> AppResult<()> {
    if coupon.usage_exhausted() {
        Err(AppError::LimitExceeded("Coupon usage limit exceeded".to_string()))
    } else {
        Ok(())
    }
}

/// Discount `coupon` grants on the cart's current (pre-discount) subtotal.
fn discount_against(cart: &Cart, coupon: &Coupon) -> AppResult<Decimal> {
    if cart.is_empty() {
        return Err(cart_is_empty());
    }

    let subtotal = cart.subtotal();
    if let Some(minimum) = coupon.minimum_order() {
        if subtotal < minimum {
            return Err(AppError::BelowMinimum { minimum });
        }
    }

    Ok(coupon.discount_for(subtotal))
}

fn invalid_or_expired() -> AppError {
    AppError::NotFound("Invalid or expired coupon".to_string())
}

fn cart_is_empty() -> AppError {
    AppError::InvalidState("Cart is empty".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{coupon, product, MemoryStore};
    use crate::models::DiscountType;
    use chrono::Duration;

    fn engine(store: &Arc<MemoryStore>) -> CartEngine {
        CartEngine::new(
            store.clone(),
            store.clone(),
            store.clone(),
            CartSettings {
                currency: "INR".to_string(),
                default_quantity: 1,
            },
        )
    }

    fn dec(value: i64) -> Decimal {
        Decimal::from(value)
    }

    /// total == max(0, sum(price * quantity) - discount), from the view alone.
    fn assert_total_invariant(view: &CartView) {
        let subtotal: Decimal = view
            .items
            .iter()
            .map(|item| item.price * Decimal::from(item.quantity))
            .sum();
        assert_eq!(view.subtotal, subtotal);
        assert_eq!(view.total, (subtotal - view.discount).max(Decimal::ZERO));
    }

    async fn stocked(store: &MemoryStore, price: i64, stock: i32) -> Product {
        let p = product(price, stock);
        store.put_product(p.clone()).await;
        p
    }

    // -------------------------------------------------------------------------
    // GET
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_missing_cart_reads_as_empty() {
        let store = Arc::new(MemoryStore::new());
        let view = engine(&store).get_cart(Uuid::new_v4()).await.unwrap();

        assert!(view.items.is_empty());
        assert_eq!(view.total, Decimal::ZERO);
        assert_eq!(view.discount, Decimal::ZERO);
        assert!(view.coupon.is_none());
        assert_eq!(view.currency, "INR");
    }

    // -------------------------------------------------------------------------
    // ADD
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_adding_same_product_merges_lines() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();
        let tile = stocked(&store, 100, 5).await;

        engine.add_item(user, tile.id, Some(3)).await.unwrap();
        let view = engine.add_item(user, tile.id, Some(2)).await.unwrap();

        assert_eq!(view.items.len(), 1);
        assert_eq!(view.items[0].quantity, 5);
        assert_eq!(view.total, dec(500));
        assert_eq!(view.item_count, 5);
        assert_total_invariant(&view);
    }

    #[tokio::test]
    async fn test_add_over_stock_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();
        let tile = stocked(&store, 100, 5).await;

        let err = engine.add_item(user, tile.id, Some(6)).await.unwrap_err();
        assert!(matches!(err, AppError::InsufficientStock { available: 5, requested: 6 }));
        assert!(store.stored_cart(user).await.is_none());
    }

    #[tokio::test]
    async fn test_add_checks_stock_against_merged_quantity() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();
        let tile = stocked(&store, 100, 5).await;

        engine.add_item(user, tile.id, Some(3)).await.unwrap();
        let err = engine.add_item(user, tile.id, Some(3)).await.unwrap_err();
        assert!(matches!(err, AppError::InsufficientStock { requested: 6, .. }));

        let stored = store.stored_cart(user).await.unwrap();
        assert_eq!(stored.items[0].quantity, 3);
    }

    #[tokio::test]
    async fn test_backorder_products_skip_stock_check() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let mut tile = product(40, 0);
        tile.inventory.allow_out_of_stock_purchase = true;
        store.put_product(tile.clone()).await;

        let view = engine.add_item(Uuid::new_v4(), tile.id, Some(25)).await.unwrap();
        assert_eq!(view.total, dec(1000));
    }

    #[tokio::test]
    async fn test_line_quantity_is_bounded() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();
        let mut a = product(1, 0);
        a.inventory.allow_out_of_stock_purchase = true;
        let mut b = product(1, 0);
        b.inventory.allow_out_of_stock_purchase = true;
        store.put_product(a.clone()).await;
        store.put_product(b.clone()).await;

        let err = engine.add_item(user, a.id, Some(i32::MAX)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
        assert!(store.stored_cart(user).await.is_none());

        let view = engine.add_item(user, a.id, Some(MAX_LINE_QUANTITY)).await.unwrap();
        let item_id = view.items[0].id;
        let err = engine.add_item(user, a.id, Some(1)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));

        let err = engine.update_item(user, item_id, Some(i32::MAX)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));

        let view = engine.add_item(user, b.id, Some(1)).await.unwrap();
        assert_eq!(view.item_count, MAX_LINE_QUANTITY + 1);
        assert_eq!(view.total, dec(i64::from(MAX_LINE_QUANTITY) + 1));
    }

    #[tokio::test]
    async fn test_add_unknown_product_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();

        let err = engine(&store).add_item(user, Uuid::new_v4(), Some(1)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(store.stored_cart(user).await.is_none());
    }

    #[tokio::test]
    async fn test_add_uses_default_quantity_and_rejects_zero() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();
        let tile = stocked(&store, 100, 5).await;

        let view = engine.add_item(user, tile.id, None).await.unwrap();
        assert_eq!(view.items[0].quantity, 1);

        let err = engine.add_item(user, tile.id, Some(0)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_add_uses_sale_price() {
        let store = Arc::new(MemoryStore::new());
        let mut tile = product(100, 10);
        tile.pricing.sale_price = Some(dec(75));
        store.put_product(tile.clone()).await;

        let view = engine(&store).add_item(Uuid::new_v4(), tile.id, Some(2)).await.unwrap();
        assert_eq!(view.items[0].price, dec(75));
        assert_eq!(view.total, dec(150));
    }

    // -------------------------------------------------------------------------
    // UPDATE / REMOVE / CLEAR
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_update_over_stock_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();
        let tile = stocked(&store, 100, 5).await;

        let view = engine.add_item(user, tile.id, Some(5)).await.unwrap();
        let item_id = view.items[0].id;

        let err = engine.update_item(user, item_id, Some(6)).await.unwrap_err();
        assert!(matches!(err, AppError::InsufficientStock { available: 5, requested: 6 }));

        let view = engine.update_item(user, item_id, Some(2)).await.unwrap();
        assert_eq!(view.items[0].quantity, 2);
        assert_eq!(view.total, dec(200));
    }

    #[tokio::test]
    async fn test_update_validation() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();

        let err = engine.update_item(user, Uuid::new_v4(), Some(0)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));

        let err = engine.update_item(user, Uuid::new_v4(), None).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));

        let err = engine.update_item(user, Uuid::new_v4(), Some(1)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(ref msg) if msg == "Cart not found"));

        let tile = stocked(&store, 100, 5).await;
        engine.add_item(user, tile.id, Some(1)).await.unwrap();
        let err = engine.update_item(user, Uuid::new_v4(), Some(1)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(ref msg) if msg == "Item not found in cart"));
    }

    #[tokio::test]
    async fn test_mutations_refresh_price_snapshots() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();
        let mut tile = stocked(&store, 100, 10).await;

        let view = engine.add_item(user, tile.id, Some(2)).await.unwrap();
        let item_id = view.items[0].id;

        tile.pricing.sale_price = Some(dec(90));
        store.put_product(tile.clone()).await;

        // snapshot is cached until the cart is next touched
        let view = engine.get_cart(user).await.unwrap();
        assert_eq!(view.items[0].price, dec(100));

        let view = engine.update_item(user, item_id, Some(3)).await.unwrap();
        assert_eq!(view.items[0].price, dec(90));
        assert_eq!(view.total, dec(270));
    }

    #[tokio::test]
    async fn test_vanished_product_keeps_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();
        let gone = stocked(&store, 60, 10).await;
        let kept = stocked(&store, 40, 10).await;

        engine.add_item(user, gone.id, Some(1)).await.unwrap();
        store.remove_product(gone.id).await;

        let view = engine.add_item(user, kept.id, Some(1)).await.unwrap();
        assert_eq!(view.total, dec(100));
        assert!(view.items[0].product.is_none());
        assert!(view.items[1].product.is_some());
    }

    #[tokio::test]
    async fn test_remove_item() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();
        let a = stocked(&store, 100, 5).await;
        let b = stocked(&store, 30, 5).await;

        engine.add_item(user, a.id, Some(1)).await.unwrap();
        let view = engine.add_item(user, b.id, Some(2)).await.unwrap();
        let a_line = view.items[0].id;

        let view = engine.remove_item(user, a_line).await.unwrap();
        assert_eq!(view.items.len(), 1);
        assert_eq!(view.total, dec(60));

        // unknown id: silent success, nothing changes
        let view = engine.remove_item(user, Uuid::new_v4()).await.unwrap();
        assert_eq!(view.items.len(), 1);
        assert_eq!(view.total, dec(60));
    }

    #[tokio::test]
    async fn test_remove_and_clear_need_a_cart() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();

        assert!(matches!(engine.remove_item(user, Uuid::new_v4()).await, Err(AppError::NotFound(_))));
        assert!(matches!(engine.clear_cart(user).await, Err(AppError::NotFound(_))));
        assert!(matches!(engine.remove_coupon(user).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();
        let tile = stocked(&store, 100, 5).await;
        let promo = coupon("FLAT50", DiscountType::Fixed, 50);
        store.put_coupon(promo).await;

        engine.add_item(user, tile.id, Some(2)).await.unwrap();
        engine.apply_coupon(user, Some("FLAT50")).await.unwrap();

        for _ in 0..2 {
            let view = engine.clear_cart(user).await.unwrap();
            assert!(view.items.is_empty());
            assert_eq!(view.total, Decimal::ZERO);
            assert_eq!(view.discount, Decimal::ZERO);
            assert!(view.coupon.is_none());
        }
        let stored = store.stored_cart(user).await.unwrap();
        assert!(stored.coupon_id.is_none());
    }

    // -------------------------------------------------------------------------
    // COUPONS
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_percentage_coupon_is_capped() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let tile = stocked(&store, 100, 10).await;
        let mut promo = coupon("TILE10", DiscountType::Percentage, 10);
        promo.max_discount = Some(dec(30));
        store.put_coupon(promo).await;

        let big = Uuid::new_v4();
        engine.add_item(big, tile.id, Some(4)).await.unwrap();
        let view = engine.apply_coupon(big, Some("tile10")).await.unwrap();
        assert_eq!(view.discount, dec(30));
        assert_eq!(view.total, dec(370));
        assert_eq!(view.coupon.as_ref().map(|c| c.code.as_str()), Some("TILE10"));
        assert_total_invariant(&view);

        let small = Uuid::new_v4();
        engine.add_item(small, tile.id, Some(1)).await.unwrap();
        let view = engine.apply_coupon(small, Some("TILE10")).await.unwrap();
        assert_eq!(view.discount, dec(10));
        assert_eq!(view.total, dec(90));
    }

    #[tokio::test]
    async fn test_below_minimum_leaves_cart_untouched() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();
        let tile = stocked(&store, 100, 10).await;
        store.put_coupon(coupon("FLAT20", DiscountType::Fixed, 20)).await;
        let mut big_spender = coupon("BIG50", DiscountType::Fixed, 50);
        big_spender.min_order_value = Some(dec(500));
        store.put_coupon(big_spender).await;

        engine.add_item(user, tile.id, Some(4)).await.unwrap();
        engine.apply_coupon(user, Some("FLAT20")).await.unwrap();
        let before = store.stored_cart(user).await.unwrap();

        let err = engine.apply_coupon(user, Some("BIG50")).await.unwrap_err();
        assert!(matches!(err, AppError::BelowMinimum { minimum } if minimum == dec(500)));

        let after = store.stored_cart(user).await.unwrap();
        assert_eq!(after.discount, dec(20));
        assert_eq!(after.coupon_id, before.coupon_id);
        assert_eq!(after.total, dec(380));
    }

    #[tokio::test]
    async fn test_exhausted_coupon_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();
        let tile = stocked(&store, 100, 10).await;
        let mut promo = coupon("ONCE", DiscountType::Fixed, 10);
        promo.usage_limit = Some(1);
        promo.used_count = 1;
        store.put_coupon(promo).await;

        engine.add_item(user, tile.id, Some(1)).await.unwrap();
        let err = engine.apply_coupon(user, Some("ONCE")).await.unwrap_err();
        assert!(matches!(err, AppError::LimitExceeded(_)));
    }

    #[tokio::test]
    async fn test_unknown_inactive_or_expired_coupon_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();
        let tile = stocked(&store, 100, 10).await;
        engine.add_item(user, tile.id, Some(1)).await.unwrap();

        let mut expired = coupon("OLD", DiscountType::Fixed, 10);
        expired.end_date = Utc::now() - Duration::days(1);
        store.put_coupon(expired).await;
        let mut inactive = coupon("OFF", DiscountType::Fixed, 10);
        inactive.is_active = false;
        store.put_coupon(inactive).await;

        for code in ["NOPE", "OLD", "OFF"] {
            let err = engine.apply_coupon(user, Some(code)).await.unwrap_err();
            assert!(matches!(err, AppError::NotFound(ref msg) if msg == "Invalid or expired coupon"));
        }

        let err = engine.apply_coupon(user, Some("  ")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_coupon_on_empty_cart_is_invalid_state() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();
        store.put_coupon(coupon("FLAT20", DiscountType::Fixed, 20)).await;

        let err = engine.apply_coupon(user, Some("FLAT20")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));

        let tile = stocked(&store, 100, 10).await;
        let view = engine.add_item(user, tile.id, Some(1)).await.unwrap();
        engine.remove_item(user, view.items[0].id).await.unwrap();

        let err = engine.apply_coupon(user, Some("FLAT20")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_fixed_coupon_larger_than_subtotal_floors_at_zero() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();
        let tile = stocked(&store, 100, 10).await;
        store.put_coupon(coupon("HUGE", DiscountType::Fixed, 1000)).await;

        engine.add_item(user, tile.id, Some(2)).await.unwrap();
        let view = engine.apply_coupon(user, Some("HUGE")).await.unwrap();
        assert_eq!(view.discount, dec(1000));
        assert_eq!(view.total, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_remove_coupon_restores_subtotal() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();
        let tile = stocked(&store, 100, 10).await;
        store.put_coupon(coupon("HUGE", DiscountType::Fixed, 1000)).await;

        engine.add_item(user, tile.id, Some(3)).await.unwrap();
        engine.apply_coupon(user, Some("HUGE")).await.unwrap();

        let view = engine.remove_coupon(user).await.unwrap();
        assert_eq!(view.discount, Decimal::ZERO);
        assert_eq!(view.total, dec(300));
        assert!(view.coupon.is_none());
    }

    #[tokio::test]
    async fn test_discount_is_sticky_across_item_mutations() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();
        let tile = stocked(&store, 100, 10).await;
        let mut promo = coupon("TILE10", DiscountType::Percentage, 10);
        promo.max_discount = Some(dec(30));
        promo.min_order_value = Some(dec(300));
        store.put_coupon(promo).await;

        let view = engine.add_item(user, tile.id, Some(4)).await.unwrap();
        let item_id = view.items[0].id;
        engine.apply_coupon(user, Some("TILE10")).await.unwrap();

        // below the coupon minimum now, but the discount stays
        let view = engine.update_item(user, item_id, Some(1)).await.unwrap();
        assert_eq!(view.discount, dec(30));
        assert_eq!(view.total, dec(70));
        assert!(view.coupon.is_some());
        assert_total_invariant(&view);
    }

    #[tokio::test]
    async fn test_discount_without_coupon_reference_is_released() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();
        let tile = stocked(&store, 100, 10).await;
        store.put_coupon(coupon("FLAT50", DiscountType::Fixed, 50)).await;

        engine.add_item(user, tile.id, Some(2)).await.unwrap();
        engine.apply_coupon(user, Some("FLAT50")).await.unwrap();

        // coupon deleted: the store nulls the reference, the amount stays
        let mut stored = store.stored_cart(user).await.unwrap();
        stored.coupon_id = None;
        store.save_cart(&stored).await.unwrap();

        let view = engine.get_cart(user).await.unwrap();
        assert_eq!(view.discount, Decimal::ZERO);
        assert_eq!(view.total, dec(200));
        assert!(view.coupon.is_none());

        let view = engine.add_item(user, tile.id, Some(1)).await.unwrap();
        assert_eq!(view.discount, Decimal::ZERO);
        assert_eq!(view.total, dec(300));
        assert_eq!(store.stored_cart(user).await.unwrap().discount, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_revalidate_recomputes_or_drops_coupon() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();
        let tile = stocked(&store, 100, 10).await;
        let mut promo = coupon("TILE10", DiscountType::Percentage, 10);
        promo.min_order_value = Some(dec(200));
        store.put_coupon(promo).await;

        let view = engine.add_item(user, tile.id, Some(5)).await.unwrap();
        let item_id = view.items[0].id;
        engine.apply_coupon(user, Some("TILE10")).await.unwrap();

        engine.update_item(user, item_id, Some(3)).await.unwrap();
        let (outcome, view) = engine.revalidate_coupon(user).await.unwrap();
        assert_eq!(outcome, Revalidation::Kept);
        assert_eq!(view.discount, dec(30));
        assert_eq!(view.total, dec(270));

        engine.update_item(user, item_id, Some(1)).await.unwrap();
        let (outcome, view) = engine.revalidate_coupon(user).await.unwrap();
        assert!(matches!(outcome, Revalidation::Dropped(ref reason) if reason.contains("200")));
        assert_eq!(view.discount, Decimal::ZERO);
        assert_eq!(view.total, dec(100));
        assert!(view.coupon.is_none());

        let err = engine.revalidate_coupon(user).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    // -------------------------------------------------------------------------
    // INVARIANTS
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_total_invariant_holds_across_mutations() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let user = Uuid::new_v4();
        let a = stocked(&store, 120, 50).await;
        let b = stocked(&store, 45, 50).await;
        store.put_coupon(coupon("FLAT100", DiscountType::Fixed, 100)).await;

        let mut views = Vec::new();
        views.push(engine.add_item(user, a.id, Some(2)).await.unwrap());
        views.push(engine.add_item(user, b.id, Some(3)).await.unwrap());
        views.push(engine.apply_coupon(user, Some("FLAT100")).await.unwrap());
        let b_line = views[2].items[1].id;
        views.push(engine.update_item(user, b_line, Some(7)).await.unwrap());
        let a_line = views[3].items[0].id;
        views.push(engine.remove_item(user, a_line).await.unwrap());
        views.push(engine.update_item(user, b_line, Some(1)).await.unwrap());
        views.push(engine.remove_coupon(user).await.unwrap());

        for view in &views {
            assert_total_invariant(view);
        }
        assert_eq!(views[5].total, Decimal::ZERO);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_for_one_user_are_serialized() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(engine(&store));
        let user = Uuid::new_v4();
        let tile_id = stocked(&store, 10, 1000).await.id;

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.add_item(user, tile_id, Some(1)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stored = store.stored_cart(user).await.unwrap();
        assert_eq!(stored.items.len(), 1);
        assert_eq!(stored.items[0].quantity, 20);
        assert_eq!(stored.total, dec(200));
    }
}
