// =============================================================================
// MODELS MODULE
// =============================================================================
// This module defines the data structures used throughout the service.
//
// LEARNING NOTES:
// - Rust uses structs to define data structures
// - Derive macros automatically implement common traits
// - Serde handles JSON serialization/deserialization
// - #[serde(rename_all = "camelCase")] keeps Rust snake_case fields while
//   the wire format uses productId, discountType, ...
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// =============================================================================
// CATALOG PRODUCT
// =============================================================================
// The cart only ever reads products. This is the slice of a catalog entry the
// pricing engine needs, and also the summary embedded in cart views.
// -----------------------------------------------------------------------------

/// Price list of a product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pricing {
    /// Regular unit price
    pub base_price: Decimal,

    /// Promotional unit price, when the product is on sale
    pub sale_price: Option<Decimal>,
}

impl Pricing {
    /// Sale price if set, otherwise base price.
    ///
    /// A zero sale price counts as "not on sale".
    pub fn effective_price(&self) -> Decimal {
        match self.sale_price {
            Some(price) if !price.is_zero() => price,
            _ => self.base_price,
        }
    }
}

/// Stock information of a product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    /// Units on hand
    pub stock: i32,

    /// Backorders allowed: stock is not checked at all
    pub allow_out_of_stock_purchase: bool,
}

impl Inventory {
    /// Whether `requested` units (the resulting line quantity) can be sold.
    pub fn can_supply(&self, requested: i32) -> bool {
        self.allow_out_of_stock_purchase || self.stock >= requested
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub images: Vec<String>,
    pub pricing: Pricing,
    pub inventory: Inventory,
}

// =============================================================================
// COUPON
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscountType {
    /// discount = subtotal * value / 100, optionally capped
    Percentage,
    /// discount = value
    Fixed,
}

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountType::Percentage => "percentage",
            DiscountType::Fixed => "fixed",
        }
    }
}

impl fmt::Display for DiscountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiscountType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "percentage" => Ok(DiscountType::Percentage),
            "fixed" => Ok(DiscountType::Fixed),
            other => Err(format!("unknown discount type: {other}")),
        }
    }
}

/// A coupon as stored in the coupon directory
#[derive(Debug, Clone, PartialEq)]
pub struct Coupon {
    pub id: Uuid,

    /// Always upper case
    pub code: String,

    pub description: Option<String>,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub min_order_value: Option<Decimal>,
    pub max_discount: Option<Decimal>,

    /// Validity window, inclusive on both ends
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,

    pub usage_limit: Option<i32>,
    pub used_count: i32,
    pub is_active: bool,
}

impl Coupon {
    /// Codes are case-insensitive; storage and lookup use upper case.
    pub fn normalize_code(raw: &str) -> String {
        raw.trim().to_uppercase()
    }

    /// Active and `start_date <= now <= end_date`.
    pub fn is_redeemable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.start_date <= now && now <= self.end_date
    }

    /// A limit of zero means "no limit".
    pub fn usage_exhausted(&self) -> bool {
        matches!(self.usage_limit, Some(limit) if limit > 0 && self.used_count >= limit)
    }

    /// Minimum order value, ignoring a zero minimum.
    pub fn minimum_order(&self) -> Option<Decimal> {
        self.min_order_value.filter(|min| !min.is_zero())
    }

    /// Discount this coupon grants on `subtotal`, rounded to cents with
    /// midpoints away from zero (0.025 -> 0.03).
    ///
    /// Fixed discounts are not limited by the subtotal; the cart total floor
    /// absorbs any excess.
    pub fn discount_for(&self, subtotal: Decimal) -> Decimal {
        let discount = match self.discount_type {
            DiscountType::Percentage => {
                let raw = subtotal * self.discount_value / Decimal::ONE_HUNDRED;
                match self.max_discount.filter(|cap| !cap.is_zero()) {
                    Some(cap) if raw > cap => cap,
                    _ => raw,
                }
            }
            DiscountType::Fixed => self.discount_value,
        };
        discount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
    }

    pub fn summary(&self) -> CouponSummary {
        CouponSummary {
            code: self.code.clone(),
            discount_type: self.discount_type,
            discount_value: self.discount_value,
            max_discount: self.max_discount,
        }
    }
}

/// Coupon fields shown inside a cart view
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponSummary {
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub max_discount: Option<Decimal>,
}

// =============================================================================
// CART
// =============================================================================
// The persisted cart record. One per user, created lazily, never deleted.
// Products and coupons are referenced by id only.
// -----------------------------------------------------------------------------

/// One product + quantity + price snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct CartItem {
    pub id: Uuid,
    pub product_id: Uuid,

    /// Always >= 1
    pub quantity: i32,

    /// Unit price at the last recomputation
    pub price: Decimal,
}

impl CartItem {
    pub fn new(product_id: Uuid, quantity: i32, price: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            product_id,
            quantity,
            price,
        }
    }

    pub fn line_total(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cart {
    pub user_id: Uuid,

    /// Insertion order
    pub items: Vec<CartItem>,

    pub discount: Decimal,
    pub coupon_id: Option<Uuid>,

    /// max(0, subtotal - discount)
    pub total: Decimal,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cart {
    pub fn new(user_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            items: Vec::new(),
            discount: Decimal::ZERO,
            coupon_id: None,
            total: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sum of price snapshots times quantities.
    pub fn subtotal(&self) -> Decimal {
        self.items.iter().map(CartItem::line_total).sum()
    }

    /// Total number of units across all lines.
    pub fn item_count(&self) -> i32 {
        self.items
            .iter()
            .fold(0i32, |count, item| count.saturating_add(item.quantity))
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn item_mut(&mut self, item_id: Uuid) -> Option<&mut CartItem> {
        self.items.iter_mut().find(|item| item.id == item_id)
    }

    pub fn line_for_product_mut(&mut self, product_id: Uuid) -> Option<&mut CartItem> {
        self.items.iter_mut().find(|item| item.product_id == product_id)
    }

    /// Re-derives `total` from the snapshots and the stored discount. A cart
    /// without a coupon carries no discount.
    pub fn settle_total(&mut self) {
        if self.coupon_id.is_none() {
            self.discount = Decimal::ZERO;
        }
        self.total = (self.subtotal() - self.discount).max(Decimal::ZERO);
        self.updated_at = Utc::now();
    }

    /// Drops a discount whose coupon reference is gone, e.g. after the
    /// coupon row was deleted. Returns true when the cart changed.
    pub fn release_orphaned_discount(&mut self) -> bool {
        if self.coupon_id.is_some() || self.discount.is_zero() {
            return false;
        }
        self.settle_total();
        true
    }

    pub fn attach_coupon(&mut self, coupon_id: Uuid, discount: Decimal) {
        self.coupon_id = Some(coupon_id);
        self.discount = discount;
        self.settle_total();
    }

    pub fn detach_coupon(&mut self) {
        self.coupon_id = None;
        self.discount = Decimal::ZERO;
        self.settle_total();
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.coupon_id = None;
        self.discount = Decimal::ZERO;
        self.settle_total();
    }
}

// =============================================================================
// CART VIEWS (API RESPONSES)
// =============================================================================
// Cart with its references resolved against the catalog and coupon directory.

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItemView {
    pub id: Uuid,
    pub product_id: Uuid,

    /// None when the catalog entry no longer exists
    pub product: Option<Product>,

    pub quantity: i32,
    pub price: Decimal,
    pub line_total: Decimal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartView {
    pub items: Vec<CartItemView>,
    pub item_count: i32,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub coupon: Option<CouponSummary>,
    pub currency: String,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CartView {
    /// View for a user that has never added anything.
    pub fn empty(currency: &str) -> Self {
        Self {
            items: Vec::new(),
            item_count: 0,
            subtotal: Decimal::ZERO,
            discount: Decimal::ZERO,
            total: Decimal::ZERO,
            coupon: None,
            currency: currency.to_string(),
            updated_at: None,
        }
    }
}

// =============================================================================
// API REQUEST/RESPONSE STRUCTURES
// =============================================================================
// Fields are optional so that missing values become 400s with our own
// message instead of an extractor rejection.

/// # Example JSON
/// ```json
/// { "productId": "6f1c...", "quantity": 2 }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddItemRequest {
    pub product_id: Option<String>,
    pub quantity: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateItemRequest {
    pub quantity: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplyCouponRequest {
    pub code: Option<String>,
}

/// `{ success, message?, cart }`
#[derive(Debug, Serialize)]
pub struct CartResponse {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    pub cart: CartView,
}

impl CartResponse {
    pub fn new(cart: CartView) -> Self {
        Self {
            success: true,
            message: None,
            cart,
        }
    }

    pub fn with_message(message: impl Into<String>, cart: CartView) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            cart,
        }
    }
}

// =============================================================================
// HEALTH CHECK RESPONSES
// =============================================================================

/// Simple health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Detailed readiness check response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

/// Individual dependency health checks
#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub database: bool,
    pub sessions: bool,
}

// =============================================================================
// ERROR RESPONSES
// =============================================================================

/// API error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,

    /// Error type/code
    pub error: String,

    /// Human-readable error message
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            message: message.into(),
        }
    }
}
