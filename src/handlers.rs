// =============================================================================
// HANDLERS MODULE
// =============================================================================
// This module contains all HTTP request handlers (controller layer).
//
// LEARNING NOTES:
// - Handlers are async functions that receive requests and return responses
// - Axum uses "extractors" to parse request data (path params, JSON body, etc.)
// - AuthUser is our own extractor (auth.rs): it turns the bearer token into
//   a user id or rejects the request with 401
//
// Handlers only parse input, call the cart engine and shape the response.
// All cart rules live in cart.rs.
// =============================================================================

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::cart::Revalidation;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::*;
use crate::AppState;

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// Liveness probe
///
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "cart-service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe - are the cart store and the session store reachable?
///
/// GET /ready
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessResponse>, StatusCode> {
    let db_healthy = state.cart.store_healthy().await;
    let sessions_healthy = state.sessions.ping().await;

    if db_healthy && sessions_healthy {
        Ok(Json(ReadinessResponse {
            status: "ready".to_string(),
            checks: ReadinessChecks {
                database: db_healthy,
                sessions: sessions_healthy,
            },
        }))
    } else {
        tracing::warn!(database = db_healthy, sessions = sessions_healthy, "Not ready");
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// Prometheus metrics endpoint
///
/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

// =============================================================================
// CART API ENDPOINTS
// =============================================================================

/// Records request and engine metrics for one cart call.
fn observe(method: &str, endpoint: &str, operation: &str, start: Instant, result: &AppResult<CartView>) {
    let status = match result {
        Ok(cart) => {
            metrics::observe_cart_total(cart.total.to_f64().unwrap_or_default());
            StatusCode::OK
        }
        Err(e) => e.status_code(),
    };
    metrics::record_cart_operation(operation, result);
    metrics::record_http_request(method, endpoint, status.as_u16(), start.elapsed().as_secs_f64());
}

/// Body of a JSON request; a rejected body becomes a 400.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    payload.map(|Json(body)| body).map_err(AppError::from)
}

fn parse_id(raw: &str, what: &str) -> AppResult<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| AppError::InvalidArgument(format!("Invalid {what}")))
}

// -----------------------------------------------------------------------------
// GET CART
// -----------------------------------------------------------------------------
/// GET /api/cart
///
/// Never 404s: a user without a cart gets an empty one.
pub async fn get_cart(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> AppResult<Json<CartResponse>> {
    let start = Instant::now();
    let result = state.cart.get_cart(user.id).await;
    observe("GET", "/api/cart", "get_cart", start, &result);

    Ok(Json(CartResponse::new(result?)))
}

// -----------------------------------------------------------------------------
// ADD ITEM
// -----------------------------------------------------------------------------
/// POST /api/cart
///
/// # Request Body
/// ```json
/// { "productId": "2b0c7c52-...", "quantity": 2 }
/// ```
pub async fn add_item(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    payload: Result<Json<AddItemRequest>, JsonRejection>,
) -> AppResult<Json<CartResponse>> {
    let start = Instant::now();
    let result: AppResult<CartView> = async {
        let request = json_body(payload)?;
        let raw = request
            .product_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::InvalidArgument("Product ID is required".to_string()))?;
        let product_id = parse_id(raw, "product ID")?;
        state.cart.add_item(user.id, product_id, request.quantity).await
    }
    .await;
    observe("POST", "/api/cart", "add_item", start, &result);

    Ok(Json(CartResponse::with_message("Item added to cart", result?)))
}

// -----------------------------------------------------------------------------
// UPDATE ITEM
// -----------------------------------------------------------------------------
/// PUT /api/cart/:item_id
///
/// # Request Body
/// ```json
/// { "quantity": 4 }
/// ```
pub async fn update_item(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(item_id): Path<String>,
    payload: Result<Json<UpdateItemRequest>, JsonRejection>,
) -> AppResult<Json<CartResponse>> {
    let start = Instant::now();
    let result: AppResult<CartView> = async {
        let item_id = parse_id(&item_id, "item ID")?;
        let request = json_body(payload)?;
        state.cart.update_item(user.id, item_id, request.quantity).await
    }
    .await;
    observe("PUT", "/api/cart/:item_id", "update_item", start, &result);

    Ok(Json(CartResponse::with_message("Cart item updated", result?)))
}

// -----------------------------------------------------------------------------
// REMOVE ITEM
// -----------------------------------------------------------------------------
/// DELETE /api/cart/:item_id
///
/// Unknown item ids succeed without changing the cart.
pub async fn remove_item(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(item_id): Path<String>,
) -> AppResult<Json<CartResponse>> {
    let start = Instant::now();
    let result = match parse_id(&item_id, "item ID") {
        Ok(item_id) => state.cart.remove_item(user.id, item_id).await,
        Err(e) => Err(e),
    };
    observe("DELETE", "/api/cart/:item_id", "remove_item", start, &result);

    Ok(Json(CartResponse::with_message("Item removed from cart", result?)))
}

// -----------------------------------------------------------------------------
// CLEAR CART
// -----------------------------------------------------------------------------
/// DELETE /api/cart
pub async fn clear_cart(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> AppResult<Json<CartResponse>> {
    let start = Instant::now();
    let result = state.cart.clear_cart(user.id).await;
    observe("DELETE", "/api/cart", "clear_cart", start, &result);

    Ok(Json(CartResponse::with_message("Cart cleared", result?)))
}

// -----------------------------------------------------------------------------
// COUPONS
// -----------------------------------------------------------------------------
/// POST /api/cart/coupon
///
/// # Request Body
/// ```json
/// { "code": "welcome10" }
/// ```
pub async fn apply_coupon(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    payload: Result<Json<ApplyCouponRequest>, JsonRejection>,
) -> AppResult<Json<CartResponse>> {
    let start = Instant::now();
    let result = match json_body(payload) {
        Ok(request) => state.cart.apply_coupon(user.id, request.code.as_deref()).await,
        Err(e) => Err(e),
    };
    observe("POST", "/api/cart/coupon", "apply_coupon", start, &result);
    metrics::record_coupon_application(result.is_ok());

    Ok(Json(CartResponse::with_message("Coupon applied successfully", result?)))
}

/// DELETE /api/cart/coupon
pub async fn remove_coupon(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> AppResult<Json<CartResponse>> {
    let start = Instant::now();
    let result = state.cart.remove_coupon(user.id).await;
    observe("DELETE", "/api/cart/coupon", "remove_coupon", start, &result);

    Ok(Json(CartResponse::with_message("Coupon removed", result?)))
}

/// POST /api/cart/coupon/revalidate
///
/// Re-checks the attached coupon against the current cart. A coupon that no
/// longer qualifies is removed; the message says why.
pub async fn revalidate_coupon(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> AppResult<Json<CartResponse>> {
    let start = Instant::now();
    let result = state.cart.revalidate_coupon(user.id).await;

    let (outcome, cart) = match result {
        Ok((outcome, cart)) => (Some(outcome), Ok(cart)),
        Err(e) => (None, Err(e)),
    };
    observe("POST", "/api/cart/coupon/revalidate", "revalidate_coupon", start, &cart);

    let message = match outcome {
        Some(Revalidation::Dropped(reason)) => format!("Coupon removed: {reason}"),
        _ => "Coupon is still valid".to_string(),
    };
    Ok(Json(CartResponse::with_message(message, cart?)))
}
