// =============================================================================
// CART SERVICE - Main Entry Point
// =============================================================================
// This is the main entry point for the Rust-based Cart Service.
//
// WHAT THIS SERVICE DOES:
// - Keeps one shopping cart per signed-in user (tiles, quantities, prices)
// - Checks stock when items are added or quantities change
// - Validates coupon codes and keeps the discount and total in step
// - Exposes Prometheus metrics for observability
//
// LEARNING GOALS:
// - See how business rules live behind trait seams (store.rs) so they can
//   be tested without a database
// - Learn how a custom axum extractor handles authentication
// - Understand per-user locking for read-modify-write operations
// =============================================================================

// -----------------------------------------------------------------------------
// MODULE DECLARATIONS
// -----------------------------------------------------------------------------
mod auth;        // Session token lookup + AuthUser extractor (auth.rs)
mod cart;        // Cart engine: items, coupons, totals (cart.rs)
mod config;      // Configuration loading (config.rs)
mod db;          // PostgreSQL persistence (db.rs)
mod error;       // Error types (error.rs)
mod handlers;    // HTTP request handlers (handlers.rs)
mod metrics;     // Prometheus metrics setup (metrics.rs)
mod models;      // Data structures (models.rs)
mod store;       // Persistence traits used by the engine (store.rs)

#[cfg(test)]
mod memory;      // In-memory stores for tests (memory.rs)

// -----------------------------------------------------------------------------
// IMPORTS (use statements)
// -----------------------------------------------------------------------------
use anyhow::Context;
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::auth::{RedisSessions, SessionResolver};
use crate::cart::CartEngine;
use crate::config::Config;
use crate::db::Database;
use crate::metrics::setup_metrics;

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
// Shared by all request handlers through State<Arc<AppState>>.
//
// LEARNING NOTE:
// The engine and the session resolver are held through traits, so tests
// build the same state over in-memory stores.
pub struct AppState {
    // Cart rules over the product, coupon and cart stores
    pub cart: CartEngine,

    // Bearer token -> user id lookup
    pub sessions: Arc<dyn SessionResolver>,

    // Prometheus metrics handle
    // Used to render metrics in Prometheus format
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}

// -----------------------------------------------------------------------------
// MAIN FUNCTION
// -----------------------------------------------------------------------------
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -------------------------------------------------------------------------
    // STEP 1: Load environment variables
    // -------------------------------------------------------------------------
    dotenvy::dotenv().ok();

    // -------------------------------------------------------------------------
    // STEP 2: Initialize logging/tracing
    // -------------------------------------------------------------------------
    // RUST_LOG controls log levels
    // Example: RUST_LOG=info,cart_service=debug
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cart_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Cart Service...");

    // -------------------------------------------------------------------------
    // STEP 3: Load configuration
    // -------------------------------------------------------------------------
    let config = Config::from_env()?;
    info!(
        port = config.port,
        currency = %config.currency,
        "Configuration loaded"
    );

    // -------------------------------------------------------------------------
    // STEP 4: Set up Prometheus metrics
    // -------------------------------------------------------------------------
    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // -------------------------------------------------------------------------
    // STEP 5: Connect to PostgreSQL database
    // -------------------------------------------------------------------------
    let db = Database::connect(&config.database_url).await?;
    info!("Connected to PostgreSQL");

    db.run_migrations().await?;
    info!("Database migrations completed");

    // -------------------------------------------------------------------------
    // STEP 6: Connect to Redis (session store)
    // -------------------------------------------------------------------------
    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
    info!("Connected to Redis");

    // -------------------------------------------------------------------------
    // STEP 7: Create application state
    // -------------------------------------------------------------------------
    // One Database serves as catalog, coupon directory and cart store.
    let db = Arc::new(db);
    let state = Arc::new(AppState {
        cart: CartEngine::new(db.clone(), db.clone(), db, config.cart_settings()),
        sessions: Arc::new(RedisSessions::new(redis_conn, config.session_prefix.clone())),
        metrics_handle,
    });

    // -------------------------------------------------------------------------
    // STEP 8: Build the router
    // -------------------------------------------------------------------------
    let app = router(state, cors_layer(config.client_url.as_deref())?);

    // -------------------------------------------------------------------------
    // STEP 9: Start the HTTP server
    // -------------------------------------------------------------------------
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Cart Service is listening");

    axum::serve(listener, app).await?;

    Ok(())
}

// -----------------------------------------------------------------------------
// ROUTES
// -----------------------------------------------------------------------------
/// Every cart route requires an authenticated user (see auth::AuthUser).
pub fn router(state: Arc<AppState>, cors: CorsLayer) -> Router {
    Router::new()
        // ----- Health & Readiness Endpoints -----
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        // ----- Cart API Endpoints -----
        .route(
            "/api/cart",
            get(handlers::get_cart)
                .post(handlers::add_item)
                .delete(handlers::clear_cart),
        )
        // Registered before /api/cart/:item_id; static segments win in axum
        .route(
            "/api/cart/coupon",
            post(handlers::apply_coupon).delete(handlers::remove_coupon),
        )
        .route(
            "/api/cart/coupon/revalidate",
            post(handlers::revalidate_coupon),
        )
        .route(
            "/api/cart/:item_id",
            put(handlers::update_item).delete(handlers::remove_item),
        )
        // ----- Middleware Layers -----
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Any origin without credentials, or exactly CLIENT_URL with credentials
/// so the `token` cookie is sent.
pub fn cors_layer(client_url: Option<&str>) -> anyhow::Result<CorsLayer> {
    let Some(origin) = client_url else {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any));
    };

    let origin = HeaderValue::from_str(origin).context("CLIENT_URL is not a valid origin")?;
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true))
}
