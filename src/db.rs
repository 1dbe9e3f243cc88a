// =============================================================================
// DATABASE MODULE
// =============================================================================
// This module handles all PostgreSQL database operations.
//
// LEARNING NOTES:
// - SQLx provides async SQL with typed row decoding
// - Connection pooling improves performance
// - Transactions ensure data consistency: a cart is written all at once
//
// The same Database value backs all three cart collaborators:
// ProductCatalog, CouponDirectory and CartStore (see store.rs).
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::AppResult;
use crate::metrics;
use crate::models::{Cart, CartItem, Coupon, DiscountType, Inventory, Pricing, Product};
use crate::store::{CartStore, CouponDirectory, ProductCatalog};

// -----------------------------------------------------------------------------
// SCHEMA
// -----------------------------------------------------------------------------
// Every statement is idempotent (safe to run on every start).
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "products table",
        r#"
        CREATE TABLE IF NOT EXISTS products (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            name VARCHAR(255) NOT NULL,
            images TEXT[] NOT NULL DEFAULT '{}',
            base_price NUMERIC(12, 2) NOT NULL CHECK (base_price >= 0),
            sale_price NUMERIC(12, 2) CHECK (sale_price >= 0),
            stock INTEGER NOT NULL DEFAULT 0 CHECK (stock >= 0),
            allow_out_of_stock_purchase BOOLEAN NOT NULL DEFAULT FALSE,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "coupons table",
        r#"
        CREATE TABLE IF NOT EXISTS coupons (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            -- codes are stored upper case
            code VARCHAR(50) UNIQUE NOT NULL CHECK (code = UPPER(code)),
            description TEXT,
            discount_type VARCHAR(20) NOT NULL
                CHECK (discount_type IN ('percentage', 'fixed')),
            discount_value NUMERIC(12, 2) NOT NULL CHECK (discount_value >= 0),
            min_order_value NUMERIC(12, 2) CHECK (min_order_value >= 0),
            max_discount NUMERIC(12, 2) CHECK (max_discount >= 0),
            start_date TIMESTAMPTZ NOT NULL,
            end_date TIMESTAMPTZ NOT NULL,
            usage_limit INTEGER CHECK (usage_limit >= 0),
            used_count INTEGER NOT NULL DEFAULT 0 CHECK (used_count >= 0),
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "carts table",
        r#"
        CREATE TABLE IF NOT EXISTS carts (
            -- one cart per user
            user_id UUID PRIMARY KEY,
            discount NUMERIC(12, 2) NOT NULL DEFAULT 0 CHECK (discount >= 0),
            total NUMERIC(12, 2) NOT NULL DEFAULT 0 CHECK (total >= 0),
            -- deleting a coupon nulls the reference; the engine then drops the discount
            coupon_id UUID REFERENCES coupons(id) ON DELETE SET NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "cart_items table",
        r#"
        CREATE TABLE IF NOT EXISTS cart_items (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL REFERENCES carts(user_id) ON DELETE CASCADE,
            -- weak reference: no foreign key to products
            product_id UUID NOT NULL,
            quantity INTEGER NOT NULL CHECK (quantity >= 1),
            price NUMERIC(12, 2) NOT NULL CHECK (price >= 0),
            position INTEGER NOT NULL
        )
        "#,
    ),
    (
        "cart_items index",
        "CREATE INDEX IF NOT EXISTS idx_cart_items_user ON cart_items(user_id, position)",
    ),
];

const PRODUCT_COLUMNS: &str =
    "id, name, images, base_price, sale_price, stock, allow_out_of_stock_purchase";

const COUPON_COLUMNS: &str = "id, code, description, discount_type, discount_value, \
     min_order_value, max_discount, start_date, end_date, usage_limit, used_count, is_active";

// -----------------------------------------------------------------------------
// DATABASE WRAPPER
// -----------------------------------------------------------------------------
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    // -------------------------------------------------------------------------
    // CONNECTION
    // -------------------------------------------------------------------------
    /// Create a new database connection pool
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(300))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    // -------------------------------------------------------------------------
    // MIGRATIONS
    // -------------------------------------------------------------------------
    /// Create tables if needed and seed a small catalog on an empty database.
    pub async fn run_migrations(&self) -> Result<()> {
        for (name, statement) in MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to create {name}"))?;
        }

        self.seed_sample_data().await
    }

    /// Seed sample tiles and coupons for local testing
    async fn seed_sample_data(&self) -> Result<()> {
        let products: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM products")
            .fetch_one(&self.pool)
            .await?;

        if products.0 == 0 {
            // (name, base price, sale price, stock, backorders allowed)
            let sample_products = vec![
                ("Carrara Marble Look Porcelain 60x60", "1450.00", Some("1299.00"), 120, false),
                ("Matte Terracotta Hexagon 20x23", "890.00", None, 300, false),
                ("Glazed Subway Wall Tile 7.5x15", "420.00", Some("379.00"), 800, false),
                ("Anti-Skid Outdoor Paver 40x40", "760.00", None, 45, false),
                ("Wood Finish Plank 20x120", "1890.00", None, 0, true),
                ("Moroccan Encaustic Cement Tile 20x20", "2350.00", Some("1999.00"), 25, false),
            ];

            for (name, base, sale, stock, backorder) in sample_products {
                sqlx::query(
                    r#"
                    INSERT INTO products
                        (name, base_price, sale_price, stock, allow_out_of_stock_purchase)
                    VALUES ($1, $2::NUMERIC, $3::NUMERIC, $4, $5)
                    "#,
                )
                .bind(name)
                .bind(base)
                .bind(sale)
                .bind(stock)
                .bind(backorder)
                .execute(&self.pool)
                .await?;
            }
        }

        let coupons: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM coupons")
            .fetch_one(&self.pool)
            .await?;

        if coupons.0 == 0 {
            // (code, type, value, min order, max discount, usage limit)
            let sample_coupons = vec![
                ("WELCOME10", "percentage", "10", Some("1000"), Some("500"), None),
                ("FLAT250", "fixed", "250", Some("2000"), None, None),
                ("TILEFEST15", "percentage", "15", None, Some("1500"), Some(100)),
            ];

            for (code, kind, value, min_order, max_discount, limit) in sample_coupons {
                sqlx::query(
                    r#"
                    INSERT INTO coupons
                        (code, discount_type, discount_value, min_order_value,
                         max_discount, start_date, end_date, usage_limit)
                    VALUES ($1, $2, $3::NUMERIC, $4::NUMERIC, $5::NUMERIC,
                            NOW() - INTERVAL '1 day', NOW() + INTERVAL '90 days', $6)
                    ON CONFLICT (code) DO NOTHING
                    "#,
                )
                .bind(code)
                .bind(kind)
                .bind(value)
                .bind(min_order)
                .bind(max_discount)
                .bind(limit)
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // HEALTH CHECK
    // -------------------------------------------------------------------------

    /// Check if database connection is healthy
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

// -----------------------------------------------------------------------------
// ROW MAPPING
// -----------------------------------------------------------------------------

fn product_from_row(row: &PgRow) -> Result<Product, sqlx::Error> {
    Ok(Product {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        images: row.try_get("images")?,
        pricing: Pricing {
            base_price: row.try_get("base_price")?,
            sale_price: row.try_get("sale_price")?,
        },
        inventory: Inventory {
            stock: row.try_get("stock")?,
            allow_out_of_stock_purchase: row.try_get("allow_out_of_stock_purchase")?,
        },
    })
}

fn coupon_from_row(row: &PgRow) -> Result<Coupon, sqlx::Error> {
    let discount_type: String = row.try_get("discount_type")?;
    let discount_type: DiscountType = discount_type
        .parse()
        .map_err(|e: String| sqlx::Error::Decode(e.into()))?;

    Ok(Coupon {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        description: row.try_get("description")?,
        discount_type,
        discount_value: row.try_get("discount_value")?,
        min_order_value: row.try_get("min_order_value")?,
        max_discount: row.try_get("max_discount")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        usage_limit: row.try_get("usage_limit")?,
        used_count: row.try_get("used_count")?,
        is_active: row.try_get("is_active")?,
    })
}

// -----------------------------------------------------------------------------
// PRODUCT CATALOG (read only)
// -----------------------------------------------------------------------------
#[async_trait]
impl ProductCatalog for Database {
    async fn find_product(&self, id: Uuid) -> AppResult<Option<Product>> {
        let start = Instant::now();
        let row = sqlx::query(&format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        metrics::record_db_query("select", start.elapsed().as_secs_f64());

        Ok(row.as_ref().map(product_from_row).transpose()?)
    }

    async fn find_products(&self, ids: &[Uuid]) -> AppResult<HashMap<Uuid, Product>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let start = Instant::now();
        let rows = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ANY($1)"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        metrics::record_db_query("select", start.elapsed().as_secs_f64());

        let mut products = HashMap::with_capacity(rows.len());
        for row in &rows {
            let product = product_from_row(row)?;
            products.insert(product.id, product);
        }
        Ok(products)
    }
}

// -----------------------------------------------------------------------------
// COUPON DIRECTORY (read only)
// -----------------------------------------------------------------------------
#[async_trait]
impl CouponDirectory for Database {
    async fn find_redeemable(&self, code: &str, now: DateTime<Utc>) -> AppResult<Option<Coupon>> {
        let start = Instant::now();
        let row = sqlx::query(&format!(
            r#"
            SELECT {COUPON_COLUMNS}
            FROM coupons
            WHERE code = $1
              AND is_active
              AND start_date <= $2
              AND end_date >= $2
            "#
        ))
        .bind(code)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        metrics::record_db_query("select", start.elapsed().as_secs_f64());

        Ok(row.as_ref().map(coupon_from_row).transpose()?)
    }

    async fn find_coupon(&self, id: Uuid) -> AppResult<Option<Coupon>> {
        let row = sqlx::query(&format!("SELECT {COUPON_COLUMNS} FROM coupons WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(coupon_from_row).transpose()?)
    }
}

// -----------------------------------------------------------------------------
// CART STORE
// -----------------------------------------------------------------------------
#[async_trait]
impl CartStore for Database {
    async fn load_cart(&self, user_id: Uuid) -> AppResult<Option<Cart>> {
        let start = Instant::now();
        let Some(row) = sqlx::query(
            r#"
            SELECT user_id, discount, total, coupon_id, created_at, updated_at
            FROM carts
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let items = sqlx::query(
            r#"
            SELECT id, product_id, quantity, price
            FROM cart_items
            WHERE user_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|item| -> Result<CartItem, sqlx::Error> {
            Ok(CartItem {
                id: item.try_get("id")?,
                product_id: item.try_get("product_id")?,
                quantity: item.try_get("quantity")?,
                price: item.try_get("price")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;
        metrics::record_db_query("select", start.elapsed().as_secs_f64());

        Ok(Some(Cart {
            user_id: row.try_get("user_id")?,
            items,
            discount: row.try_get("discount")?,
            coupon_id: row.try_get("coupon_id")?,
            total: row.try_get("total")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn save_cart(&self, cart: &Cart) -> AppResult<()> {
        let start = Instant::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO carts (user_id, discount, total, coupon_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO UPDATE
            SET discount = EXCLUDED.discount,
                total = EXCLUDED.total,
                coupon_id = EXCLUDED.coupon_id,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(cart.user_id)
        .bind(cart.discount)
        .bind(cart.total)
        .bind(cart.coupon_id)
        .bind(cart.created_at)
        .bind(cart.updated_at)
        .execute(&mut *tx)
        .await?;

        // Items are replaced wholesale; position keeps insertion order
        sqlx::query("DELETE FROM cart_items WHERE user_id = $1")
            .bind(cart.user_id)
            .execute(&mut *tx)
            .await?;

        for (position, item) in cart.items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO cart_items (id, user_id, product_id, quantity, price, position)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(item.id)
            .bind(cart.user_id)
            .bind(item.product_id)
            .bind(item.quantity)
            .bind(item.price)
            .bind(position as i32)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        metrics::record_db_query("upsert", start.elapsed().as_secs_f64());

        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.ping().await
    }
}
