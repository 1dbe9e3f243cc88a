// =============================================================================
// ERROR MODULE
// =============================================================================
// This module defines the service error type and its HTTP responses.
//
// LEARNING NOTES:
// - Rust doesn't have exceptions; it uses Result<T, E> for error handling
// - thiserror crate makes defining error types easy
// - We convert our errors to HTTP responses using Axum's IntoResponse
//
// ERROR HANDLING PHILOSOPHY:
// - Every failure is turned into a response at the request boundary
// - Business rule violations are 4xx with a readable message
// - Infrastructure failures are 500 and never leak driver details
// =============================================================================

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::ErrorResponse;

// =============================================================================
// CUSTOM ERROR TYPE
// =============================================================================
#[derive(Debug, Error)]
pub enum AppError {
    // -------------------------------------------------------------------------
    // INFRASTRUCTURE ERRORS
    // -------------------------------------------------------------------------
    /// Database query failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Redis operation failed
    #[error("Cache error: {0}")]
    Redis(#[from] redis::RedisError),

    // -------------------------------------------------------------------------
    // REQUEST ERRORS
    // -------------------------------------------------------------------------
    /// Missing or malformed input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No such product, cart, coupon or line item
    #[error("Not found: {0}")]
    NotFound(String),

    /// No resolvable identity on the request
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // -------------------------------------------------------------------------
    // BUSINESS LOGIC ERRORS
    // -------------------------------------------------------------------------
    /// Requested quantity exceeds what the catalog can supply
    #[error("Insufficient stock: available {available}, requested {requested}")]
    InsufficientStock { available: i32, requested: i32 },

    /// Coupon usage cap reached
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    /// Cart subtotal below the coupon's minimum order value
    #[error("Minimum order value of {minimum} required for this coupon")]
    BelowMinimum { minimum: Decimal },

    /// Operation not allowed in the cart's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // -------------------------------------------------------------------------
    // INTERNAL ERRORS
    // -------------------------------------------------------------------------
    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::InvalidArgument(_)
            | AppError::InsufficientStock { .. }
            | AppError::LimitExceeded(_)
            | AppError::BelowMinimum { .. }
            | AppError::InvalidState(_) => StatusCode::BAD_REQUEST,
            AppError::Database(_) | AppError::Redis(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable code, also used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Redis(_) => "CACHE_ERROR",
            AppError::InvalidArgument(_) => "INVALID_ARGUMENT",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            AppError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            AppError::BelowMinimum { .. } => "BELOW_MINIMUM",
            AppError::InvalidState(_) => "INVALID_STATE",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message shown to the client.
    pub fn public_message(&self) -> String {
        match self {
            AppError::InvalidArgument(msg)
            | AppError::NotFound(msg)
            | AppError::Unauthorized(msg)
            | AppError::LimitExceeded(msg)
            | AppError::InvalidState(msg)
            | AppError::Internal(msg) => msg.clone(),

            AppError::InsufficientStock { .. } | AppError::BelowMinimum { .. } => self.to_string(),

            // IMPORTANT: Don't expose internal details in production!
            AppError::Database(_) => "A database error occurred".to_string(),
            AppError::Redis(_) => "A cache error occurred".to_string(),
        }
    }
}

// =============================================================================
// HTTP RESPONSE CONVERSION
// =============================================================================
// Handlers return AppResult<Json<T>>; errors become proper HTTP responses.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.code();
        let message = self.public_message();

        if status.is_server_error() {
            tracing::error!(error_code, error = %self, "Request failed");
        } else {
            tracing::warn!(error_code, message = %message, "Request rejected");
        }

        (status, Json(ErrorResponse::new(error_code, message))).into_response()
    }
}

// =============================================================================
// RESULT TYPE ALIAS
// =============================================================================
pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Unreadable request bodies (bad JSON, wrong field types, missing
/// content type) are client input errors.
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::InvalidArgument(rejection.body_text())
    }
}
