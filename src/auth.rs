// =============================================================================
// AUTH MODULE
// =============================================================================
// Resolves a request to a user id. Tokens are issued elsewhere; this service
// only looks them up.
//
// LEARNING NOTES:
// - An axum "extractor" is any type implementing FromRequestParts
// - Adding `user: AuthUser` to a handler's arguments makes authentication
//   mandatory for that route; a failed lookup short-circuits with a 401
// =============================================================================

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::AppState;

/// Name of the cookie checked before the Authorization header.
const TOKEN_COOKIE: &str = "token";

// -----------------------------------------------------------------------------
// SESSION LOOKUP
// -----------------------------------------------------------------------------
#[async_trait]
pub trait SessionResolver: Send + Sync {
    /// User id behind `token`, if the token is known.
    async fn resolve(&self, token: &str) -> AppResult<Option<Uuid>>;

    async fn ping(&self) -> bool;
}

/// Sessions stored in Redis as `<prefix><token> -> <user uuid>`.
#[derive(Clone)]
pub struct RedisSessions {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisSessions {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl SessionResolver for RedisSessions {
    async fn resolve(&self, token: &str) -> AppResult<Option<Uuid>> {
        let start = Instant::now();
        let key = format!("{}{}", self.prefix, token);

        let value: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut self.conn.clone())
            .await?;
        metrics::record_redis_operation("get", start.elapsed().as_secs_f64());

        Ok(value.and_then(|raw| match Uuid::parse_str(raw.trim()) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(error = %e, "Session entry does not hold a user id");
                None
            }
        }))
    }

    async fn ping(&self) -> bool {
        redis::cmd("PING")
            .query_async::<_, String>(&mut self.conn.clone())
            .await
            .is_ok()
    }
}

// -----------------------------------------------------------------------------
// EXTRACTOR
// -----------------------------------------------------------------------------

/// The authenticated caller.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub id: Uuid,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = session_token(&parts.headers).ok_or_else(|| {
            AppError::Unauthorized("Not authorized, no token provided".to_string())
        })?;

        let id = state
            .sessions
            .resolve(&token)
            .await?
            .ok_or_else(|| AppError::Unauthorized("Not authorized, token failed".to_string()))?;

        Ok(AuthUser { id })
    }
}

/// Token from the `token` cookie, falling back to `Authorization: Bearer`.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == TOKEN_COOKIE)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty());

    from_cookie
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)?
                .to_str()
                .ok()?
                .strip_prefix("Bearer ")
                .map(str::trim)
                .filter(|token| !token.is_empty())
        })
        .map(str::to_string)
}
