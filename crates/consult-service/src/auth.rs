//! Authentication extractors.
//!
//! This module provides extractors for:
//! - `AuthUser` - End-user authentication via HS256 JWT
//! - `AdminAuth` - Operator or service authentication via API key

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use consult_core::UserId;

use crate::crypto::constant_time_eq;
use crate::error::ApiError;
use crate::state::AppState;

/// An authenticated user extracted from a bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The user ID.
    pub user_id: UserId,
}

/// JWT claims for user tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (user ID).
    pub sub: String,
    /// Audience.
    pub aud: String,
    /// Expiration time.
    pub exp: i64,
    /// Issued at.
    pub iat: i64,
}

/// Validate `token` and return the user it was issued to.
///
/// # Errors
///
/// Returns `ApiError::Unauthorized` for bad signatures, wrong audience, expired
/// tokens and subjects that are not user ids.
pub fn verify_token(token: &str, secret: &str, audience: &str) -> Result<UserId, ApiError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[audience]);

    let data = decode::<JwtClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| {
        tracing::debug!(error = %e, "Rejected bearer token");
        ApiError::Unauthorized
    })?;

    data.claims
        .sub
        .parse::<UserId>()
        .map_err(|_| ApiError::Unauthorized)
}

/// Bearer token from the `authorization` header, or the `access_token` query
/// parameter for WebSocket upgrades where browsers cannot set headers.
fn bearer_token(parts: &Parts) -> Option<String> {
    if let Some(token) = parts
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(token.to_string());
    }

    parts.uri.query().and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "access_token")
            .map(|(_, value)| value.to_string())
    })
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let token = bearer_token(parts).ok_or(ApiError::Unauthorized)?;

            let secret = state.config.auth_jwt_secret.as_ref().ok_or_else(|| {
                tracing::warn!("AUTH_JWT_SECRET not configured - rejecting user request");
                ApiError::Unauthorized
            })?;

            let user_id = verify_token(&token, secret, &state.config.auth_audience)?;
            Ok(AuthUser { user_id })
        })
    }
}

/// Operator authentication via API key.
///
/// Accepts either `x-admin-key` (an operator, named by `x-admin-id`) or
/// `x-api-key` (a trusted backend service, named by `x-service-name`).
#[derive(Debug, Clone)]
pub struct AdminAuth {
    /// Who performed the operation, for audit metadata.
    pub actor: String,
}

impl FromRequestParts<Arc<AppState>> for AdminAuth {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let header = |name: &str| {
                parts
                    .headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };

            if let Some(key) = header("x-admin-key") {
                let expected = state
                    .config
                    .admin_api_key
                    .as_ref()
                    .ok_or(ApiError::Unauthorized)?;
                if !constant_time_eq(&key, expected) {
                    return Err(ApiError::Unauthorized);
                }
                let actor = header("x-admin-id").unwrap_or_else(|| "admin".to_string());
                return Ok(AdminAuth {
                    actor: format!("admin:{actor}"),
                });
            }

            if let Some(key) = header("x-api-key") {
                let expected = state
                    .config
                    .service_api_key
                    .as_ref()
                    .ok_or(ApiError::Unauthorized)?;
                if !constant_time_eq(&key, expected) {
                    return Err(ApiError::Unauthorized);
                }
                let service = header("x-service-name").unwrap_or_else(|| "unknown".to_string());
                return Ok(AdminAuth {
                    actor: format!("service:{service}"),
                });
            }

            Err(ApiError::Unauthorized)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn mint(sub: &str, aud: &str, secret: &str, exp_offset: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = JwtClaims {
            sub: sub.to_string(),
            aud: aud.to_string(),
            exp: now + exp_offset,
            iat: now,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_yields_user() {
        let user = UserId::generate();
        let token = mint(&user.to_string(), "consult", "secret", 3600);
        assert_eq!(verify_token(&token, "secret", "consult").unwrap(), user);
    }

    #[test]
    fn wrong_secret_or_audience_is_rejected() {
        let user = UserId::generate().to_string();
        let token = mint(&user, "consult", "secret", 3600);
        assert!(verify_token(&token, "other", "consult").is_err());
        assert!(verify_token(&token, "secret", "elsewhere").is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = mint(&UserId::generate().to_string(), "consult", "secret", -3600);
        assert!(verify_token(&token, "secret", "consult").is_err());
    }

    #[test]
    fn non_uuid_subject_is_rejected() {
        let token = mint("alice", "consult", "secret", 3600);
        assert!(verify_token(&token, "secret", "consult").is_err());
    }
}
