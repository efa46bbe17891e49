//! Caller identity
//!
//! Every handler that acts on behalf of a user takes an [`AuthContext`]
//! argument. The extractor resolves it from the request:
//!
//! - `Authorization: Bearer <jwt>` signed with the configured HS256 secret
//!   gives [`AuthContext::User`], the `sub` claim being the user id
//! - no `Authorization` header while dev mode is enabled gives
//!   [`AuthContext::Dev`] with the configured development user
//! - anything else is rejected with 401
//!
//! A present but invalid header is rejected even in dev mode.

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::handlers::GatewayApiState;
use super::types::ErrorResponse;
use crate::config::AuthSettings;
use crate::{GatewayError, Result};

/// Authentication settings used by the extractor
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
    pub dev_mode: bool,
    pub dev_user_id: String,
}

impl From<&AuthSettings> for AuthConfig {
    fn from(settings: &AuthSettings) -> Self {
        Self {
            jwt_secret: settings.jwt_secret.clone().filter(|s| !s.is_empty()),
            dev_mode: settings.dev_mode,
            dev_user_id: settings.dev_user_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Identity substituted for the caller in development
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevIdentity {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthContext {
    User { user_id: String },
    Dev(DevIdentity),
}

impl AuthContext {
    pub fn user_id(&self) -> &str {
        match self {
            AuthContext::User { user_id } => user_id,
            AuthContext::Dev(identity) => &identity.user_id,
        }
    }

    pub fn is_dev(&self) -> bool {
        matches!(self, AuthContext::Dev(_))
    }
}

impl AuthConfig {
    /// Resolve the caller from request headers
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext> {
        let Some(value) = headers.get(header::AUTHORIZATION) else {
            if self.dev_mode {
                debug!("No credentials, using dev identity {}", self.dev_user_id);
                return Ok(AuthContext::Dev(DevIdentity {
                    user_id: self.dev_user_id.clone(),
                }));
            }
            return Err(GatewayError::Auth("missing Authorization header".to_string()));
        };

        let token = value
            .to_str()
            .ok()
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::Auth("expected a Bearer token".to_string()))?;

        let secret = self
            .jwt_secret
            .as_deref()
            .ok_or_else(|| GatewayError::Auth("token authentication is not configured".to_string()))?;

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|e| GatewayError::Auth(format!("invalid token: {}", e)))?;

        if data.claims.sub.trim().is_empty() {
            return Err(GatewayError::Auth("token has no subject".to_string()));
        }

        Ok(AuthContext::User {
            user_id: data.claims.sub,
        })
    }

    /// Sign a token for `user_id`, valid for `ttl`
    pub fn issue_token(&self, user_id: &str, ttl: Duration) -> Result<String> {
        let secret = self
            .jwt_secret
            .as_deref()
            .ok_or_else(|| GatewayError::Config("auth.jwt_secret is not set".to_string()))?;
        let claims = Claims {
            sub: user_id.to_string(),
            exp: (Utc::now() + ttl).timestamp().max(0) as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
            .map_err(|e| GatewayError::Internal(format!("failed to sign token: {}", e)))
    }
}

#[async_trait]
impl FromRequestParts<GatewayApiState> for AuthContext {
    type Rejection = ErrorResponse;

    async fn from_request_parts(parts: &mut Parts, state: &GatewayApiState) -> std::result::Result<Self, Self::Rejection> {
        state.auth.authenticate(&parts.headers).map_err(ErrorResponse::from)
    }
}
