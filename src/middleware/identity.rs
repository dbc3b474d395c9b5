use axum::{extract::FromRequestParts, http::header};
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::AppError, models::Identity};

pub const SESSION_KEY_HEADER: &str = "x-session-key";

/// Claims of the externally issued access token. This service never issues
/// tokens; it only consumes them.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub exp: usize,
}

/// An authenticated user, required by admin endpoints.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: String,
}

/// The acting principal on cart/checkout endpoints: a bearer token makes a
/// user, an `X-Session-Key` header makes a guest. When a signed-in request
/// still carries its pre-login guest session key, that key is surfaced so
/// the handler can merge the guest cart into the user's.
#[derive(Debug, Clone)]
pub struct Caller {
    pub identity: Identity,
    pub residual_session: Option<String>,
}

pub fn ensure_role(user: &AuthUser, role: &str) -> Result<(), AppError> {
    if user.role != role {
        return Err(AppError::Forbidden);
    }
    Ok(())
}

pub fn ensure_admin(user: &AuthUser) -> Result<(), AppError> {
    ensure_role(user, "admin")
}

fn decode_bearer(parts: &axum::http::request::Parts) -> Result<Option<AuthUser>, AppError> {
    let Some(auth_header) = parts.headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };

    let auth_str = auth_header
        .to_str()
        .map_err(|_| AppError::BadRequest("Invalid Authorization header".into()))?;

    if !auth_str.starts_with("Bearer ") {
        return Err(AppError::BadRequest("Invalid Authorization scheme".into()));
    }
    let token = auth_str.trim_start_matches("Bearer ").trim();

    let secret = std::env::var("JWT_SECRET")
        .map_err(|_| AppError::Internal(anyhow::anyhow!("JWT_SECRET is not set")))?;

    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AppError::BadRequest("Invalid or expired token".into()))?;

    let user_id = Uuid::parse_str(&decoded.claims.sub)
        .map_err(|_| AppError::BadRequest("Invalid user id in token".into()))?;

    Ok(Some(AuthUser {
        user_id,
        role: decoded.claims.role,
    }))
}

fn session_key(parts: &axum::http::request::Parts) -> Result<Option<String>, AppError> {
    let Some(value) = parts.headers.get(SESSION_KEY_HEADER) else {
        return Ok(None);
    };
    let key = value
        .to_str()
        .map_err(|_| AppError::BadRequest("Invalid session key header".into()))?
        .trim();
    if key.is_empty() || key.len() > 128 {
        return Err(AppError::BadRequest("Invalid session key header".into()));
    }
    Ok(Some(key.to_string()))
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        decode_bearer(parts)?
            .ok_or_else(|| AppError::BadRequest("Missing Authorization header".into()))
    }
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        let user = decode_bearer(parts)?;
        let session = session_key(parts)?;

        match (user, session) {
            (Some(user), session) => Ok(Caller {
                identity: Identity::User(user.user_id),
                residual_session: session,
            }),
            (None, Some(key)) => Ok(Caller {
                identity: Identity::Guest(key),
                residual_session: None,
            }),
            (None, None) => Err(AppError::BadRequest(
                "Missing Authorization header or session key".into(),
            )),
        }
    }
}
