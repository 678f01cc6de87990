//! Sessions
//!
//! A login hands out a random token, sent back either as the
//! `freebas_session` cookie or as `Authorization: Bearer <token>`.

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::request::Parts;
use uuid::Uuid;

use super::error::ApiError;
use super::state::AppState;

pub const SESSION_COOKIE: &str = "freebas_session";

/// Session token carried by a request, if any
pub fn session_token(headers: &HeaderMap) -> Option<Uuid> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .and_then(|token| token.trim().parse().ok());

    bearer.or_else(|| {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == SESSION_COOKIE)
            .and_then(|(_, value)| value.parse().ok())
    })
}

pub fn session_cookie(token: Uuid) -> String {
    format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax")
}

pub fn expired_cookie() -> String {
    format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
}

/// The logged-in user; rejects the request with 401 otherwise
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub username: String,
    pub token: Uuid,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = session_token(&parts.headers).ok_or(ApiError::Unauthorized)?;
        let username = state.session_user(token).ok_or(ApiError::Unauthorized)?;
        Ok(AuthUser { username, token })
    }
}
