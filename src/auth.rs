//! Bearer token authentication for browser-facing endpoints.
//!
//! REST glue routes require a `Authorization: Bearer <token>` header. The
//! browser WebSocket also accepts a `?token=` query parameter instead
//! (browsers can't set headers on WebSocket upgrades). Tokens map to a
//! principal name, which is attached to the request and to every subscriber
//! session.

use std::collections::HashMap;

use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::state::AppState;

/// Resolves a presented bearer token to the principal it belongs to.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<String>;
}

/// Static token table from `[auth.tokens]`.
pub struct TokenAuthenticator {
    tokens: Vec<(String, String)>,
}

impl TokenAuthenticator {
    pub fn new(tokens: &HashMap<String, String>) -> Self {
        Self {
            tokens: tokens
                .iter()
                .map(|(principal, token)| (principal.clone(), token.clone()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, token: &str) -> Option<String> {
        // Compare against every entry so the match position isn't observable.
        let mut found = None;
        for (principal, expected) in &self.tokens {
            if constant_time_eq(expected.as_bytes(), token.as_bytes()) && found.is_none() {
                found = Some(principal.clone());
            }
        }
        found
    }
}

/// Principal of an authenticated request, inserted as a request extension.
#[derive(Clone, Debug)]
pub struct Principal(pub String);

/// Extract the token from an `Authorization: Bearer` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Axum middleware that rejects requests without a valid bearer token.
///
/// # Error responses
///
/// - `401 Unauthorized` - header missing or malformed
/// - `403 Forbidden` - token present but unknown
pub async fn require_token(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(provided) = bearer_token(request.headers()) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing or invalid Authorization header", "code": "UNAUTHORIZED"})),
        )
            .into_response();
    };

    let Some(principal) = state.authenticator.authenticate(provided) else {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid token", "code": "FORBIDDEN"})),
        )
            .into_response();
    };

    request.extensions_mut().insert(Principal(principal));
    next.run(request).await
}

/// Query parameters accepted on the browser WebSocket upgrade.
#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    /// Bearer token as a query parameter (browsers can't set headers on a
    /// WebSocket upgrade).
    pub token: Option<String>,
}

/// Middleware for the browser WebSocket: the token comes from `?token=` or
/// the `Authorization` header, and any failure is a `401` before the upgrade
/// is attempted.
pub async fn require_ws_token(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = query
        .token
        .or_else(|| bearer_token(request.headers()).map(ToString::to_string));
    let Some(principal) = token.and_then(|t| state.authenticator.authenticate(&t)) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Unauthorized", "code": "UNAUTHORIZED"})),
        )
            .into_response();
    };

    request.extensions_mut().insert(Principal(principal));
    next.run(request).await
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, byte) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= byte ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret-longer"));
        assert!(!constant_time_eq(b"secret", b""));
    }

    #[test]
    fn test_token_authenticator_resolves_principal() {
        let mut tokens = HashMap::new();
        tokens.insert("alice".to_string(), "a-token".to_string());
        tokens.insert("bob".to_string(), "b-token".to_string());
        let auth = TokenAuthenticator::new(&tokens);

        assert_eq!(auth.authenticate("b-token").as_deref(), Some("bob"));
        assert_eq!(auth.authenticate("nope"), None);
        assert_eq!(auth.authenticate(""), None);
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert("authorization", "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
        headers.insert("authorization", "Bearer tok".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("tok"));
    }
}
