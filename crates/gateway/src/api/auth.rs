//! API authentication.
//!
//! Two token checks, both read **once at startup** and cached as SHA-256
//! digests in `AppState`:
//! - the API bearer token (env var named by `server.api_token_env`)
//!   gating `/api/*`;
//! - the agent callback secret (env var named by
//!   `server.callback_token_env`) expected in `x-agent-token` on
//!   `/trpc/*`.
//!
//! Either being unset means that surface runs open (dev mode /
//! localhost-only deployment).
//!
//! The user identity arrives from the fronting auth layer in the
//! `x-user-id` header.

use axum::body::Body;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Hash the provided token to a fixed-length digest, then compare in
/// constant time. Hashing normalizes lengths so nothing leaks.
pub fn token_matches(expected_hash: &[u8], provided: &str) -> bool {
    let provided_hash = Sha256::digest(provided.as_bytes());
    bool::from(provided_hash.ct_eq(expected_hash))
}

/// Axum middleware enforcing bearer-token auth on protected routes.
/// Attach via `axum::middleware::from_fn_with_state`.
pub async fn require_api_token(
    axum::extract::State(state): axum::extract::State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    // `api_token_hash` is `None` in dev mode (no token configured).
    let expected_hash = match &state.api_token_hash {
        Some(h) => h,
        None => return next.run(req).await,
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if !token_matches(expected_hash, provided) {
        return (
            axum::http::StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({ "error": "invalid or missing API token" })),
        )
            .into_response();
    }

    next.run(req).await
}

/// Shared-secret check for the `/trpc` agent callbacks.
pub fn callback_token_ok(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected_hash) = &state.callback_token_hash else {
        return true;
    };
    let provided = headers
        .get("x-agent-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    token_matches(expected_hash, provided)
}

/// The authenticated user identity, as asserted by the fronting auth
/// layer. Falls back to `"local"` in dev mode.
pub struct AuthedUser(pub String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthedUser
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .unwrap_or("local")
            .to_owned();
        Ok(AuthedUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_comparison() {
        let hash = Sha256::digest(b"secret").to_vec();
        assert!(token_matches(&hash, "secret"));
        assert!(!token_matches(&hash, "wrong"));
        assert!(!token_matches(&hash, ""));
    }
}
