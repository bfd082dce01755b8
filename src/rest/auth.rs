//! HTTP authentication: login, bearer-token middleware, and the sliding
//! window rate limiter applied to authenticated routes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::auth::{bearer_token, constant_time_eq, issue_token, verify_password, verify_token};
use crate::config::AuthMode;
use crate::error::GatewayError;
use crate::AppContext;

/// Authenticated identity attached to the request extensions.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: String,
}

// ─── Rate limiting ────────────────────────────────────────────────────────────

/// Sliding-window request limiter keyed by authenticated identity.
pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    hits: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(window_ms: u64, max_requests: usize) -> Self {
        Self {
            window: Duration::from_millis(window_ms),
            max_requests,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if the request should be allowed.
    pub fn check_and_record(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().expect("rate limiter lock poisoned");
        let timestamps = hits.entry(key.to_string()).or_default();
        timestamps.retain(|t| now.duration_since(*t) < self.window);
        if timestamps.len() >= self.max_requests {
            return false;
        }
        timestamps.push(now);
        true
    }
}

// ─── Middleware ───────────────────────────────────────────────────────────────

/// Authenticate per the configured mode, then rate-limit per identity.
///
/// Wired onto every `/api` route except the public ones (health,
/// route-status, login).
pub async fn require_auth(
    State(ctx): State<Arc<AppContext>>,
    mut req: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let user = if !ctx.config.auth_required {
        AuthedUser {
            user_id: ctx.config.anonymous_user_id.clone(),
        }
    } else {
        match ctx.config.auth_mode {
            AuthMode::None => AuthedUser {
                user_id: ctx.config.anonymous_user_id.clone(),
            },
            AuthMode::Jwt => {
                let token = req
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .and_then(bearer_token)
                    .ok_or(GatewayError::AuthMissing)?;
                let claims = verify_token(&ctx.config.jwt_secret, token)?;
                AuthedUser {
                    user_id: claims.user_id,
                }
            }
            AuthMode::ApiKey => {
                let expected = ctx
                    .config
                    .api_key
                    .as_deref()
                    .ok_or(GatewayError::AuthRejected)?;
                let presented = req
                    .headers()
                    .get(ctx.config.api_key_header.as_str())
                    .and_then(|v| v.to_str().ok())
                    .ok_or(GatewayError::AuthMissing)?;
                let presented = presented
                    .strip_prefix(ctx.config.api_key_prefix.as_str())
                    .unwrap_or(presented)
                    .trim();
                if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
                    return Err(GatewayError::AuthRejected);
                }
                AuthedUser {
                    user_id: ctx.config.anonymous_user_id.clone(),
                }
            }
        }
    };

    if !ctx.rate_limiter.check_and_record(&user.user_id) {
        return Err(GatewayError::RateLimited);
    }

    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

// ─── Login ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

/// `POST /api/auth/login` — verify environment-derived credentials and
/// issue a bearer token.
pub async fn login(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<LoginRequest>,
) -> Response {
    if body.email.trim().is_empty() || body.password.is_empty() {
        return GatewayError::Validation("email and password are required".into())
            .into_response();
    }

    let Some(credentials) = ctx.config.login.clone() else {
        warn!("login attempted but AUTH_USER_EMAIL/AUTH_PASSWORD_* are not configured");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "server_error", "message": "login is not configured" })),
        )
            .into_response();
    };

    let email = body.email.trim().to_lowercase();
    let email_ok = constant_time_eq(email.as_bytes(), credentials.email.as_bytes());

    // scrypt is deliberately slow; keep it off the async workers.
    let password = body.password;
    let creds_for_hash = credentials.clone();
    let password_ok = tokio::task::spawn_blocking(move || {
        verify_password(&creds_for_hash, &password)
    })
    .await
    .unwrap_or(false);

    if !email_ok || !password_ok {
        return GatewayError::AuthRejected.into_response();
    }

    match issue_token(&ctx.config.jwt_secret, &credentials.email, Some(&credentials.email)) {
        Ok((token, expires_at)) => (
            StatusCode::OK,
            Json(json!({
                "token": token,
                "tokenType": "Bearer",
                "expiresAt": expires_at,
                "userId": credentials.email,
            })),
        )
            .into_response(),
        Err(e) => {
            warn!(err = %e, "token issuing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "server_error", "message": "token issuing failed" })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_allows_up_to_max_then_blocks() {
        let limiter = RateLimiter::new(60_000, 3);
        assert!(limiter.check_and_record("u"));
        assert!(limiter.check_and_record("u"));
        assert!(limiter.check_and_record("u"));
        assert!(!limiter.check_and_record("u"));
        // Other identities are unaffected.
        assert!(limiter.check_and_record("v"));
    }

    #[test]
    fn limiter_window_expires() {
        let limiter = RateLimiter::new(1, 1);
        assert!(limiter.check_and_record("u"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.check_and_record("u"));
    }
}
