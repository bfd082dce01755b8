//! Public HTTP API server.
//!
//! Axum router under `/api`. Health, route-status and login are public;
//! everything else passes the auth + rate-limit middleware. CORS follows
//! `ALLOWED_ORIGINS`: an empty list allows every origin without
//! credentials, a non-empty list requires an exact match and enables
//! credentialed requests.

pub mod auth;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use crate::AppContext;

/// Body cap: base64 media payloads run up to 8M chars plus JSON framing.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    let public = Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/healthcheck", get(routes::health::health))
        .route("/api/route-status", get(routes::health::route_status))
        .route("/api/auth/login", post(auth::login));

    let protected = Router::new()
        .route("/api/ask", post(routes::ask::ask))
        .route("/api/update", post(routes::update::update))
        .route("/api/audit", get(routes::audit::audit))
        .route("/api/conversations", get(routes::audit::conversations))
        .route("/api/daemon/command", post(routes::daemon::dispatch_command))
        .route("/api/daemon/connections", get(routes::daemon::list_connections))
        .route("/api/metrics", get(routes::metrics::metrics))
        .route("/api/transcribe", post(routes::media::transcribe))
        .route("/api/vision", post(routes::media::vision))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&ctx),
            auth::require_auth,
        ));

    public
        .merge(protected)
        .layer(cors_layer(&ctx))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(ctx)
}

fn cors_layer(ctx: &AppContext) -> CorsLayer {
    if ctx.config.allowed_origins.is_empty() {
        // Open CORS, but no credentialed requests.
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = ctx
            .config
            .allowed_origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o) {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(origin = %o, "ignoring unparsable ALLOWED_ORIGINS entry");
                    None
                }
            })
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::OPTIONS,
            ])
            .allow_headers([
                axum::http::header::AUTHORIZATION,
                axum::http::header::CONTENT_TYPE,
            ])
            .allow_credentials(true)
    }
}

/// Serve the HTTP API until `shutdown` resolves.
pub async fn serve(
    ctx: Arc<AppContext>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", ctx.config.port).parse()?;
    let router = build_router(ctx);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP API listening on http://{addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
