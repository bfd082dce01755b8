//! WebSocket upgrade authentication.
//!
//! Runs inside the handshake callback, before the connection is accepted.
//! A failure closes the socket with code 1008 ("Unauthorized") — the server
//! never registers an unauthenticated connection.

use tracing::warn;

use crate::auth::{bearer_token, constant_time_eq, verify_token};
use crate::config::{AuthMode, GatewayConfig};
use crate::error::GatewayError;

/// Identity and best-effort metadata established during the handshake.
#[derive(Debug, Clone)]
pub struct UpgradeIdentity {
    pub user_id: String,
    pub daemon_gpt_id: Option<String>,
    pub user_agent: Option<String>,
}

fn header_str<'a>(
    headers: &'a tokio_tungstenite::tungstenite::http::HeaderMap,
    name: &str,
) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Pull `token=` out of a raw query string.
fn query_token(query: Option<&str>) -> Option<&str> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|t| !t.is_empty())
}

/// Authenticate a WebSocket upgrade request per the configured mode.
pub fn authenticate_upgrade(
    config: &GatewayConfig,
    headers: &tokio_tungstenite::tungstenite::http::HeaderMap,
    query: Option<&str>,
) -> Result<UpgradeIdentity, GatewayError> {
    // The daemon-GPT id header is best-effort: an unreadable value warns
    // but never blocks the connection.
    let daemon_gpt_id = match headers.get(&config.ipc.daemon_gpt_id_header) {
        Some(value) => match value.to_str() {
            Ok(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Ok(_) => None,
            Err(_) => {
                warn!(header = %config.ipc.daemon_gpt_id_header, "unreadable daemon-GPT id header — ignoring");
                None
            }
        },
        None => None,
    };
    let user_agent = header_str(headers, "user-agent").map(str::to_string);

    let user_id = match config.auth_mode {
        AuthMode::None => config.anonymous_user_id.clone(),
        AuthMode::Jwt => {
            let token = header_str(headers, "authorization")
                .and_then(bearer_token)
                .or_else(|| query_token(query))
                .ok_or(GatewayError::AuthMissing)?;
            let claims = verify_token(&config.jwt_secret, token)?;
            claims.user_id
        }
        AuthMode::ApiKey => {
            let expected = config.api_key.as_deref().ok_or(GatewayError::AuthRejected)?;
            let presented = header_str(headers, &config.api_key_header)
                .ok_or(GatewayError::AuthMissing)?;
            let presented = presented
                .strip_prefix(config.api_key_prefix.as_str())
                .unwrap_or(presented)
                .trim();
            if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
                return Err(GatewayError::AuthRejected);
            }
            config.anonymous_user_id.clone()
        }
    };

    Ok(UpgradeIdentity {
        user_id,
        daemon_gpt_id,
        user_agent,
    })
}
