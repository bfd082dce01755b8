use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Result};
use tracing::warn;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_IPC_PORT: u16 = 8081;
const DEFAULT_WS_PATH: &str = "/ws/daemon";
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
const DEFAULT_CLIENT_TIMEOUT_MS: u64 = 90_000;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 1_048_576;
const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 60_000;
const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u64 = 120;
const DEFAULT_API_KEY_HEADER: &str = "x-api-key";
const DEFAULT_ANONYMOUS_USER_ID: &str = "anonymous";
const DEFAULT_DAEMON_GPT_ID_HEADER: &str = "x-daemon-gpt-id";
const DEFAULT_DATABASE_URL: &str = "sqlite://trinity.db?mode=rwc";
const DEFAULT_MODEL_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4.1";
const DEFAULT_FALLBACK_MODEL: &str = "gpt-4.1-mini";

/// scrypt output is 64 bytes, so the stored hex digest is exactly 128 chars.
pub const PASSWORD_HASH_HEX_LEN: usize = 128;

// ─── Auth mode ────────────────────────────────────────────────────────────────

/// How WebSocket upgrades (and API-key HTTP requests) are authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Jwt,
    ApiKey,
    None,
}

impl FromStr for AuthMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jwt" => Ok(AuthMode::Jwt),
            "api_key" => Ok(AuthMode::ApiKey),
            "none" => Ok(AuthMode::None),
            other => bail!("unrecognized AUTH_MODE {other:?} — expected jwt | api_key | none"),
        }
    }
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMode::Jwt => write!(f, "jwt"),
            AuthMode::ApiKey => write!(f, "api_key"),
            AuthMode::None => write!(f, "none"),
        }
    }
}

// ─── Login credentials ────────────────────────────────────────────────────────

/// Environment-derived login identity for `POST /api/auth/login`.
///
/// `password_hash` is the hex of a 64-byte scrypt digest; anything with the
/// wrong hex length is refused at startup so a truncated secret can never
/// half-work.
#[derive(Debug, Clone)]
pub struct LoginCredentials {
    pub email: String,
    pub password_salt: String,
    pub password_hash: String,
}

impl LoginCredentials {
    fn from_env() -> Option<Self> {
        let email = env_string("AUTH_USER_EMAIL")?.to_lowercase();
        let password_salt = env_string("AUTH_PASSWORD_SALT")?;
        let password_hash = env_string("AUTH_PASSWORD_HASH")?;
        if password_hash.len() != PASSWORD_HASH_HEX_LEN
            || !password_hash.chars().all(|c| c.is_ascii_hexdigit())
        {
            warn!(
                len = password_hash.len(),
                "AUTH_PASSWORD_HASH is not a 128-char hex digest — login disabled"
            );
            return None;
        }
        Some(Self {
            email,
            password_salt,
            password_hash,
        })
    }
}

// ─── IPC server knobs ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// WebSocket upgrade path, leading slash enforced.
    pub ws_path: String,
    pub heartbeat_interval_ms: u64,
    pub client_timeout_ms: u64,
    pub max_message_size: usize,
    /// Header carrying the daemon-GPT identity, parsed best-effort on accept.
    pub daemon_gpt_id_header: String,
}

impl IpcConfig {
    fn from_env() -> Self {
        let mut ws_path = env_string("IPC_WS_PATH").unwrap_or_else(|| DEFAULT_WS_PATH.to_string());
        if !ws_path.starts_with('/') {
            ws_path.insert(0, '/');
        }
        Self {
            ws_path,
            heartbeat_interval_ms: positive_u64(
                "IPC_HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            ),
            client_timeout_ms: positive_u64("IPC_CLIENT_TIMEOUT_MS", DEFAULT_CLIENT_TIMEOUT_MS),
            max_message_size: positive_u64("IPC_MAX_MESSAGE_SIZE", DEFAULT_MAX_MESSAGE_SIZE as u64)
                as usize,
            daemon_gpt_id_header: env_string("DAEMON_GPT_ID_HEADER")
                .unwrap_or_else(|| DEFAULT_DAEMON_GPT_ID_HEADER.to_string())
                .to_lowercase(),
        }
    }
}

// ─── GatewayConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub ipc_port: u16,
    pub log: String,
    pub auth_mode: AuthMode,
    /// When false, protected HTTP routes accept anonymous requests.
    pub auth_required: bool,
    /// When true, failing to open the database aborts startup.
    pub database_required: bool,
    pub database_url: String,
    pub jwt_secret: String,
    /// Model backend API key (empty means the backend is unreachable and
    /// every pipeline run fails upstream — useful for IPC-only deployments).
    pub model_api_key: String,
    pub model_base_url: String,
    /// Requested reasoning model; the downgrade detector compares the
    /// backend's active model against this exact string.
    pub model: String,
    pub fallback_model: String,
    pub login: Option<LoginCredentials>,
    pub api_key: Option<String>,
    pub api_key_header: String,
    pub api_key_prefix: String,
    /// Identity assigned to api_key / none connections.
    pub anonymous_user_id: String,
    pub ipc: IpcConfig,
    /// Empty → allow all origins without credentials; non-empty → exact match.
    pub allowed_origins: Vec<String>,
    pub rate_limit_window_ms: u64,
    pub rate_limit_max_requests: u64,
}

impl GatewayConfig {
    /// Build config from CLI/env args.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI flag — passed as `Some(value)` from clap
    ///   2. Environment variable
    ///   3. Built-in default
    ///
    /// An unrecognized `AUTH_MODE` is a hard error; `main` exits non-zero.
    pub fn new(port: Option<u16>, ipc_port: Option<u16>, log: Option<String>) -> Result<Self> {
        let auth_mode = match env_string("AUTH_MODE") {
            Some(raw) => raw.parse::<AuthMode>()?,
            None => AuthMode::None,
        };

        let port = port.or_else(|| env_u16("PORT")).unwrap_or(DEFAULT_PORT);
        let ipc_port = ipc_port
            .or_else(|| env_u16("IPC_PORT"))
            .unwrap_or(DEFAULT_IPC_PORT);
        let log = log
            .or_else(|| env_string("RUST_LOG"))
            .unwrap_or_else(|| "info".to_string());

        let allowed_origins = env_string("ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            port,
            ipc_port,
            log,
            auth_mode,
            auth_required: env_bool("AUTH_REQUIRED", true),
            database_required: env_bool("DATABASE_REQUIRED", false),
            database_url: env_string("DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            jwt_secret: env_string("JWT_SECRET").unwrap_or_default(),
            model_api_key: env_string("OPENAI_API_KEY").unwrap_or_default(),
            model_base_url: env_string("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_MODEL_BASE_URL.to_string()),
            model: env_string("TRINITY_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            fallback_model: env_string("TRINITY_FALLBACK_MODEL")
                .unwrap_or_else(|| DEFAULT_FALLBACK_MODEL.to_string()),
            login: LoginCredentials::from_env(),
            api_key: env_string("AUTH_API_KEY"),
            api_key_header: env_string("AUTH_API_KEY_HEADER")
                .unwrap_or_else(|| DEFAULT_API_KEY_HEADER.to_string())
                .to_lowercase(),
            api_key_prefix: env_string("AUTH_API_KEY_PREFIX").unwrap_or_default(),
            anonymous_user_id: env_string("AUTH_ANONYMOUS_USER_ID")
                .unwrap_or_else(|| DEFAULT_ANONYMOUS_USER_ID.to_string()),
            ipc: IpcConfig::from_env(),
            allowed_origins,
            rate_limit_window_ms: positive_u64(
                "RATE_LIMIT_WINDOW_MS",
                DEFAULT_RATE_LIMIT_WINDOW_MS,
            ),
            rate_limit_max_requests: positive_u64(
                "RATE_LIMIT_MAX_REQUESTS",
                DEFAULT_RATE_LIMIT_MAX_REQUESTS,
            ),
        })
    }

    /// SQLite file path extracted from the database URL, for health reporting.
    pub fn database_path(&self) -> &Path {
        let trimmed = self
            .database_url
            .strip_prefix("sqlite://")
            .unwrap_or(&self.database_url);
        Path::new(trimmed.split('?').next().unwrap_or(trimmed))
    }
}

// ─── Env helpers ──────────────────────────────────────────────────────────────

/// Non-empty trimmed environment string, `None` otherwise.
fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u16(name: &str) -> Option<u16> {
    env_string(name).and_then(|v| v.parse().ok())
}

/// Positive-integer normalization: zero, negative, or unparsable → default.
fn positive_u64(name: &str, default: u64) -> u64 {
    match env_string(name) {
        Some(raw) => match raw.parse::<i64>() {
            Ok(n) if n > 0 => n as u64,
            _ => {
                warn!(var = name, value = %raw, "ignoring non-positive value — using default");
                default
            }
        },
        None => default,
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match env_string(name).map(|v| v.to_ascii_lowercase()) {
        Some(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_mode_parses_known_values() {
        assert_eq!("jwt".parse::<AuthMode>().unwrap(), AuthMode::Jwt);
        assert_eq!("API_KEY".parse::<AuthMode>().unwrap(), AuthMode::ApiKey);
        assert_eq!(" none ".parse::<AuthMode>().unwrap(), AuthMode::None);
    }

    #[test]
    fn auth_mode_rejects_unknown() {
        assert!("bearer".parse::<AuthMode>().is_err());
    }

    #[test]
    fn ws_path_gets_leading_slash() {
        std::env::set_var("IPC_WS_PATH", "daemon-socket");
        let ipc = IpcConfig::from_env();
        assert_eq!(ipc.ws_path, "/daemon-socket");
        std::env::remove_var("IPC_WS_PATH");
    }

    #[test]
    fn non_positive_knobs_fall_back() {
        std::env::set_var("IPC_CLIENT_TIMEOUT_MS", "0");
        let ipc = IpcConfig::from_env();
        assert_eq!(ipc.client_timeout_ms, DEFAULT_CLIENT_TIMEOUT_MS);
        std::env::remove_var("IPC_CLIENT_TIMEOUT_MS");
    }

    #[test]
    fn database_path_strips_scheme_and_query() {
        let mut cfg = minimal();
        cfg.database_url = "sqlite://data/trinity.db?mode=rwc".to_string();
        assert_eq!(cfg.database_path(), Path::new("data/trinity.db"));
    }

    fn minimal() -> GatewayConfig {
        GatewayConfig {
            port: 8080,
            ipc_port: 8081,
            log: "info".into(),
            auth_mode: AuthMode::None,
            auth_required: false,
            database_required: false,
            database_url: DEFAULT_DATABASE_URL.into(),
            jwt_secret: String::new(),
            model_api_key: String::new(),
            model_base_url: DEFAULT_MODEL_BASE_URL.into(),
            model: DEFAULT_MODEL.into(),
            fallback_model: DEFAULT_FALLBACK_MODEL.into(),
            login: None,
            api_key: None,
            api_key_header: DEFAULT_API_KEY_HEADER.into(),
            api_key_prefix: String::new(),
            anonymous_user_id: DEFAULT_ANONYMOUS_USER_ID.into(),
            ipc: IpcConfig {
                ws_path: DEFAULT_WS_PATH.into(),
                heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
                client_timeout_ms: DEFAULT_CLIENT_TIMEOUT_MS,
                max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
                daemon_gpt_id_header: DEFAULT_DAEMON_GPT_ID_HEADER.into(),
            },
            allowed_origins: Vec::new(),
            rate_limit_window_ms: DEFAULT_RATE_LIMIT_WINDOW_MS,
            rate_limit_max_requests: DEFAULT_RATE_LIMIT_MAX_REQUESTS,
        }
    }
}
