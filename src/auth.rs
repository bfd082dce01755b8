//! Shared authentication primitives: JWT issue/verify, scrypt password
//! verification, and constant-time comparison. Used by both the HTTP layer
//! and the IPC WebSocket handshake.

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::config::LoginCredentials;
use crate::error::GatewayError;

/// Token lifetime: 30 days.
const TOKEN_TTL_SECS: i64 = 30 * 24 * 60 * 60;

/// scrypt cost parameters for login verification. The output is 64 bytes,
/// stored hex-encoded (128 chars).
const SCRYPT_LOG_N: u8 = 15;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const SCRYPT_OUTPUT_LEN: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

/// Issue an HS256 token. Returns `(token, expires_at_epoch_secs)`.
pub fn issue_token(
    secret: &str,
    user_id: &str,
    email: Option<&str>,
) -> Result<(String, i64), GatewayError> {
    if secret.is_empty() {
        return Err(GatewayError::UpstreamUnavailable(
            "JWT_SECRET is not configured".into(),
        ));
    }
    let now = Utc::now().timestamp();
    let claims = Claims {
        user_id: user_id.to_string(),
        email: email.map(str::to_string),
        iat: now,
        exp: now + TOKEN_TTL_SECS,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| GatewayError::UpstreamUnavailable(format!("token signing failed: {e}")))?;
    Ok((token, claims.exp))
}

/// Verify an HS256 token and return its claims.
pub fn verify_token(secret: &str, token: &str) -> Result<Claims, GatewayError> {
    if secret.is_empty() {
        return Err(GatewayError::AuthRejected);
    }
    let mut validation = Validation::default();
    validation.required_spec_claims.clear();
    validation.validate_exp = true;
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| GatewayError::AuthRejected)
}

/// Constant-time equality with a length pre-check. The length comparison
/// itself is not secret; the byte comparison never short-circuits.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Derive the hex scrypt digest stored in `AUTH_PASSWORD_HASH`.
/// Used by the `hash-password` subcommand when provisioning credentials.
pub fn hash_password(salt: &str, password: &str) -> Result<String, GatewayError> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, SCRYPT_OUTPUT_LEN)
        .map_err(|e| GatewayError::Validation(format!("scrypt params: {e}")))?;
    let mut derived = [0u8; SCRYPT_OUTPUT_LEN];
    scrypt::scrypt(password.as_bytes(), salt.as_bytes(), &params, &mut derived)
        .map_err(|e| GatewayError::Validation(format!("scrypt: {e}")))?;
    Ok(hex::encode(derived))
}

/// Verify a login password against the stored scrypt digest.
pub fn verify_password(credentials: &LoginCredentials, password: &str) -> bool {
    let params = match scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, SCRYPT_OUTPUT_LEN) {
        Ok(p) => p,
        Err(_) => return false,
    };
    let mut derived = [0u8; SCRYPT_OUTPUT_LEN];
    if scrypt::scrypt(
        password.as_bytes(),
        credentials.password_salt.as_bytes(),
        &params,
        &mut derived,
    )
    .is_err()
    {
        return false;
    }
    let expected = match hex::decode(&credentials.password_hash) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    constant_time_eq(&derived, &expected)
}

/// Extract a bearer token from an `Authorization` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_verify_and_carry_identity() {
        let (token, exp) = issue_token("secret", "u-1", Some("a@b.c")).unwrap();
        let claims = verify_token("secret", &token).unwrap();
        assert_eq!(claims.user_id, "u-1");
        assert_eq!(claims.email.as_deref(), Some("a@b.c"));
        assert_eq!(claims.exp, exp);
        assert!(exp > Utc::now().timestamp());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let (token, _) = issue_token("secret", "u-1", None).unwrap();
        assert!(verify_token("other", &token).is_err());
    }

    #[test]
    fn empty_secret_never_issues_or_verifies() {
        assert!(issue_token("", "u", None).is_err());
        assert!(verify_token("", "anything").is_err());
    }

    #[test]
    fn constant_time_eq_requires_equal_length_and_bytes() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn hashed_passwords_verify() {
        let hash = hash_password("salty", "hunter2").unwrap();
        assert_eq!(hash.len(), crate::config::PASSWORD_HASH_HEX_LEN);
        let credentials = LoginCredentials {
            email: "a@b.c".into(),
            password_salt: "salty".into(),
            password_hash: hash,
        };
        assert!(verify_password(&credentials, "hunter2"));
        assert!(!verify_password(&credentials, "hunter3"));
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(bearer_token("Bearer tok"), Some("tok"));
        assert_eq!(bearer_token("Basic tok"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }
}
