//! Authenticator: validates the bearer token presented on the `auth`
//! application message and resolves it to a user/device/session identity.
//!
//! `JwtAuthenticator` is the concrete implementation; the `Authenticator`
//! trait is the seam a deployment could swap in for a different identity
//! provider (an external session-introspection service, a mock for tests).

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use wsgate_config::AuthConfig;

use crate::error::AuthError;

/// A successfully authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub device_id: Option<String>,
    pub session_id: Option<String>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    exp: Option<u64>,
}

/// Validates HS256-signed JWTs against a shared secret, optionally
/// checking the issuer claim.
pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
    expected_issuer: Option<String>,
}

impl JwtAuthenticator {
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        if !config.jwt_issuer.is_empty() {
            validation.set_issuer(&[config.jwt_issuer.clone()]);
        }
        Self {
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
            expected_issuer: (!config.jwt_issuer.is_empty()).then(|| config.jwt_issuer.clone()),
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let token = strip_bearer_prefix(token);
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        if let Some(expected) = &self.expected_issuer
            && data.claims.iss.as_deref() != Some(expected.as_str())
        {
            return Err(AuthError::InvalidToken("unexpected issuer".into()));
        }

        Ok(Identity {
            user_id: data.claims.sub,
            device_id: data.claims.device_id,
            session_id: data.claims.session_id,
        })
    }
}

/// Per the `Sec-WebSocket-Protocol` negotiation rule: the header may carry
/// either a bare token or a comma-separated protocol list with a leading
/// `bearer,` marker. Strip the marker if present.
#[must_use]
pub fn strip_bearer_prefix(token: &str) -> &str {
    token
        .strip_prefix("bearer,")
        .or_else(|| token.strip_prefix("Bearer "))
        .unwrap_or(token)
        .trim()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    fn issue_token(secret: &str, issuer: &str, user_id: &str, exp_offset_secs: i64) -> String {
        let exp = (chrono_like_now() + exp_offset_secs) as u64;
        let claims = Claims {
            sub: user_id.into(),
            device_id: Some("d1".into()),
            session_id: Some("s1".into()),
            iss: Some(issuer.into()),
            exp: Some(exp),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn chrono_like_now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    fn test_config() -> AuthConfig {
        AuthConfig {
            token_expiry_secs: 3600,
            auth_timeout_secs: 10,
            require_auth_on_connect: true,
            jwt_issuer: "gateway".into(),
            jwt_secret: "test-secret".into(),
        }
    }

    #[tokio::test]
    async fn valid_token_resolves_identity() {
        let config = test_config();
        let authenticator = JwtAuthenticator::new(&config);
        let token = issue_token(&config.jwt_secret, &config.jwt_issuer, "u1", 3600);
        let identity = authenticator.validate(&token).await.unwrap();
        assert_eq!(identity.user_id, "u1");
        assert_eq!(identity.device_id.as_deref(), Some("d1"));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let config = test_config();
        let authenticator = JwtAuthenticator::new(&config);
        let token = issue_token(&config.jwt_secret, &config.jwt_issuer, "u1", -3600);
        let err = authenticator.validate(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::Expired));
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let config = test_config();
        let authenticator = JwtAuthenticator::new(&config);
        let token = issue_token("other-secret", &config.jwt_issuer, "u1", 3600);
        assert!(authenticator.validate(&token).await.is_err());
    }

    #[test]
    fn strip_bearer_prefix_handles_protocol_list_and_plain_header() {
        assert_eq!(strip_bearer_prefix("bearer,abc123"), "abc123");
        assert_eq!(strip_bearer_prefix("Bearer abc123"), "abc123");
        assert_eq!(strip_bearer_prefix("abc123"), "abc123");
    }
}
