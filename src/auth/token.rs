use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Result, SyncError};

/// Claims the client reads from its access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Expiration time (as UTC timestamp)
    #[serde(default)]
    pub exp: Option<i64>,
    /// Issued at (as UTC timestamp)
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
}

impl Claims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|exp| Utc.timestamp_opt(exp, 0).single())
    }

    /// Check if the token is expired at `now`. Tokens without `exp` never expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map(|exp| now >= exp).unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Reads the claims of an access token.
///
/// The signature is not verified. Use this only to learn who is logged in,
/// never to make an authorization decision.
pub fn inspect_token(token: &str) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.algorithms = vec![
        Algorithm::HS256,
        Algorithm::HS384,
        Algorithm::HS512,
        Algorithm::RS256,
        Algorithm::ES256,
    ];
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();

    decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|e| SyncError::Unauthorized(format!("Unreadable access token: {}", e)))
}

/// Formats the Authorization header value for a token
pub fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn mint(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"server-side-secret"),
        )
        .unwrap()
    }

    #[test]
    fn test_inspect_reads_subject_without_secret() {
        let token = mint(json!({ "sub": "u1", "exp": 4_102_444_800i64, "username": "alice" }));
        let claims = inspect_token(&token).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.username.as_deref(), Some("alice"));
        assert!(!claims.is_expired());
    }

    #[test]
    fn test_expired_token_is_still_readable() {
        let token = mint(json!({ "sub": "u1", "exp": 1_000i64 }));
        let claims = inspect_token(&token).unwrap();
        assert!(claims.is_expired());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            inspect_token("not-a-token"),
            Err(SyncError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_bearer_header_value() {
        assert_eq!(bearer("abc"), "Bearer abc");
    }
}
