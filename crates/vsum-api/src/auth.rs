//! Bearer token authentication.
//!
//! Tokens are HS256 JWTs whose `sub` claim is the caller's identity. Browsers
//! cannot attach headers to an `EventSource`, so the token may also be passed
//! as the `access_token` query parameter.

use std::collections::HashMap;

use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Query parameter accepted in place of the Authorization header.
pub const ACCESS_TOKEN_PARAM: &str = "access_token";

/// Decoded token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub sub: String,
    /// Email (if available)
    #[serde(default)]
    pub email: Option<String>,
    /// Expiration
    pub exp: i64,
    /// Issued at
    #[serde(default)]
    pub iat: Option<i64>,
}

/// Authenticated user extracted from request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub uid: String,
    pub email: Option<String>,
}

impl From<Claims> for AuthUser {
    fn from(claims: Claims) -> Self {
        Self {
            uid: claims.sub,
            email: claims.email,
        }
    }
}

/// Verifies bearer tokens against a shared secret.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str, issuer: Option<&str>, audience: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        match issuer {
            Some(iss) => validation.set_issuer(&[iss]),
            None => validation.iss = None,
        }
        match audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify a token and return its claims.
    pub fn verify_token(&self, token: &str) -> ApiResult<Claims> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| ApiError::unauthorized(format!("Token validation failed: {}", e)))?;

        if data.claims.sub.trim().is_empty() {
            return Err(ApiError::unauthorized("Token has no subject"));
        }
        Ok(data.claims)
    }
}

fn bearer_token(parts: &Parts) -> ApiResult<Option<String>> {
    let Some(header) = parts.headers.get("Authorization") else {
        return Ok(None);
    };
    let header = header
        .to_str()
        .map_err(|_| ApiError::unauthorized("Invalid Authorization header"))?;
    header
        .strip_prefix("Bearer ")
        .map(|t| Some(t.trim().to_string()))
        .ok_or_else(|| ApiError::unauthorized("Invalid Authorization header format"))
}

fn query_token(parts: &Parts) -> Option<String> {
    Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(mut params)| params.remove(ACCESS_TOKEN_PARAM))
        .filter(|t| !t.trim().is_empty())
}

/// Axum extractor for authenticated user.
#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = match bearer_token(parts)? {
            Some(token) => token,
            None => query_token(parts).ok_or_else(|| ApiError::unauthorized("Missing credentials"))?,
        };

        let claims = state.auth.verify_token(&token)?;
        debug!(uid = %claims.sub, "Authenticated request");
        Ok(AuthUser::from(claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, sub: &str, exp_offset: i64, iss: Option<&str>) -> String {
        let mut claims = serde_json::json!({
            "sub": sub,
            "exp": chrono::Utc::now().timestamp() + exp_offset,
        });
        if let Some(iss) = iss {
            claims["iss"] = serde_json::json!(iss);
        }
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token() {
        let verifier = JwtVerifier::new("secret", None, None);
        let claims = verifier.verify_token(&token("secret", "alice", 3600, None)).unwrap();
        assert_eq!(claims.sub, "alice");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let verifier = JwtVerifier::new("secret", None, None);
        assert!(matches!(
            verifier.verify_token(&token("other", "alice", 3600, None)),
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let verifier = JwtVerifier::new("secret", None, None);
        assert!(verifier.verify_token(&token("secret", "alice", -3600, None)).is_err());
    }

    #[test]
    fn test_issuer_checked_when_configured() {
        let verifier = JwtVerifier::new("secret", Some("vsum"), None);
        assert!(verifier.verify_token(&token("secret", "alice", 3600, Some("vsum"))).is_ok());
        assert!(verifier.verify_token(&token("secret", "alice", 3600, Some("other"))).is_err());
    }

    #[test]
    fn test_blank_subject_rejected() {
        let verifier = JwtVerifier::new("secret", None, None);
        assert!(verifier.verify_token(&token("secret", " ", 3600, None)).is_err());
    }
}
