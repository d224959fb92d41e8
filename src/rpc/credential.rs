//! Shared bearer-credential validation (§4.2, §6): each request carries an
//! opaque bearer credential; the receiving service validates locally via a
//! shared HS256 signing key when possible, with results cached up to
//! `credential_ttl_seconds`.

use crate::error::AppError;
use dashmap::DashMap;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub role: String,
    pub iat: usize,
    pub exp: usize,
    #[serde(rename = "type")]
    pub token_type: String,
    pub service: Option<String>,
}

struct CacheEntry {
    claims: Claims,
    cached_at: Instant,
}

/// Validates bearer tokens against a shared signing key, with a local cache
/// bounded by `credential_ttl`. Used both by the HTTP surface (auth
/// middleware) and by the RPC fabric (service-to-service calls).
pub struct CredentialValidator {
    secret: String,
    ttl: Duration,
    cache: DashMap<String, CacheEntry>,
}

impl CredentialValidator {
    pub fn new(secret: String, ttl_secs: i64) -> Self {
        Self {
            secret,
            ttl: Duration::from_secs(ttl_secs.max(0) as u64),
            cache: DashMap::new(),
        }
    }

    /// Validates `token`, optionally requiring the `service` claim to match
    /// `expected_service` when present on the token (§6).
    pub fn validate(&self, token: &str, expected_service: Option<&str>) -> Result<Claims, AppError> {
        if let Some(entry) = self.cache.get(token) {
            if entry.cached_at.elapsed() < self.ttl {
                return Self::check_service(entry.claims.clone(), expected_service);
            }
        }

        let key = DecodingKey::from_secret(self.secret.as_bytes());
        let validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        let data = decode::<Claims>(token, &key, &validation).map_err(|_| AppError::Auth)?;
        let claims = data.claims;

        self.cache.insert(
            token.to_string(),
            CacheEntry { claims: claims.clone(), cached_at: Instant::now() },
        );

        Self::check_service(claims, expected_service)
    }

    fn check_service(claims: Claims, expected_service: Option<&str>) -> Result<Claims, AppError> {
        if let (Some(expected), Some(actual)) = (expected_service, claims.service.as_deref()) {
            if expected != actual {
                return Err(AppError::Permission);
            }
        }
        Ok(claims)
    }

    pub fn invalidate(&self, token: &str) {
        self.cache.remove(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn make_token(secret: &str, service: Option<&str>) -> String {
        let claims = Claims {
            sub: "1".into(),
            username: "alice".into(),
            role: "user".into(),
            iat: 0,
            exp: 9_999_999_999,
            token_type: "access".into(),
            service: service.map(|s| s.to_string()),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn validates_and_caches() {
        let validator = CredentialValidator::new("secret".into(), 300);
        let token = make_token("secret", None);
        let claims = validator.validate(&token, None).unwrap();
        assert_eq!(claims.username, "alice");
        // second call hits cache
        let claims2 = validator.validate(&token, None).unwrap();
        assert_eq!(claims2.sub, "1");
    }

    #[test]
    fn rejects_service_mismatch() {
        let validator = CredentialValidator::new("secret".into(), 300);
        let token = make_token("secret", Some("chat"));
        let err = validator.validate(&token, Some("stream")).unwrap_err();
        assert!(matches!(err, AppError::Permission));
    }
}
