//! JWT issuance (§3.1, §6): access and refresh tokens carrying the same
//! claim shape the RPC fabric's `CredentialValidator` decodes
//! ([`crate::rpc::Claims`]), so a token minted here validates unchanged at
//! any service boundary.

use crate::error::AppError;
use crate::models::User;
use crate::rpc::Claims;
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};

#[derive(Debug, serde::Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_in: i64,
}

pub struct JwtIssuer {
    secret: String,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
    refresh_ttl_remember_me_secs: i64,
}

impl JwtIssuer {
    pub fn new(secret: String, access_ttl_secs: i64, refresh_ttl_secs: i64, refresh_ttl_remember_me_secs: i64) -> Self {
        Self { secret, access_ttl_secs, refresh_ttl_secs, refresh_ttl_remember_me_secs }
    }

    fn encode(&self, claims: &Claims) -> Result<String, AppError> {
        encode(&Header::default(), claims, &EncodingKey::from_secret(self.secret.as_bytes()))
            .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to sign token: {e}")))
    }

    fn claims_for(&self, user: &User, token_type: &str, ttl_secs: i64) -> Claims {
        let now = Utc::now().timestamp() as usize;
        Claims {
            sub: user.id.to_string(),
            username: user.username.clone(),
            role: user.role.clone(),
            iat: now,
            exp: now + ttl_secs as usize,
            token_type: token_type.to_string(),
            service: None,
        }
    }

    pub fn issue_pair(&self, user: &User, remember_me: bool) -> Result<TokenPair, AppError> {
        let access = self.claims_for(user, "access", self.access_ttl_secs);
        let refresh_ttl = if remember_me { self.refresh_ttl_remember_me_secs } else { self.refresh_ttl_secs };
        let refresh = self.claims_for(user, "refresh", refresh_ttl);
        Ok(TokenPair {
            access_token: self.encode(&access)?,
            refresh_token: self.encode(&refresh)?,
            access_expires_in: self.access_ttl_secs,
        })
    }

    /// Service-to-service token with no associated human session (§4.2).
    pub fn issue_service_token(&self, service_name: &str, ttl_secs: i64) -> Result<String, AppError> {
        let now = Utc::now().timestamp() as usize;
        let claims = Claims {
            sub: format!("service:{service_name}"),
            username: service_name.to_string(),
            role: "service".to_string(),
            iat: now,
            exp: now + ttl_secs as usize,
            token_type: "service".to_string(),
            service: Some(service_name.to_string()),
        };
        self.encode(&claims)
    }
}
