//! JWT authentication module.
//!
//! Devices present a bearer credential naming their account and device id.
//! The route layer resolves it to a [`Principal`] and then checks the
//! device registry; this module only deals with the credential itself.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CentralError, CentralResult};

/// JWT claims structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (device_id)
    pub sub: String,

    /// Account the device belongs to
    pub account_id: String,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Expiration (Unix timestamp)
    pub exp: i64,

    /// JWT ID (unique identifier for this token)
    pub jti: String,
}

/// Who is calling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub account_id: String,
    pub device_id: String,
}

/// Resolves a bearer credential to a principal.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> CentralResult<Principal>;
}

/// HS256 device credentials.
pub struct JwtManager {
    secret: String,
    lifetime_secs: i64,
}

impl JwtManager {
    pub fn new(secret: String, lifetime_secs: i64) -> Self {
        JwtManager {
            secret,
            lifetime_secs,
        }
    }

    /// Issue a credential for one device.
    pub fn issue_token(&self, account_id: &str, device_id: &str) -> CentralResult<String> {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.lifetime_secs);

        let claims = Claims {
            sub: device_id.to_string(),
            account_id: account_id.to_string(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| CentralError::Internal(format!("Failed to generate token: {}", e)))
    }

    /// Validate and decode a token.
    pub fn validate_token(&self, token: &str) -> CentralResult<Claims> {
        let token_data: TokenData<Claims> = decode(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| CentralError::AuthFailed(format!("Invalid token: {}", e)))?;

        Ok(token_data.claims)
    }
}

#[async_trait]
impl Authenticator for JwtManager {
    async fn authenticate(&self, token: &str) -> CentralResult<Principal> {
        let claims = self.validate_token(token)?;
        Ok(Principal {
            account_id: claims.account_id,
            device_id: claims.sub,
        })
    }
}

/// Extract bearer token from authorization header.
pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
