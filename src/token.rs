//! Manage json web tokens.
//!
//! Every token carries a `purpose` claim. A token minted for one purpose is
//! never accepted where another is expected.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Result, ServerError};

/// What a token grants access to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    /// Installer generation and secret reveal of one account.
    Installer,
    /// Ordinary authenticated API calls.
    Session,
}

impl Purpose {
    /// Default validity window.
    pub fn ttl(self) -> Duration {
        match self {
            Purpose::Installer => Duration::hours(24),
            Purpose::Session => Duration::days(7),
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token or bad signature")]
    Invalid,
    #[error("token expired")]
    Expired,
    #[error("token was issued for another purpose")]
    PurposeMismatch,
}

/// Pieces of information asserted on a JWT.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Recipients that the JWT is intended for.
    pub aud: String,
    /// Identifies the expiration time on or after which the JWT must not be
    /// accepted for processing.
    pub exp: i64,
    /// Identifies the time at which the JWT was issued.
    pub iat: i64,
    /// Identifies the organization that issued the JWT.
    pub iss: String,
    /// Account ID.
    pub sub: String,
    pub purpose: Purpose,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Claims of a token that passed every check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedToken {
    pub account_id: Uuid,
    pub purpose: Purpose,
    pub issued_at: DateTime<Utc>,
    pub email: Option<String>,
}

/// Manage JWT tokens.
#[derive(Clone)]
pub struct TokenManager {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
    clock: Arc<dyn Clock>,
}

impl TokenManager {
    /// Create a new [`TokenManager`] signing with HMAC-SHA256.
    pub fn new(
        secret: &str,
        issuer: &str,
        audience: &str,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.to_owned(),
            audience: audience.to_owned(),
            clock,
        }
    }

    /// Mint a token for `account_id`.
    pub fn issue(
        &self,
        account_id: Uuid,
        purpose: Purpose,
        ttl: Duration,
    ) -> Result<String> {
        self.sign(account_id, purpose, ttl, None)
    }

    /// Mint a session token, which also carries the account email.
    pub fn issue_session(&self, account_id: Uuid, email: &str) -> Result<String> {
        self.sign(
            account_id,
            Purpose::Session,
            Purpose::Session.ttl(),
            Some(email.to_owned()),
        )
    }

    fn sign(
        &self,
        account_id: Uuid,
        purpose: Purpose,
        ttl: Duration,
        email: Option<String>,
    ) -> Result<String> {
        let now = self.clock.now().timestamp();
        let claims = Claims {
            aud: self.audience.clone(),
            exp: now + ttl.num_seconds(),
            iat: now,
            iss: self.issuer.clone(),
            sub: account_id.to_string(),
            purpose,
            email,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| ServerError::internal("cannot sign token", err))
    }

    /// Check signature, expiry and purpose of a token.
    pub fn verify(
        &self,
        token: &str,
        expected: Purpose,
    ) -> std::result::Result<VerifiedToken, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the injected clock below.
        validation.validate_exp = false;
        validation.set_audience(&[&self.audience]);
        validation.set_issuer(&[&self.issuer]);

        let claims = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|_| TokenError::Invalid)?
            .claims;

        if self.clock.now().timestamp() >= claims.exp {
            return Err(TokenError::Expired);
        }

        if claims.purpose != expected {
            return Err(TokenError::PurposeMismatch);
        }

        let account_id =
            Uuid::parse_str(&claims.sub).map_err(|_| TokenError::Invalid)?;
        let issued_at = DateTime::from_timestamp(claims.iat, 0)
            .ok_or(TokenError::Invalid)?;

        Ok(VerifiedToken {
            account_id,
            purpose: claims.purpose,
            issued_at,
            email: claims.email,
        })
    }

    /// Verify a token and make sure it was issued to `account_id`.
    pub fn verify_for(
        &self,
        token: &str,
        expected: Purpose,
        account_id: Uuid,
    ) -> std::result::Result<VerifiedToken, TokenError> {
        let verified = self.verify(token, expected)?;
        if verified.account_id != account_id {
            return Err(TokenError::Invalid);
        }
        Ok(verified)
    }
}

#[cfg(test)]
pub(crate) fn test_tokens(clock: Arc<dyn Clock>) -> TokenManager {
    TokenManager::new("test-secret", "encore", "https://encore.test/", clock)
}
