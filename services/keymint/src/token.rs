//! The issued token value and the source contract.

use crate::error::{TokenError, TokenResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Token type of every credential minted here.
pub const BEARER: &str = "Bearer";

/// A short-lived bearer credential.
///
/// Immutable once built. `Debug` never prints the bearer string.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Token {
    access_token: String,
    token_type: String,
    expiry: DateTime<Utc>,
}

impl Token {
    /// Create a bearer token expiring at `expiry`.
    #[must_use]
    pub fn bearer(access_token: impl Into<String>, expiry: DateTime<Utc>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: BEARER.to_string(),
            expiry,
        }
    }

    /// The bearer string.
    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Token kind, always `Bearer`.
    #[must_use]
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// Absolute expiry instant.
    #[must_use]
    pub const fn expiry(&self) -> DateTime<Utc> {
        self.expiry
    }

    /// Value for an `Authorization` header.
    #[must_use]
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    /// Whether the token has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// Anything that can hand out a fresh token.
///
/// Every call performs a full round trip to the backend; there is no cache.
/// Implementations serialize their own backend access, so one instance can be
/// shared between tasks behind an `Arc`.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Mint a token.
    async fn token(&self) -> TokenResult<Token>;
}

/// Token source that always returns the same, already-issued token.
///
/// Used for the caller's own credential when a backend must authenticate
/// before it can sign or exchange.
pub struct StaticTokenSource {
    token: Token,
}

impl StaticTokenSource {
    /// Wrap an existing token.
    #[must_use]
    pub const fn new(token: Token) -> Self {
        Self { token }
    }

    /// Wrap a raw bearer string with its expiry.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ConfigInvalid`] if the bearer string is empty.
    pub fn from_bearer(access_token: impl Into<String>, expiry: DateTime<Utc>) -> TokenResult<Self> {
        let access_token = access_token.into();
        if access_token.trim().is_empty() {
            return Err(TokenError::config("static access token cannot be empty"));
        }
        Ok(Self::new(Token::bearer(access_token, expiry)))
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> TokenResult<Token> {
        Ok(self.token.clone())
    }
}

/// Source of the current time for `iat`.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
