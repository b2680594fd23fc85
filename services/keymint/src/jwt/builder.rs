//! Claim building for self-signed JWTs.
//!
//! Timestamps are the whole seconds of the supplied `now`, and `exp` is always
//! `iat` plus the configured lifetime.

use crate::error::{TokenError, TokenResult};
use crate::jwt::claims::{ClaimSet, Header, SigningAlgorithm};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Default token lifetime: one hour.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(3600);

/// Serialized header and claims, ready to be signed.
#[derive(Debug, Clone)]
pub struct EncodedJwt {
    /// JSON bytes of the header
    pub header: Vec<u8>,
    /// JSON bytes of the claim set
    pub claims: Vec<u8>,
    /// The claim set that was serialized
    pub claim_set: ClaimSet,
}

/// Builds the header and claim set for a self-signed JWT.
///
/// Deterministic apart from the `now` passed to [`ClaimBuilder::build`].
#[derive(Debug, Clone)]
pub struct ClaimBuilder {
    issuer: String,
    subject: Option<String>,
    audience: String,
    key_id: Option<String>,
    algorithm: SigningAlgorithm,
    lifetime: Duration,
    scopes: Vec<String>,
}

impl ClaimBuilder {
    /// Start a builder for `issuer` targeting `audience`.
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>, algorithm: SigningAlgorithm) -> Self {
        Self {
            issuer: issuer.into(),
            subject: None,
            audience: audience.into(),
            key_id: None,
            algorithm,
            lifetime: DEFAULT_LIFETIME,
            scopes: Vec::new(),
        }
    }

    /// Subject claim; defaults to the issuer.
    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Key identifier for the `kid` header. Empty strings are dropped.
    #[must_use]
    pub fn key_id(mut self, key_id: Option<String>) -> Self {
        self.key_id = key_id.filter(|k| !k.is_empty());
        self
    }

    /// Token lifetime; `exp = iat + lifetime`.
    #[must_use]
    pub const fn lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// OAuth2 scopes, emitted space separated in the `scope` claim.
    #[must_use]
    pub fn scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Serialize header and claims for an `iat` of `now`.
    ///
    /// Timestamps are truncated to whole seconds.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ConfigInvalid`] for a zero or overflowing lifetime
    /// and [`TokenError::Encoding`] if JSON serialization fails.
    pub fn build(&self, now: DateTime<Utc>) -> TokenResult<EncodedJwt> {
        let lifetime = i64::try_from(self.lifetime.as_secs())
            .ok()
            .filter(|secs| *secs > 0)
            .ok_or_else(|| TokenError::config("token lifetime must be at least one second"))?;

        let iat = now.timestamp();
        let exp = iat
            .checked_add(lifetime)
            .ok_or_else(|| TokenError::config("token lifetime overflows expiry"))?;

        let header = Header::new(self.algorithm, self.key_id.clone());
        let claim_set = ClaimSet {
            iss: self.issuer.clone(),
            scope: if self.scopes.is_empty() {
                None
            } else {
                Some(self.scopes.join(" "))
            },
            aud: self.audience.clone(),
            exp,
            iat,
            sub: self.subject.clone().unwrap_or_else(|| self.issuer.clone()),
        };

        Ok(EncodedJwt {
            header: serde_json::to_vec(&header)?,
            claims: serde_json::to_vec(&claim_set)?,
            claim_set,
        })
    }
}
