//! Token source for backends that sign locally built claims.
//!
//! Used with the hardware and Cloud KMS signers. Each call builds a fresh
//! claim set, hashes the signing input, opens the signer, signs, closes the
//! signer and assembles the compact JWT. With
//! [`TokenFlavor::ExchangedAccessToken`] the JWT is then traded for an opaque
//! access token at the OAuth2 token endpoint.

use super::{SerializedAccess, DEFAULT_TOKEN_URL};
use crate::error::{TokenError, TokenResult};
use crate::jwt::{assemble, signing_input, ClaimBuilder, SigningAlgorithm, DEFAULT_LIFETIME};
use crate::oauth2::exchange_jwt_bearer;
use crate::signer::{Digest, Signer};
use crate::token::{Clock, SystemClock, Token, TokenSource};
use async_trait::async_trait;
use chrono::DateTime;
use keymint_common::{build_http_client, HttpConfig};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Which kind of token the source hands out.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TokenFlavor {
    /// The signed JWT itself, with the configured audience.
    #[default]
    SelfSignedJwt,
    /// A JWT with `scope` and `aud = token_url`, exchanged for an access token.
    ExchangedAccessToken {
        /// OAuth2 scopes requested
        scopes: Vec<String>,
    },
}

/// Identity and claim settings for a signing source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningSourceConfig {
    /// Service account email used as `iss`
    pub email: String,
    /// Optional `sub`, defaults to `email`
    pub subject: Option<String>,
    /// `aud` for self-signed JWTs
    pub audience: String,
    /// Optional `kid` header
    pub key_id: Option<String>,
    /// Token flavor
    pub flavor: TokenFlavor,
    /// Token lifetime (default: 1 hour)
    pub lifetime: Duration,
    /// OAuth2 token endpoint for exchanged tokens
    pub token_url: String,
}

impl SigningSourceConfig {
    /// Self-signed JWT configuration for `email` targeting `audience`.
    #[must_use]
    pub fn new(email: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            subject: None,
            audience: audience.into(),
            key_id: None,
            flavor: TokenFlavor::SelfSignedJwt,
            lifetime: DEFAULT_LIFETIME,
            token_url: DEFAULT_TOKEN_URL.to_string(),
        }
    }

    /// Set the subject.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set the key identifier.
    #[must_use]
    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    /// Set the token flavor.
    #[must_use]
    pub fn with_flavor(mut self, flavor: TokenFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    /// Set the lifetime.
    #[must_use]
    pub const fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Set the OAuth2 token endpoint.
    #[must_use]
    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ConfigInvalid`] when a required field is empty or
    /// zero.
    pub fn validate(&self) -> TokenResult<()> {
        if self.email.trim().is_empty() {
            return Err(TokenError::config("email is required"));
        }
        if self.subject.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(TokenError::config("subject cannot be empty when set"));
        }
        if self.lifetime.as_secs() == 0 {
            return Err(TokenError::config("lifetime must be at least one second"));
        }
        match &self.flavor {
            TokenFlavor::SelfSignedJwt => {
                if self.audience.trim().is_empty() {
                    return Err(TokenError::config("audience is required"));
                }
            }
            TokenFlavor::ExchangedAccessToken { scopes } => {
                if scopes.is_empty() || scopes.iter().any(|s| s.trim().is_empty()) {
                    return Err(TokenError::config("at least one non-empty scope is required"));
                }
                url::Url::parse(&self.token_url)
                    .map_err(|e| TokenError::config(format!("invalid token URL: {e}")))?;
            }
        }
        Ok(())
    }

    fn claim_builder(&self, algorithm: SigningAlgorithm) -> ClaimBuilder {
        let builder = match &self.flavor {
            TokenFlavor::SelfSignedJwt => ClaimBuilder::new(&self.email, &self.audience, algorithm),
            TokenFlavor::ExchangedAccessToken { scopes } => {
                ClaimBuilder::new(&self.email, &self.token_url, algorithm).scopes(scopes.clone())
            }
        };
        let builder = builder
            .key_id(self.key_id.clone())
            .lifetime(self.lifetime);
        match &self.subject {
            Some(subject) => builder.subject(subject),
            None => builder,
        }
    }
}

/// Token source that signs claims with a [`Signer`].
pub struct SigningTokenSource<S> {
    config: SigningSourceConfig,
    signer: S,
    claims: ClaimBuilder,
    clock: Arc<dyn Clock>,
    http: Client,
    access: SerializedAccess,
}

impl<S: Signer> SigningTokenSource<S> {
    /// Create a source. Validates the configuration without touching the
    /// signer's keystore.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ConfigInvalid`] for an invalid configuration.
    pub fn new(config: SigningSourceConfig, signer: S) -> TokenResult<Self> {
        config.validate()?;
        let http = build_http_client(&HttpConfig::default())?;
        let claims = config.claim_builder(signer.algorithm());
        let access = SerializedAccess::new(signer.backend());
        Ok(Self {
            config,
            signer,
            claims,
            clock: Arc::new(SystemClock),
            http,
            access,
        })
    }

    /// Use `clock` for `iat`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use `http` for token exchanges.
    #[must_use]
    pub fn with_http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    /// The wrapped signer.
    #[must_use]
    pub const fn signer(&self) -> &S {
        &self.signer
    }

    async fn mint(&self) -> TokenResult<Token> {
        let now = self.clock.now();
        let encoded = self.claims.build(now)?;
        let digest = Digest::of(signing_input(&encoded.header, &encoded.claims).as_bytes());

        let mut session = self.signer.open().await?;
        let signed = session.sign(&digest).await;
        if let Err(e) = session.close().await {
            self.access.metrics().record_close_failure(self.signer.backend());
            warn!(backend = self.signer.backend(), error = %e, "failed to close signer session");
        }
        let signature = signed?;

        let jwt = assemble(&encoded.header, &encoded.claims, &signature);
        debug!(iat = encoded.claim_set.iat, exp = encoded.claim_set.exp, "JWT assembled");

        match self.config.flavor {
            TokenFlavor::SelfSignedJwt => {
                let expiry = DateTime::from_timestamp(encoded.claim_set.exp, 0)
                    .ok_or_else(|| TokenError::Internal("expiry out of range".to_string()))?;
                Ok(Token::bearer(jwt, expiry))
            }
            TokenFlavor::ExchangedAccessToken { .. } => {
                exchange_jwt_bearer(&self.http, &self.config.token_url, &jwt, now).await
            }
        }
    }
}

#[async_trait]
impl<S: Signer> TokenSource for SigningTokenSource<S> {
    #[instrument(skip(self), fields(backend = self.signer.backend(), iss = %self.config.email))]
    async fn token(&self) -> TokenResult<Token> {
        self.access.run(|| self.mint()).await
    }
}
