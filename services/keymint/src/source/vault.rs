//! Token source backed by a Vault secret engine.
//!
//! The engine mints the access token itself: a `GET {addr}/v1/{path}` with
//! the Vault token returns `data.token` plus its expiry. No claims are built
//! or signed locally.

use super::SerializedAccess;
use crate::error::{TokenError, TokenResult};
use crate::oauth2::{expiry_after, read_failure, transport_error};
use crate::token::{Clock, SystemClock, Token, TokenSource};
use async_trait::async_trait;
use chrono::DateTime;
use keymint_common::{build_http_client, HttpConfig};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

const BACKEND: &str = "vault";

/// Vault secret engine location and credentials.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Vault address, e.g. `https://vault.internal:8200`
    pub address: String,
    /// Secret path that issues tokens, e.g. `gcp/roleset/minter/token`
    pub path: String,
    /// Vault token sent as `X-Vault-Token`
    pub vault_token: SecretString,
    /// Extra CA certificate (PEM) for the Vault listener
    pub ca_cert: Option<PathBuf>,
    /// Request timeout
    pub timeout: Duration,
}

impl VaultConfig {
    /// Create a configuration with a 30s timeout.
    #[must_use]
    pub fn new(address: impl Into<String>, path: impl Into<String>, vault_token: SecretString) -> Self {
        Self {
            address: address.into(),
            path: path.into(),
            vault_token,
            ca_cert: None,
            timeout: Duration::from_secs(30),
        }
    }

    /// Trust an extra CA certificate.
    #[must_use]
    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert = Some(path.into());
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ConfigInvalid`] for an empty or malformed field.
    pub fn validate(&self) -> TokenResult<()> {
        url::Url::parse(&self.address)
            .map_err(|e| TokenError::config(format!("invalid Vault address: {e}")))?;
        if self.path.trim_matches('/').is_empty() {
            return Err(TokenError::config("Vault secret path is required"));
        }
        if self.vault_token.expose_secret().trim().is_empty() {
            return Err(TokenError::config("Vault token is required"));
        }
        if self.timeout.is_zero() {
            return Err(TokenError::config("Vault timeout must be positive"));
        }
        Ok(())
    }

    fn url(&self) -> String {
        format!(
            "{}/v1/{}",
            self.address.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }

    fn http_config(&self) -> TokenResult<HttpConfig> {
        let config = HttpConfig::default().with_timeout(self.timeout);
        match &self.ca_cert {
            Some(path) => Ok(config.with_root_ca_file(path)?),
            None => Ok(config),
        }
    }
}

#[derive(Deserialize)]
struct SecretResponse {
    #[serde(default)]
    data: Option<TokenData>,
}

#[derive(Deserialize)]
struct TokenData {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    expires_at_seconds: Option<i64>,
    #[serde(default)]
    token_ttl: Option<i64>,
}

/// Token source reading ready-made tokens from Vault.
pub struct VaultTokenSource {
    config: VaultConfig,
    http: Client,
    clock: Arc<dyn Clock>,
    access: SerializedAccess,
}

impl VaultTokenSource {
    /// Create a source.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ConfigInvalid`] for an invalid configuration or
    /// an unreadable CA certificate.
    pub fn new(config: VaultConfig) -> TokenResult<Self> {
        config.validate()?;
        let http = build_http_client(&config.http_config()?)?;
        Ok(Self {
            config,
            http,
            clock: Arc::new(SystemClock),
            access: SerializedAccess::new(BACKEND),
        })
    }

    /// Use `clock` to resolve relative TTLs.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn read_token(&self) -> TokenResult<Token> {
        let response = self
            .http
            .get(self.config.url())
            .header("X-Vault-Token", self.config.vault_token.expose_secret())
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, &e))?;

        if !response.status().is_success() {
            let (status, body) = read_failure(BACKEND, response).await;
            return Err(TokenError::UpstreamRejected {
                service: BACKEND,
                status: status.as_u16(),
                body,
            });
        }

        let parsed: SecretResponse = response
            .json()
            .await
            .map_err(|e| TokenError::malformed(BACKEND, e.to_string()))?;
        let data = parsed
            .data
            .ok_or_else(|| TokenError::malformed(BACKEND, "missing data"))?;
        let token = data
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| TokenError::malformed(BACKEND, "missing data.token"))?;

        let now = self.clock.now();
        let expiry = match (data.expires_at_seconds, data.token_ttl) {
            (Some(at), _) => {
                let expiry = DateTime::from_timestamp(at, 0)
                    .ok_or_else(|| TokenError::malformed(BACKEND, "expires_at_seconds out of range"))?;
                if expiry <= now {
                    return Err(TokenError::malformed(BACKEND, "token already expired"));
                }
                expiry
            }
            (None, Some(ttl)) => expiry_after(BACKEND, now, ttl)?,
            (None, None) => return Err(TokenError::malformed(BACKEND, "missing token expiry")),
        };

        debug!(%expiry, "token read from Vault");
        Ok(Token::bearer(token, expiry))
    }
}

#[async_trait]
impl TokenSource for VaultTokenSource {
    #[instrument(skip(self), fields(path = %self.config.path))]
    async fn token(&self) -> TokenResult<Token> {
        self.access.run(|| self.read_token()).await
    }
}
