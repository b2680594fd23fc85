//! Downscoped token source.
//!
//! Exchanges a root access token at the STS endpoint for one restricted by a
//! credential access boundary. Nothing is signed locally.

use super::SerializedAccess;
use crate::error::{TokenError, TokenResult};
use crate::oauth2::{
    read_failure, status_error, transport_error, TokenResponse, ACCESS_TOKEN_TYPE,
    TOKEN_EXCHANGE_GRANT,
};
use crate::token::{Clock, SystemClock, Token, TokenSource};
use async_trait::async_trait;
use keymint_common::{build_http_client, HttpConfig};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

const BACKEND: &str = "sts";

/// Default STS token exchange endpoint.
pub const DEFAULT_STS_ENDPOINT: &str = "https://sts.googleapis.com/v1/token";

/// Most rules one access boundary may carry.
pub const MAX_RULES: usize = 10;

const ROLE_PREFIX: &str = "inRole:";

/// Condition restricting where a rule applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityCondition {
    /// CEL expression, e.g. a `resource.name.startsWith(..)` check
    pub expression: String,
    /// Short label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Longer description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One resource and the roles available on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessBoundaryRule {
    /// Full resource name, e.g. `//storage.googleapis.com/projects/_/buckets/b`
    pub available_resource: String,
    /// Roles in `inRole:` form
    pub available_permissions: Vec<String>,
    /// Optional condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_condition: Option<AvailabilityCondition>,
}

impl AccessBoundaryRule {
    /// Rule granting `permissions` on `resource`.
    #[must_use]
    pub fn new(resource: impl Into<String>, permissions: Vec<String>) -> Self {
        Self {
            available_resource: resource.into(),
            available_permissions: permissions,
            availability_condition: None,
        }
    }

    /// Attach a condition.
    #[must_use]
    pub fn with_condition(mut self, condition: AvailabilityCondition) -> Self {
        self.availability_condition = Some(condition);
        self
    }

    fn validate(&self, index: usize) -> TokenResult<()> {
        if self.available_resource.trim().is_empty() {
            return Err(TokenError::config(format!("rule {index}: resource is required")));
        }
        if self.available_permissions.is_empty() {
            return Err(TokenError::config(format!(
                "rule {index}: at least one permission is required"
            )));
        }
        if let Some(bad) = self
            .available_permissions
            .iter()
            .find(|p| !p.starts_with(ROLE_PREFIX) || p.len() == ROLE_PREFIX.len())
        {
            return Err(TokenError::config(format!(
                "rule {index}: permission {bad:?} must have the form inRole:<role>"
            )));
        }
        if let Some(condition) = &self.availability_condition {
            if condition.expression.trim().is_empty() {
                return Err(TokenError::config(format!(
                    "rule {index}: condition expression is required"
                )));
            }
        }
        Ok(())
    }
}

/// Access boundary applied to the root token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownscopeConfig {
    /// Rules, in order
    pub rules: Vec<AccessBoundaryRule>,
    /// STS endpoint
    pub sts_endpoint: String,
}

impl DownscopeConfig {
    /// Boundary made of `rules`.
    #[must_use]
    pub fn new(rules: Vec<AccessBoundaryRule>) -> Self {
        Self {
            rules,
            sts_endpoint: DEFAULT_STS_ENDPOINT.to_string(),
        }
    }

    /// Override the STS endpoint.
    #[must_use]
    pub fn with_sts_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.sts_endpoint = endpoint.into();
        self
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ConfigInvalid`] for an empty or oversized rule
    /// list or a malformed rule.
    pub fn validate(&self) -> TokenResult<()> {
        if self.rules.is_empty() {
            return Err(TokenError::config("at least one access boundary rule is required"));
        }
        if self.rules.len() > MAX_RULES {
            return Err(TokenError::config(format!(
                "at most {MAX_RULES} access boundary rules are allowed, got {}",
                self.rules.len()
            )));
        }
        for (index, rule) in self.rules.iter().enumerate() {
            rule.validate(index)?;
        }
        url::Url::parse(&self.sts_endpoint)
            .map_err(|e| TokenError::config(format!("invalid STS endpoint: {e}")))?;
        Ok(())
    }

    /// `options` form value for the exchange.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Encoding`] if serialization fails.
    pub fn options(&self) -> TokenResult<String> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Boundary<'a> {
            access_boundary_rules: &'a [AccessBoundaryRule],
        }
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Options<'a> {
            access_boundary: Boundary<'a>,
        }

        Ok(serde_json::to_string(&Options {
            access_boundary: Boundary {
                access_boundary_rules: &self.rules,
            },
        })?)
    }
}

/// Token source handing out downscoped tokens.
pub struct DownscopedTokenSource {
    config: DownscopeConfig,
    options: String,
    root: Arc<dyn TokenSource>,
    http: Client,
    clock: Arc<dyn Clock>,
    access: SerializedAccess,
}

impl DownscopedTokenSource {
    /// Create a source downscoping tokens from `root`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ConfigInvalid`] for an invalid boundary.
    pub fn new(config: DownscopeConfig, root: Arc<dyn TokenSource>) -> TokenResult<Self> {
        config.validate()?;
        let options = config.options()?;
        Ok(Self {
            config,
            options,
            root,
            http: build_http_client(&HttpConfig::default())?,
            clock: Arc::new(SystemClock),
            access: SerializedAccess::new(BACKEND),
        })
    }

    /// Use `http` for the exchange.
    #[must_use]
    pub fn with_http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    /// Use `clock` to resolve `expires_in`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn exchange(&self) -> TokenResult<Token> {
        let root = self.root.token().await?;
        let now = self.clock.now();

        let response = self
            .http
            .post(&self.config.sts_endpoint)
            .form(&[
                ("grant_type", TOKEN_EXCHANGE_GRANT),
                ("subject_token_type", ACCESS_TOKEN_TYPE),
                ("requested_token_type", ACCESS_TOKEN_TYPE),
                ("subject_token", root.access_token()),
                ("options", self.options.as_str()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, &e))?;

        if !response.status().is_success() {
            let (status, body) = read_failure(BACKEND, response).await;
            return Err(status_error(BACKEND, status, &body));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| TokenError::malformed(BACKEND, e.to_string()))?;
        parsed.into_token(BACKEND, now, Some(root.expiry()))
    }
}

#[async_trait]
impl TokenSource for DownscopedTokenSource {
    #[instrument(skip(self), fields(rules = self.config.rules.len()))]
    async fn token(&self) -> TokenResult<Token> {
        self.access.run(|| self.exchange()).await
    }
}
