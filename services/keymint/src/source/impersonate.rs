//! Token source that impersonates another service account.
//!
//! Authenticated with the caller's own token, the IAM credentials API mints
//! a token for the target principal, optionally through a chain of
//! delegates. With a subject set (domain-wide delegation) the target instead
//! signs a JWT via `signJwt`, which is then exchanged at the token endpoint.

use super::{SerializedAccess, DEFAULT_TOKEN_URL};
use crate::error::{TokenError, TokenResult};
use crate::jwt::{ClaimBuilder, SigningAlgorithm};
use crate::oauth2::{error_message, exchange_jwt_bearer, read_failure, status_error, transport_error};
use crate::token::{Clock, SystemClock, Token, TokenSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keymint_common::{build_http_client, HttpConfig};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

const BACKEND: &str = "impersonation";

/// Default IAM credentials endpoint.
pub const DEFAULT_IAM_ENDPOINT: &str = "https://iamcredentials.googleapis.com";

/// Longest lifetime the credentials API grants.
pub const MAX_LIFETIME: Duration = Duration::from_secs(12 * 3600);

/// Target identity and delegation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImpersonationConfig {
    /// Service account to act as
    pub target_principal: String,
    /// Intermediate service accounts, in call order
    pub delegates: Vec<String>,
    /// OAuth2 scopes for the minted token
    pub scopes: Vec<String>,
    /// Token lifetime (default: 1 hour, at most 12 hours)
    pub lifetime: Duration,
    /// User to impersonate through domain-wide delegation
    pub subject: Option<String>,
    /// IAM credentials endpoint
    pub iam_endpoint: String,
    /// OAuth2 token endpoint, used when `subject` is set
    pub token_url: String,
}

impl ImpersonationConfig {
    /// Impersonate `target_principal` with `scopes`.
    #[must_use]
    pub fn new(target_principal: impl Into<String>, scopes: Vec<String>) -> Self {
        Self {
            target_principal: target_principal.into(),
            delegates: Vec::new(),
            scopes,
            lifetime: crate::jwt::DEFAULT_LIFETIME,
            subject: None,
            iam_endpoint: DEFAULT_IAM_ENDPOINT.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
        }
    }

    /// Set the delegation chain.
    #[must_use]
    pub fn with_delegates(mut self, delegates: Vec<String>) -> Self {
        self.delegates = delegates;
        self
    }

    /// Set the lifetime.
    #[must_use]
    pub const fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Impersonate `subject` through domain-wide delegation.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Override the IAM credentials endpoint.
    #[must_use]
    pub fn with_iam_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.iam_endpoint = endpoint.into();
        self
    }

    /// Override the token endpoint.
    #[must_use]
    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ConfigInvalid`] for an empty principal, scope
    /// list or delegate, or a lifetime outside `1s..=12h`.
    pub fn validate(&self) -> TokenResult<()> {
        if self.target_principal.trim().is_empty() {
            return Err(TokenError::config("target principal is required"));
        }
        if self.scopes.is_empty() || self.scopes.iter().any(|s| s.trim().is_empty()) {
            return Err(TokenError::config("at least one non-empty scope is required"));
        }
        if self.delegates.iter().any(|d| d.trim().is_empty()) {
            return Err(TokenError::config("delegates cannot be empty"));
        }
        if self.lifetime.as_secs() == 0 || self.lifetime > MAX_LIFETIME {
            return Err(TokenError::config(format!(
                "lifetime must be between 1s and {}s",
                MAX_LIFETIME.as_secs()
            )));
        }
        if self.subject.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(TokenError::config("subject cannot be empty when set"));
        }
        url::Url::parse(&self.iam_endpoint)
            .map_err(|e| TokenError::config(format!("invalid IAM endpoint: {e}")))?;
        url::Url::parse(&self.token_url)
            .map_err(|e| TokenError::config(format!("invalid token URL: {e}")))?;
        Ok(())
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/v1/{}:{method}",
            self.iam_endpoint.trim_end_matches('/'),
            resource_name(&self.target_principal)
        )
    }

    fn delegate_names(&self) -> Vec<String> {
        self.delegates.iter().map(|d| resource_name(d)).collect()
    }
}

/// Whether `message` mentions `account` as a whole email, not as the tail of
/// a longer one.
fn names_account(message: &str, account: &str) -> bool {
    message
        .split(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '-' | '_')))
        .any(|word| word.trim_end_matches('.') == account)
}

fn resource_name(principal: &str) -> String {
    if principal.starts_with("projects/") {
        principal.to_string()
    } else {
        format!("projects/-/serviceAccounts/{principal}")
    }
}

#[derive(Serialize)]
struct GenerateAccessTokenRequest<'a> {
    delegates: &'a [String],
    scope: &'a [String],
    lifetime: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAccessTokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expire_time: Option<String>,
}

#[derive(Serialize)]
struct SignJwtRequest<'a> {
    delegates: &'a [String],
    payload: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignJwtResponse {
    #[serde(default)]
    key_id: Option<String>,
    #[serde(default)]
    signed_jwt: Option<String>,
}

/// Token source acting as another principal.
pub struct ImpersonatedTokenSource {
    config: ImpersonationConfig,
    caller: Arc<dyn TokenSource>,
    http: Client,
    clock: Arc<dyn Clock>,
    access: SerializedAccess,
}

impl ImpersonatedTokenSource {
    /// Create a source that authenticates with tokens from `caller`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ConfigInvalid`] for an invalid configuration.
    pub fn new(config: ImpersonationConfig, caller: Arc<dyn TokenSource>) -> TokenResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            caller,
            http: build_http_client(&HttpConfig::default())?,
            clock: Arc::new(SystemClock),
            access: SerializedAccess::new(BACKEND),
        })
    }

    /// Use `http` for API calls.
    #[must_use]
    pub fn with_http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    /// Use `clock` for `iat` in delegated JWTs.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn call_iam<B, R>(&self, method: &str, authorization: &str, body: &B) -> TokenResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let response = self
            .http
            .post(self.config.method_url(method))
            .header(reqwest::header::AUTHORIZATION, authorization)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, &e))?;

        if !response.status().is_success() {
            let (status, body) = read_failure(BACKEND, response).await;
            return Err(self.classify(status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| TokenError::malformed(BACKEND, e.to_string()))
    }

    /// A 403 naming one of our delegates means that hop refused; any other
    /// 403 means the caller cannot act as the target.
    fn classify(&self, status: StatusCode, body: &str) -> TokenError {
        if status != StatusCode::FORBIDDEN {
            return status_error(BACKEND, status, body);
        }
        let message = error_message(body);
        let rejected = self
            .config
            .delegates
            .iter()
            .find(|delegate| names_account(&message, delegate.trim_start_matches("projects/-/serviceAccounts/")));
        match rejected {
            Some(delegate) => TokenError::InvalidDelegationChain {
                delegate: delegate.clone(),
                message,
            },
            None => TokenError::InsufficientPermission {
                principal: self.config.target_principal.clone(),
                message,
            },
        }
    }

    async fn generate_access_token(&self, authorization: &str) -> TokenResult<Token> {
        let delegates = self.config.delegate_names();
        let request = GenerateAccessTokenRequest {
            delegates: &delegates,
            scope: &self.config.scopes,
            lifetime: format!("{}s", self.config.lifetime.as_secs()),
        };
        let response: GenerateAccessTokenResponse = self
            .call_iam("generateAccessToken", authorization, &request)
            .await?;

        let access_token = response
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| TokenError::malformed(BACKEND, "missing accessToken"))?;
        let expire_time = response
            .expire_time
            .ok_or_else(|| TokenError::malformed(BACKEND, "missing expireTime"))?;
        let expiry = DateTime::parse_from_rfc3339(&expire_time)
            .map_err(|e| TokenError::malformed(BACKEND, format!("invalid expireTime: {e}")))?
            .with_timezone(&Utc);

        Ok(Token::bearer(access_token, expiry))
    }

    async fn delegated_token(&self, authorization: &str, subject: &str) -> TokenResult<Token> {
        let now = self.clock.now();
        let encoded = ClaimBuilder::new(
            &self.config.target_principal,
            &self.config.token_url,
            SigningAlgorithm::RS256,
        )
        .subject(subject)
        .scopes(self.config.scopes.clone())
        .lifetime(self.config.lifetime)
        .build(now)?;
        let payload =
            String::from_utf8(encoded.claims).map_err(|e| TokenError::Encoding(e.to_string()))?;

        let delegates = self.config.delegate_names();
        let response: SignJwtResponse = self
            .call_iam(
                "signJwt",
                authorization,
                &SignJwtRequest {
                    delegates: &delegates,
                    payload,
                },
            )
            .await?;

        let signed_jwt = response
            .signed_jwt
            .filter(|jwt| !jwt.is_empty())
            .ok_or_else(|| TokenError::malformed(BACKEND, "missing signedJwt"))?;
        debug!(key_id = response.key_id.as_deref().unwrap_or(""), "JWT signed by target");

        exchange_jwt_bearer(&self.http, &self.config.token_url, &signed_jwt, now).await
    }

    async fn impersonate(&self) -> TokenResult<Token> {
        let authorization = self.caller.token().await?.authorization_header();
        match &self.config.subject {
            Some(subject) => self.delegated_token(&authorization, subject).await,
            None => self.generate_access_token(&authorization).await,
        }
    }
}

#[async_trait]
impl TokenSource for ImpersonatedTokenSource {
    #[instrument(skip(self), fields(target = %self.config.target_principal, delegates = self.config.delegates.len()))]
    async fn token(&self) -> TokenResult<Token> {
        self.access.run(|| self.impersonate()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::StaticTokenSource;

    const TARGET: &str = "target@project.iam.gserviceaccount.com";

    fn scopes() -> Vec<String> {
        vec!["https://www.googleapis.com/auth/cloud-platform".to_string()]
    }

    #[test]
    fn test_validation() {
        assert!(ImpersonationConfig::new(TARGET, scopes()).validate().is_ok());
        assert!(ImpersonationConfig::new("", scopes()).validate().is_err());
        assert!(ImpersonationConfig::new(TARGET, vec![]).validate().is_err());
        assert!(ImpersonationConfig::new(TARGET, scopes())
            .with_lifetime(Duration::from_secs(43_201))
            .validate()
            .is_err());
        assert!(ImpersonationConfig::new(TARGET, scopes())
            .with_delegates(vec![String::new()])
            .validate()
            .is_err());
    }

    #[test]
    fn test_resource_names() {
        let config = ImpersonationConfig::new(TARGET, scopes()).with_delegates(vec![
            "hop@project.iam.gserviceaccount.com".to_string(),
            "projects/-/serviceAccounts/hop2@project.iam.gserviceaccount.com".to_string(),
        ]);
        assert_eq!(
            config.method_url("generateAccessToken"),
            format!("{DEFAULT_IAM_ENDPOINT}/v1/projects/-/serviceAccounts/{TARGET}:generateAccessToken")
        );
        assert_eq!(
            config.delegate_names(),
            vec![
                "projects/-/serviceAccounts/hop@project.iam.gserviceaccount.com".to_string(),
                "projects/-/serviceAccounts/hop2@project.iam.gserviceaccount.com".to_string(),
            ]
        );
    }

    #[test]
    fn test_delegate_matched_on_whole_account() {
        let hop = "hop@project.iam.gserviceaccount.com";
        assert!(names_account(
            "Permission 'iam.serviceAccounts.getAccessToken' denied on resource \
             (or it may not exist): projects/-/serviceAccounts/hop@project.iam.gserviceaccount.com",
            hop
        ));
        assert!(names_account("hop@project.iam.gserviceaccount.com.", hop));
        assert!(names_account("account 'hop@project.iam.gserviceaccount.com' refused", hop));
        assert!(!names_account(
            "denied on projects/-/serviceAccounts/otherhop@project.iam.gserviceaccount.com",
            hop
        ));
        assert!(!names_account("denied on hop@project.iam.gserviceaccount.com.evil", hop));
    }

    #[test]
    fn test_forbidden_naming_other_account_is_insufficient_permission() {
        let config = ImpersonationConfig::new(TARGET, scopes())
            .with_delegates(vec!["hop@project.iam.gserviceaccount.com".to_string()]);
        let caller = Arc::new(StaticTokenSource::new(Token::bearer(
            "ya29.caller",
            chrono::Utc::now() + chrono::Duration::hours(1),
        )));
        let source = ImpersonatedTokenSource::new(config, caller).unwrap();

        let body = r#"{"error":{"code":403,"message":"Permission denied on projects/-/serviceAccounts/otherhop@project.iam.gserviceaccount.com","status":"PERMISSION_DENIED"}}"#;
        assert!(matches!(
            source.classify(StatusCode::FORBIDDEN, body),
            TokenError::InsufficientPermission { .. }
        ));

        let body = r#"{"error":{"code":403,"message":"Permission denied on projects/-/serviceAccounts/hop@project.iam.gserviceaccount.com","status":"PERMISSION_DENIED"}}"#;
        assert!(matches!(
            source.classify(StatusCode::FORBIDDEN, body),
            TokenError::InvalidDelegationChain { .. }
        ));
    }
}
