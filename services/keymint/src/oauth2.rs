//! OAuth2 token endpoint calls and shared response handling.

use crate::error::{TokenError, TokenResult};
use crate::token::Token;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};

/// Grant type for exchanging a signed JWT assertion.
pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Grant type for RFC 8693 token exchange.
pub const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

/// Token type URN for OAuth2 access tokens.
pub const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

/// Successful token endpoint response.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenResponse {
    /// Turn the response into a bearer token.
    ///
    /// Expiry is `now + expires_in`, or `fallback_expiry` when the endpoint
    /// does not report a lifetime.
    pub(crate) fn into_token(
        self,
        service: &'static str,
        now: DateTime<Utc>,
        fallback_expiry: Option<DateTime<Utc>>,
    ) -> TokenResult<Token> {
        let access_token = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| TokenError::malformed(service, "missing access_token"))?;

        if let Some(kind) = self.token_type.as_deref() {
            if !kind.eq_ignore_ascii_case("bearer") {
                return Err(TokenError::malformed(
                    service,
                    format!("unexpected token_type {kind}"),
                ));
            }
        }

        let expiry = match (self.expires_in, fallback_expiry) {
            (Some(secs), _) => expiry_after(service, now, secs)?,
            (None, Some(expiry)) => expiry,
            (None, None) => return Err(TokenError::malformed(service, "missing expires_in")),
        };

        Ok(Token::bearer(access_token, expiry))
    }
}

/// `now + secs` for a lifetime reported by a backend.
///
/// # Errors
///
/// Returns [`TokenError::MalformedResponse`] for a lifetime that is not
/// positive or does not fit in a timestamp.
pub(crate) fn expiry_after(
    service: &'static str,
    now: DateTime<Utc>,
    secs: i64,
) -> TokenResult<DateTime<Utc>> {
    if secs <= 0 {
        return Err(TokenError::malformed(
            service,
            format!("lifetime {secs}s is not positive"),
        ));
    }
    Duration::try_seconds(secs)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| TokenError::malformed(service, format!("lifetime {secs}s out of range")))
}

#[derive(Deserialize)]
struct GoogleErrorBody {
    error: GoogleError,
}

#[derive(Deserialize)]
struct GoogleError {
    message: String,
}

#[derive(Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Extract a readable message from an error body.
///
/// Understands Google API errors (`{"error": {"message": ..}}`) and OAuth2
/// errors (`{"error": .., "error_description": ..}`); anything else is
/// returned as-is.
pub(crate) fn error_message(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<GoogleErrorBody>(body) {
        return parsed.error.message;
    }
    if let Ok(parsed) = serde_json::from_str::<OAuthErrorBody>(body) {
        return match parsed.error_description {
            Some(description) => format!("{}: {description}", parsed.error),
            None => parsed.error,
        };
    }
    body.trim().to_string()
}

/// Map a transport-level failure.
pub(crate) fn transport_error(service: &'static str, err: &reqwest::Error) -> TokenError {
    TokenError::unavailable(service, err.to_string())
}

/// Split a response into its status and body text.
pub(crate) async fn read_failure(service: &'static str, response: Response) -> (StatusCode, String) {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    debug!(service, status = status.as_u16(), "backend returned failure");
    (status, body)
}

/// Default mapping for a non-success status.
pub(crate) fn status_error(service: &'static str, status: StatusCode, body: &str) -> TokenError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TokenError::PermissionDenied {
            service,
            message: error_message(body),
        },
        StatusCode::TOO_MANY_REQUESTS => TokenError::unavailable(service, "rate limited"),
        s if s.is_server_error() => {
            TokenError::unavailable(service, format!("status {s}: {}", error_message(body)))
        }
        s => TokenError::UpstreamRejected {
            service,
            status: s.as_u16(),
            body: error_message(body),
        },
    }
}

/// Exchange a signed JWT for an access token with the jwt-bearer grant.
///
/// # Errors
///
/// Returns a resource error on transport failure, the mapped status error on
/// rejection and [`TokenError::MalformedResponse`] if no token came back.
#[instrument(skip(http, assertion))]
pub(crate) async fn exchange_jwt_bearer(
    http: &Client,
    token_url: &str,
    assertion: &str,
    now: DateTime<Utc>,
) -> TokenResult<Token> {
    const SERVICE: &str = "oauth2";

    let response = http
        .post(token_url)
        .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion)])
        .send()
        .await
        .map_err(|e| transport_error(SERVICE, &e))?;

    if !response.status().is_success() {
        let (status, body) = read_failure(SERVICE, response).await;
        return Err(status_error(SERVICE, status, &body));
    }

    let parsed: TokenResponse = response
        .json()
        .await
        .map_err(|e| TokenError::malformed(SERVICE, e.to_string()))?;
    parsed.into_token(SERVICE, now, None)
}
