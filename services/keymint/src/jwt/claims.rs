//! JOSE header and claim set types.

use crate::error::{TokenError, TokenResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// JWS algorithm advertised in the header.
///
/// Must match the key type held by the signer, otherwise the verifier
/// rejects the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    /// RSASSA-PKCS1-v1_5 with SHA-256
    RS256,
    /// RSASSA-PSS with SHA-256
    PS256,
    /// ECDSA P-256 with SHA-256
    ES256,
}

impl SigningAlgorithm {
    /// Parse algorithm from string.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ConfigInvalid`] for unsupported names.
    pub fn parse(s: &str) -> TokenResult<Self> {
        match s.to_uppercase().as_str() {
            "RS256" => Ok(Self::RS256),
            "PS256" => Ok(Self::PS256),
            "ES256" => Ok(Self::ES256),
            _ => Err(TokenError::config(format!("unsupported signing algorithm: {s}"))),
        }
    }

    /// Name used in the `alg` header.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RS256 => "RS256",
            Self::PS256 => "PS256",
            Self::ES256 => "ES256",
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JOSE header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Signing algorithm
    pub alg: SigningAlgorithm,
    /// Always `JWT`
    pub typ: String,
    /// Key identifier, omitted when unknown
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

impl Header {
    /// Header with `typ: JWT`.
    #[must_use]
    pub fn new(alg: SigningAlgorithm, kid: Option<String>) -> Self {
        Self {
            alg,
            typ: "JWT".to_string(),
            kid,
        }
    }
}

/// Claim set of a self-signed service account JWT.
///
/// `exp == iat + lifetime`, with both in whole seconds since the epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimSet {
    /// Issuer email
    pub iss: String,
    /// Space separated scopes, only for exchanged tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Audience
    pub aud: String,
    /// Expiry, seconds since the epoch
    pub exp: i64,
    /// Issued at, seconds since the epoch
    pub iat: i64,
    /// Subject
    pub sub: String,
}

impl ClaimSet {
    /// Lifetime in seconds.
    #[must_use]
    pub const fn lifetime_secs(&self) -> i64 {
        self.exp - self.iat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!(SigningAlgorithm::parse("RS256").unwrap(), SigningAlgorithm::RS256);
        assert_eq!(SigningAlgorithm::parse("ps256").unwrap(), SigningAlgorithm::PS256);
        assert_eq!(SigningAlgorithm::parse("ES256").unwrap(), SigningAlgorithm::ES256);
        assert!(SigningAlgorithm::parse("HS256").is_err());
    }

    #[test]
    fn test_header_serialization_omits_empty_kid() {
        let header = Header::new(SigningAlgorithm::RS256, None);
        let json = serde_json::to_string(&header).unwrap();
        assert_eq!(json, r#"{"alg":"RS256","typ":"JWT"}"#);

        let header = Header::new(SigningAlgorithm::RS256, Some("abc123".to_string()));
        let json = serde_json::to_string(&header).unwrap();
        assert_eq!(json, r#"{"alg":"RS256","typ":"JWT","kid":"abc123"}"#);
    }

    #[test]
    fn test_claims_field_order() {
        let claims = ClaimSet {
            iss: "sa@project.iam.gserviceaccount.com".to_string(),
            scope: None,
            aud: "https://pubsub.googleapis.com/".to_string(),
            exp: 3600,
            iat: 0,
            sub: "sa@project.iam.gserviceaccount.com".to_string(),
        };
        let json = serde_json::to_string(&claims).unwrap();
        assert!(json.starts_with(r#"{"iss":"sa@project.iam.gserviceaccount.com","aud""#));
        assert_eq!(claims.lifetime_secs(), 3600);
    }
}
