//! Cloud KMS signer.
//!
//! Sends the SHA-256 digest to `asymmetricSign` on a key version and returns
//! the signature in JWS form. The private key never leaves the KMS.

use super::{Digest, Signer, SignerSession};
use crate::error::{TokenError, TokenResult};
use crate::jwt::SigningAlgorithm;
use crate::oauth2::{read_failure, status_error, transport_error};
use crate::token::TokenSource;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use keymint_common::{build_http_client, HttpConfig};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

const BACKEND: &str = "cloud-kms";

/// Default Cloud KMS endpoint.
pub const DEFAULT_KMS_ENDPOINT: &str = "https://cloudkms.googleapis.com";

const KEY_NAME_LABELS: [&str; 5] = ["projects", "locations", "keyRings", "cryptoKeys", "cryptoKeyVersions"];

/// Cloud KMS key version to sign with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmsConfig {
    /// `projects/*/locations/*/keyRings/*/cryptoKeys/*/cryptoKeyVersions/*`
    pub key_version_name: String,
    /// Algorithm of the key version
    pub algorithm: SigningAlgorithm,
    /// API endpoint
    pub endpoint: String,
}

impl KmsConfig {
    /// RS256 key version on the public endpoint.
    #[must_use]
    pub fn new(key_version_name: impl Into<String>) -> Self {
        Self {
            key_version_name: key_version_name.into(),
            algorithm: SigningAlgorithm::RS256,
            endpoint: DEFAULT_KMS_ENDPOINT.to_string(),
        }
    }

    /// Set the key algorithm.
    #[must_use]
    pub const fn with_algorithm(mut self, algorithm: SigningAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Set the algorithm from a KMS algorithm name such as
    /// `RSA_SIGN_PKCS1_2048_SHA256`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ConfigInvalid`] for algorithms JWTs cannot carry.
    pub fn with_kms_algorithm(self, name: &str) -> TokenResult<Self> {
        let algorithm = match name {
            "RSA_SIGN_PKCS1_2048_SHA256" | "RSA_SIGN_PKCS1_3072_SHA256" | "RSA_SIGN_PKCS1_4096_SHA256" => {
                SigningAlgorithm::RS256
            }
            "RSA_SIGN_PSS_2048_SHA256" | "RSA_SIGN_PSS_3072_SHA256" | "RSA_SIGN_PSS_4096_SHA256" => {
                SigningAlgorithm::PS256
            }
            "EC_SIGN_P256_SHA256" => SigningAlgorithm::ES256,
            other => return Err(TokenError::config(format!("unsupported KMS algorithm: {other}"))),
        };
        Ok(self.with_algorithm(algorithm))
    }

    /// Override the API endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ConfigInvalid`] for a malformed key name or endpoint.
    pub fn validate(&self) -> TokenResult<()> {
        let segments: Vec<&str> = self.key_version_name.split('/').collect();
        let well_formed = segments.len() == KEY_NAME_LABELS.len() * 2
            && segments
                .chunks(2)
                .zip(KEY_NAME_LABELS)
                .all(|(pair, label)| pair[0] == label && !pair[1].is_empty());
        if !well_formed {
            return Err(TokenError::config(format!(
                "invalid KMS key version name: {}",
                self.key_version_name
            )));
        }

        url::Url::parse(&self.endpoint)
            .map_err(|e| TokenError::config(format!("invalid KMS endpoint: {e}")))?;
        Ok(())
    }

    fn sign_url(&self) -> String {
        format!(
            "{}/v1/{}:asymmetricSign",
            self.endpoint.trim_end_matches('/'),
            self.key_version_name
        )
    }
}

#[derive(Serialize)]
struct AsymmetricSignRequest<'a> {
    digest: DigestField<'a>,
}

#[derive(Serialize)]
struct DigestField<'a> {
    sha256: &'a str,
}

#[derive(Deserialize)]
struct AsymmetricSignResponse {
    #[serde(default)]
    signature: Option<String>,
}

/// Signer backed by a Cloud KMS key version.
pub struct CloudKmsSigner {
    config: KmsConfig,
    caller: Arc<dyn TokenSource>,
    http: Client,
}

impl CloudKmsSigner {
    /// Create a signer that authenticates with tokens from `caller`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ConfigInvalid`] for a bad configuration.
    pub fn new(config: KmsConfig, caller: Arc<dyn TokenSource>) -> TokenResult<Self> {
        let http = build_http_client(&HttpConfig::default())?;
        Self::with_http_client(config, caller, http)
    }

    /// Create a signer that uses an existing HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ConfigInvalid`] for a bad configuration.
    pub fn with_http_client(
        config: KmsConfig,
        caller: Arc<dyn TokenSource>,
        http: Client,
    ) -> TokenResult<Self> {
        config.validate()?;
        Ok(Self { config, caller, http })
    }

    /// Key version this signer uses.
    #[must_use]
    pub fn key_version_name(&self) -> &str {
        &self.config.key_version_name
    }
}

#[async_trait]
impl Signer for CloudKmsSigner {
    fn algorithm(&self) -> SigningAlgorithm {
        self.config.algorithm
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }

    #[instrument(skip(self), fields(key = %self.config.key_version_name))]
    async fn open(&self) -> TokenResult<Box<dyn SignerSession>> {
        let caller = self.caller.token().await?;
        Ok(Box::new(KmsSession {
            http: self.http.clone(),
            url: self.config.sign_url(),
            key_version_name: self.config.key_version_name.clone(),
            algorithm: self.config.algorithm,
            authorization: Some(caller.authorization_header()),
        }))
    }
}

struct KmsSession {
    http: Client,
    url: String,
    key_version_name: String,
    algorithm: SigningAlgorithm,
    authorization: Option<String>,
}

#[async_trait]
impl SignerSession for KmsSession {
    async fn sign(&mut self, digest: &Digest) -> TokenResult<Vec<u8>> {
        let authorization = self
            .authorization
            .as_deref()
            .ok_or_else(|| TokenError::signing("KMS session already closed"))?;

        let encoded = STANDARD.encode(digest.as_bytes());
        let response = self
            .http
            .post(&self.url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .json(&AsymmetricSignRequest {
                digest: DigestField { sha256: &encoded },
            })
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, &e))?;

        if !response.status().is_success() {
            let (status, body) = read_failure(BACKEND, response).await;
            return Err(match status {
                StatusCode::NOT_FOUND => TokenError::KeyNotFound(self.key_version_name.clone()),
                StatusCode::BAD_REQUEST | StatusCode::PRECONDITION_FAILED => {
                    TokenError::signing(crate::oauth2::error_message(&body))
                }
                other => status_error(BACKEND, other, &body),
            });
        }

        let parsed: AsymmetricSignResponse = response
            .json()
            .await
            .map_err(|e| TokenError::malformed(BACKEND, e.to_string()))?;
        let signature = parsed
            .signature
            .ok_or_else(|| TokenError::malformed(BACKEND, "missing signature"))?;
        let signature = STANDARD
            .decode(signature)
            .map_err(|e| TokenError::malformed(BACKEND, format!("signature is not base64: {e}")))?;

        debug!(bytes = signature.len(), "KMS signature received");
        to_jws_signature(self.algorithm, signature)
    }

    async fn close(&mut self) -> TokenResult<()> {
        self.authorization = None;
        Ok(())
    }
}

/// KMS returns ECDSA signatures DER encoded; JWS wants fixed-width `r || s`.
fn to_jws_signature(algorithm: SigningAlgorithm, signature: Vec<u8>) -> TokenResult<Vec<u8>> {
    match algorithm {
        SigningAlgorithm::RS256 | SigningAlgorithm::PS256 => Ok(signature),
        SigningAlgorithm::ES256 => p256::ecdsa::Signature::from_der(&signature)
            .map(|sig| sig.to_bytes().to_vec())
            .map_err(|e| TokenError::malformed(BACKEND, format!("invalid ECDSA signature: {e}"))),
    }
}
