//! HTTP client construction for the remote token backends.
//!
//! Cloud KMS, Vault, IAM credentials and STS calls all go through a
//! `reqwest` client built here, so timeouts, the user agent and any private
//! certificate authority are configured in one place.

use reqwest::{Certificate, Client, ClientBuilder};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default user agent sent with every backend request.
pub const DEFAULT_USER_AGENT: &str = concat!("keymint/", env!("CARGO_PKG_VERSION"));

/// Errors raised while preparing an HTTP client.
#[derive(Error, Debug)]
pub enum HttpConfigError {
    /// The CA bundle file could not be read.
    #[error("unable to read CA certificate {path}: {source}")]
    CaCertificateRead {
        /// Path that was read
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The CA bundle was not valid PEM.
    #[error("invalid CA certificate: {0}")]
    InvalidCaCertificate(#[source] reqwest::Error),

    /// The client builder rejected the configuration.
    #[error("unable to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
}

/// HTTP client configuration for backend calls.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Whole-request timeout (default: 30s)
    pub timeout: Duration,
    /// Connection timeout (default: 10s)
    pub connect_timeout: Duration,
    /// User agent string
    pub user_agent: String,
    /// Extra trusted root certificate in PEM form, e.g. a private Vault CA
    pub root_ca_pem: Option<Vec<u8>>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            root_ca_pem: None,
        }
    }
}

impl HttpConfig {
    /// Set the request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Trust an additional root certificate given as PEM bytes.
    #[must_use]
    pub fn with_root_ca_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.root_ca_pem = Some(pem.into());
        self
    }

    /// Trust an additional root certificate read from a PEM file.
    ///
    /// # Errors
    ///
    /// Returns [`HttpConfigError::CaCertificateRead`] if the file cannot be read.
    pub fn with_root_ca_file(self, path: impl AsRef<Path>) -> Result<Self, HttpConfigError> {
        let path = path.as_ref();
        let pem = std::fs::read(path).map_err(|source| HttpConfigError::CaCertificateRead {
            path: path.display().to_string(),
            source,
        })?;
        Ok(self.with_root_ca_pem(pem))
    }
}

/// Build a configured HTTP client with rustls.
///
/// # Errors
///
/// Returns an error if the extra CA certificate is not valid PEM or the
/// client cannot be built.
///
/// # Examples
///
/// ```
/// use keymint_common::{build_http_client, HttpConfig};
/// use std::time::Duration;
///
/// let config = HttpConfig::default().with_timeout(Duration::from_secs(5));
/// let client = build_http_client(&config).expect("client");
/// # drop(client);
/// ```
pub fn build_http_client(config: &HttpConfig) -> Result<Client, HttpConfigError> {
    let mut builder = ClientBuilder::new()
        .timeout(config.timeout)
        .connect_timeout(config.connect_timeout)
        .user_agent(&config.user_agent)
        .use_rustls_tls();

    if let Some(pem) = &config.root_ca_pem {
        let cert = Certificate::from_pem(pem).map_err(HttpConfigError::InvalidCaCertificate)?;
        builder = builder.add_root_certificate(cert);
    }

    builder.build().map_err(HttpConfigError::Build)
}
