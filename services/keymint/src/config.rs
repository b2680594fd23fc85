//! Bootstrap configuration for the `keymint` binary.
//!
//! Everything is read from `KEYMINT_*` environment variables (a `.env` file
//! is honoured) and validated before any backend is touched.

use crate::error::{TokenError, TokenResult};
use crate::jwt::{SigningAlgorithm, DEFAULT_LIFETIME};
use crate::signer::{HardwareConfig, KmsConfig, SoftwareModule};
use crate::source::{
    AccessBoundaryRule, BackendConfig, DownscopeConfig, ImpersonationConfig, SigningSourceConfig,
    TokenFlavor, VaultConfig,
};
use crate::token::{StaticTokenSource, TokenSource};
use chrono::Utc;
use keymint_common::TracingConfig;
use secrecy::SecretString;
use std::env;
use std::sync::Arc;
use std::time::Duration;

/// Default device path of the kernel TPM resource manager.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/tpmrm0";

/// Binary configuration.
#[derive(Debug)]
pub struct Config {
    /// Selected backend
    pub backend: BackendConfig,
    /// Logging setup
    pub tracing: TracingConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ConfigInvalid`] if required variables are
    /// missing or invalid.
    pub fn from_env() -> TokenResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ConfigInvalid`] if required variables are
    /// missing or invalid.
    pub fn from_lookup<F>(lookup: F) -> TokenResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let mut tracing = TracingConfig::default()
            .with_log_level(vars.get("KEYMINT_LOG_LEVEL").unwrap_or_else(|| "info".to_string()));
        if vars.parse("KEYMINT_LOG_JSON", false)? {
            tracing = tracing.with_json_output();
        }

        let backend = match vars.required("KEYMINT_BACKEND")?.to_lowercase().as_str() {
            "software" => software(&vars)?,
            "hardware" | "tpm" => {
                return Err(TokenError::config(
                    "no security device driver is built into this binary; construct \
                     BackendConfig::Hardware with a SecurityModule for the device, or use \
                     KEYMINT_BACKEND=software on machines without one",
                ))
            }
            "kms" | "cloud-kms" => cloud_kms(&vars)?,
            "vault" => BackendConfig::SecretEngine(vault(&vars)?),
            "impersonation" | "impersonate" => BackendConfig::Impersonation {
                config: impersonation(&vars)?,
                caller: caller(&vars)?,
            },
            "downscope" | "sts" => BackendConfig::Downscope {
                config: downscope(&vars)?,
                root: caller(&vars)?,
            },
            other => return Err(TokenError::config(format!("unknown KEYMINT_BACKEND: {other}"))),
        };

        Ok(Self { backend, tracing })
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, name: &str) -> TokenResult<String> {
        self.get(name)
            .ok_or_else(|| TokenError::config(format!("{name} is required")))
    }

    /// Parse variable with default value.
    fn parse<T: std::str::FromStr>(&self, name: &str, default: T) -> TokenResult<T>
    where
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            Some(val) => val
                .parse()
                .map_err(|e| TokenError::config(format!("Invalid {name}: {e}"))),
            None => Ok(default),
        }
    }

    fn list(&self, name: &str) -> Vec<String> {
        self.get(name)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lifetime(&self) -> TokenResult<Duration> {
        Ok(Duration::from_secs(
            self.parse("KEYMINT_LIFETIME", DEFAULT_LIFETIME.as_secs())?,
        ))
    }
}

fn signing_source<F>(vars: &Vars<'_, F>) -> TokenResult<SigningSourceConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let scopes = vars.list("KEYMINT_SCOPES");
    let flavor = if scopes.is_empty() {
        TokenFlavor::SelfSignedJwt
    } else {
        TokenFlavor::ExchangedAccessToken { scopes }
    };

    let mut config = SigningSourceConfig::new(
        vars.required("KEYMINT_EMAIL")?,
        vars.get("KEYMINT_AUDIENCE").unwrap_or_default(),
    )
    .with_flavor(flavor)
    .with_lifetime(vars.lifetime()?);
    if let Some(subject) = vars.get("KEYMINT_SUBJECT") {
        config = config.with_subject(subject);
    }
    if let Some(key_id) = vars.get("KEYMINT_KEY_ID") {
        config = config.with_key_id(key_id);
    }
    if let Some(token_url) = vars.get("KEYMINT_TOKEN_URL") {
        config = config.with_token_url(token_url);
    }
    config.validate()?;
    Ok(config)
}

/// Accepts `0x81008001` or plain decimal.
fn persistent_handle(value: &str) -> TokenResult<u32> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| TokenError::config(format!("Invalid KEYMINT_PERSISTENT_HANDLE: {e}")))
}

/// Device-shaped signing with an RSA key loaded from a PEM file into
/// [`SoftwareModule`]. The key is on disk, so this is for development and
/// tests only.
fn software<F>(vars: &Vars<'_, F>) -> TokenResult<BackendConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let handle = persistent_handle(&vars.required("KEYMINT_PERSISTENT_HANDLE")?)?;
    let device_path = vars
        .get("KEYMINT_DEVICE_PATH")
        .unwrap_or_else(|| DEFAULT_DEVICE_PATH.to_string());
    let signer = HardwareConfig::new(device_path, handle);
    signer.validate()?;

    let module = SoftwareModule::new().with_pem_file(handle, vars.required("KEYMINT_SOFTWARE_KEY_FILE")?)?;

    Ok(BackendConfig::Hardware {
        signer,
        token: signing_source(vars)?,
        module: Arc::new(module),
    })
}

fn cloud_kms<F>(vars: &Vars<'_, F>) -> TokenResult<BackendConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut signer = KmsConfig::new(vars.required("KEYMINT_KMS_KEY")?);
    if let Some(algorithm) = vars.get("KEYMINT_KMS_ALGORITHM") {
        signer = match SigningAlgorithm::parse(&algorithm) {
            Ok(algorithm) => signer.with_algorithm(algorithm),
            Err(_) => signer.with_kms_algorithm(&algorithm)?,
        };
    }
    if let Some(endpoint) = vars.get("KEYMINT_KMS_ENDPOINT") {
        signer = signer.with_endpoint(endpoint);
    }
    signer.validate()?;

    Ok(BackendConfig::CloudKms {
        signer,
        token: signing_source(vars)?,
        caller: caller(vars)?,
    })
}

fn vault<F>(vars: &Vars<'_, F>) -> TokenResult<VaultConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = VaultConfig::new(
        vars.required("KEYMINT_VAULT_ADDR")?,
        vars.required("KEYMINT_VAULT_PATH")?,
        SecretString::from(vars.required("KEYMINT_VAULT_TOKEN")?),
    )
    .with_timeout(Duration::from_secs(vars.parse("KEYMINT_VAULT_TIMEOUT", 30)?));
    if let Some(ca_cert) = vars.get("KEYMINT_VAULT_CACERT") {
        config = config.with_ca_cert(ca_cert);
    }
    config.validate()?;
    Ok(config)
}

fn impersonation<F>(vars: &Vars<'_, F>) -> TokenResult<ImpersonationConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ImpersonationConfig::new(
        vars.required("KEYMINT_TARGET_PRINCIPAL")?,
        vars.list("KEYMINT_SCOPES"),
    )
    .with_delegates(vars.list("KEYMINT_DELEGATES"))
    .with_lifetime(vars.lifetime()?);
    if let Some(subject) = vars.get("KEYMINT_SUBJECT") {
        config = config.with_subject(subject);
    }
    if let Some(endpoint) = vars.get("KEYMINT_IAM_ENDPOINT") {
        config = config.with_iam_endpoint(endpoint);
    }
    if let Some(token_url) = vars.get("KEYMINT_TOKEN_URL") {
        config = config.with_token_url(token_url);
    }
    config.validate()?;
    Ok(config)
}

fn downscope<F>(vars: &Vars<'_, F>) -> TokenResult<DownscopeConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let rules: Vec<AccessBoundaryRule> = serde_json::from_str(&vars.required("KEYMINT_ACCESS_BOUNDARY")?)
        .map_err(|e| TokenError::config(format!("Invalid KEYMINT_ACCESS_BOUNDARY: {e}")))?;
    let mut config = DownscopeConfig::new(rules);
    if let Some(endpoint) = vars.get("KEYMINT_STS_ENDPOINT") {
        config = config.with_sts_endpoint(endpoint);
    }
    config.validate()?;
    Ok(config)
}

/// The caller's own credential, for backends that authenticate first.
fn caller<F>(vars: &Vars<'_, F>) -> TokenResult<Arc<dyn TokenSource>>
where
    F: Fn(&str) -> Option<String>,
{
    let expires_in: i64 = vars.parse("KEYMINT_CALLER_TOKEN_EXPIRES_IN", 3600)?;
    let expiry = chrono::Duration::try_seconds(expires_in)
        .filter(|_| expires_in > 0)
        .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
        .ok_or_else(|| {
            TokenError::config(format!(
                "Invalid KEYMINT_CALLER_TOKEN_EXPIRES_IN: {expires_in}s is out of range"
            ))
        })?;
    let source = StaticTokenSource::from_bearer(vars.required("KEYMINT_CALLER_TOKEN")?, expiry)?;
    Ok(Arc::new(source))
}
