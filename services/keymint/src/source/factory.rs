//! Token source factory.

use super::{
    DownscopeConfig, DownscopedTokenSource, ImpersonatedTokenSource, ImpersonationConfig,
    SigningSourceConfig, SigningTokenSource, VaultConfig, VaultTokenSource,
};
use crate::error::TokenResult;
use crate::signer::{CloudKmsSigner, HardwareConfig, HardwareSigner, KmsConfig, SecurityModule};
use crate::token::TokenSource;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Backend selection with everything needed to build its source.
///
/// The secret-engine and downscope variants return server-issued tokens; the
/// others sign claims built locally.
pub enum BackendConfig {
    /// Key sealed in a security device
    Hardware {
        /// Device location
        signer: HardwareConfig,
        /// Claims and flavor
        token: SigningSourceConfig,
        /// Device driver
        module: Arc<dyn SecurityModule>,
    },
    /// Cloud KMS key version
    CloudKms {
        /// Key version
        signer: KmsConfig,
        /// Claims and flavor
        token: SigningSourceConfig,
        /// Credential for the KMS API
        caller: Arc<dyn TokenSource>,
    },
    /// Vault secret engine
    SecretEngine(VaultConfig),
    /// Service account impersonation
    Impersonation {
        /// Target and delegation chain
        config: ImpersonationConfig,
        /// Credential of the acting principal
        caller: Arc<dyn TokenSource>,
    },
    /// Downscoped exchange of a root token
    Downscope {
        /// Access boundary
        config: DownscopeConfig,
        /// Source of the root token
        root: Arc<dyn TokenSource>,
    },
}

impl BackendConfig {
    /// Short backend name.
    #[must_use]
    pub const fn backend(&self) -> &'static str {
        match self {
            Self::Hardware { .. } => "hardware",
            Self::CloudKms { .. } => "cloud-kms",
            Self::SecretEngine(_) => "vault",
            Self::Impersonation { .. } => "impersonation",
            Self::Downscope { .. } => "sts",
        }
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hardware { signer, token, .. } => f
                .debug_struct("Hardware")
                .field("signer", signer)
                .field("token", token)
                .finish_non_exhaustive(),
            Self::CloudKms { signer, token, .. } => f
                .debug_struct("CloudKms")
                .field("signer", signer)
                .field("token", token)
                .finish_non_exhaustive(),
            Self::SecretEngine(config) => f.debug_tuple("SecretEngine").field(config).finish(),
            Self::Impersonation { config, .. } => f
                .debug_struct("Impersonation")
                .field("config", config)
                .finish_non_exhaustive(),
            Self::Downscope { config, .. } => f
                .debug_struct("Downscope")
                .field("config", config)
                .finish_non_exhaustive(),
        }
    }
}

/// Factory for token sources.
pub struct TokenSourceFactory;

impl TokenSourceFactory {
    /// Build the token source for `config`.
    ///
    /// Only validates; no device is opened and no request is sent.
    ///
    /// # Errors
    ///
    /// Returns [`crate::TokenError::ConfigInvalid`] for an invalid configuration.
    pub fn create(config: BackendConfig) -> TokenResult<Arc<dyn TokenSource>> {
        let backend = config.backend();
        let source: Arc<dyn TokenSource> = match config {
            BackendConfig::Hardware {
                signer,
                token,
                module,
            } => Arc::new(SigningTokenSource::new(token, HardwareSigner::new(signer, module)?)?),
            BackendConfig::CloudKms {
                signer,
                token,
                caller,
            } => Arc::new(SigningTokenSource::new(token, CloudKmsSigner::new(signer, caller)?)?),
            BackendConfig::SecretEngine(config) => Arc::new(VaultTokenSource::new(config)?),
            BackendConfig::Impersonation { config, caller } => {
                Arc::new(ImpersonatedTokenSource::new(config, caller)?)
            }
            BackendConfig::Downscope { config, root } => {
                Arc::new(DownscopedTokenSource::new(config, root)?)
            }
        };
        info!(backend, "token source created");
        Ok(source)
    }
}
