//! Hardware security module signer.
//!
//! Signs with an RSA key sealed in a security device (TPM or similar) and
//! addressed by a persistent handle. The device is a scarce, often singleton
//! resource: a session is opened only after the digest is ready and is closed
//! before the token is assembled.
//!
//! Device calls block, so they run on tokio's blocking pool. The handle and
//! the signer's gate travel into that work together: if the caller's future
//! is dropped mid-call, the device work still finishes, closes the handle and
//! only then lets the next session open.
//!
//! Exclusivity is per token source instance. Two sources (or two processes)
//! pointed at the same device path are not coordinated here; callers that
//! need that must add their own process-level locking.

use super::{Digest, Signer, SignerSession};
use crate::error::{TokenError, TokenResult};
use crate::jwt::SigningAlgorithm;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, warn};

const BACKEND: &str = "hardware";

/// Persistent key handle inside the device, e.g. `0x81008001`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PersistentHandle(pub u32);

impl fmt::Display for PersistentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Signature scheme requested from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    /// RSASSA-PKCS1-v1_5 over a SHA-256 digest
    RsaSsaPkcs1v15Sha256,
}

/// Errors reported by a security module.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Device could not be opened
    #[error("device unavailable: {0}")]
    Unavailable(String),

    /// Nothing is stored under the persistent handle
    #[error("no key at persistent handle {0}")]
    KeyNotFound(PersistentHandle),

    /// Any other device failure
    #[error("device operation failed: {0}")]
    Operation(String),
}

/// Security device driver: `open(path) -> handle`.
pub trait SecurityModule: Send + Sync {
    /// Open the device at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Unavailable`] if the device cannot be opened.
    fn open(&self, path: &Path) -> Result<Box<dyn ModuleHandle>, DeviceError>;
}

/// Open device handle: `sign(handle, key_ref, digest, scheme)` and `close(handle)`.
pub trait ModuleHandle: Send {
    /// Sign `digest` with the key at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::KeyNotFound`] for an unpopulated handle.
    fn sign(
        &mut self,
        key: PersistentHandle,
        digest: &[u8; 32],
        scheme: SignatureScheme,
    ) -> Result<Vec<u8>, DeviceError>;

    /// Release the device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device reports a failure while closing.
    fn close(self: Box<Self>) -> Result<(), DeviceError>;
}

/// Location of the sealed key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareConfig {
    /// Device path, e.g. `/dev/tpmrm0`
    pub device_path: PathBuf,
    /// Persistent handle of the RSA key
    pub persistent_handle: u32,
}

impl HardwareConfig {
    /// Create a new configuration.
    #[must_use]
    pub fn new(device_path: impl Into<PathBuf>, persistent_handle: u32) -> Self {
        Self {
            device_path: device_path.into(),
            persistent_handle,
        }
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ConfigInvalid`] for an empty path or a zero handle.
    pub fn validate(&self) -> TokenResult<()> {
        if self.device_path.as_os_str().is_empty() {
            return Err(TokenError::config("device path is required"));
        }
        if self.persistent_handle == 0 {
            return Err(TokenError::config("persistent handle is required"));
        }
        Ok(())
    }
}

/// Signer backed by a key sealed in a security device.
pub struct HardwareSigner {
    config: HardwareConfig,
    module: Arc<dyn SecurityModule>,
    gate: Arc<Mutex<()>>,
}

impl HardwareSigner {
    /// Create a signer. Does not touch the device.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ConfigInvalid`] if the configuration is incomplete.
    pub fn new(config: HardwareConfig, module: Arc<dyn SecurityModule>) -> TokenResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            module,
            gate: Arc::new(Mutex::new(())),
        })
    }

    /// Device path this signer opens.
    #[must_use]
    pub fn device_path(&self) -> &Path {
        &self.config.device_path
    }

    fn device_error(path: &Path, err: DeviceError) -> TokenError {
        match err {
            DeviceError::Unavailable(reason) => TokenError::DeviceUnavailable {
                path: path.display().to_string(),
                reason,
            },
            DeviceError::KeyNotFound(handle) => {
                TokenError::KeyNotFound(format!("persistent handle {handle}"))
            }
            DeviceError::Operation(reason) => TokenError::signing(reason),
        }
    }
}

#[async_trait]
impl Signer for HardwareSigner {
    fn algorithm(&self) -> SigningAlgorithm {
        SigningAlgorithm::RS256
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }

    #[instrument(skip(self), fields(device = %self.config.device_path.display()))]
    async fn open(&self) -> TokenResult<Box<dyn SignerSession>> {
        // Held until the handle is closed, even by a blocking task whose
        // caller has gone away.
        let gate = Arc::clone(&self.gate).lock_owned().await;
        let module = Arc::clone(&self.module);
        let path = self.config.device_path.clone();

        let device = tokio::task::spawn_blocking(move || {
            let handle = module.open(&path)?;
            Ok::<_, DeviceError>(OpenDevice {
                handle: Some(handle),
                path,
                _gate: gate,
            })
        })
        .await
        .map_err(|e| TokenError::Internal(format!("device open task failed: {e}")))?
        .map_err(|e| Self::device_error(&self.config.device_path, e))?;

        debug!("security device opened");
        Ok(Box::new(HardwareSession {
            device: Some(device),
            key: PersistentHandle(self.config.persistent_handle),
            path: self.config.device_path.clone(),
        }))
    }
}

/// An open handle together with the signer's gate.
///
/// Moves into every blocking device call. Dropping it closes the handle and
/// only then releases the gate, so the next `open` waits for a cancelled
/// call's device work to finish.
struct OpenDevice {
    handle: Option<Box<dyn ModuleHandle>>,
    path: PathBuf,
    _gate: OwnedMutexGuard<()>,
}

impl OpenDevice {
    fn sign(&mut self, key: PersistentHandle, digest: &[u8; 32]) -> Result<Vec<u8>, DeviceError> {
        match self.handle.as_mut() {
            Some(handle) => handle.sign(key, digest, SignatureScheme::RsaSsaPkcs1v15Sha256),
            None => Err(DeviceError::Operation("device already closed".to_string())),
        }
    }

    fn close(mut self) -> Result<(), DeviceError> {
        self.handle.take().map_or(Ok(()), |handle| handle.close())
    }
}

impl Drop for OpenDevice {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.close() {
                warn!(device = %self.path.display(), error = %e, "failed to close security device");
            }
        }
    }
}

struct HardwareSession {
    device: Option<OpenDevice>,
    key: PersistentHandle,
    path: PathBuf,
}

#[async_trait]
impl SignerSession for HardwareSession {
    async fn sign(&mut self, digest: &Digest) -> TokenResult<Vec<u8>> {
        let mut device = self
            .device
            .take()
            .ok_or_else(|| TokenError::signing("device session already closed"))?;
        let key = self.key;
        let digest = *digest.as_bytes();

        let (device, result) = tokio::task::spawn_blocking(move || {
            let result = device.sign(key, &digest);
            (device, result)
        })
        .await
        .map_err(|e| TokenError::Internal(format!("device sign task failed: {e}")))?;

        self.device = Some(device);
        result.map_err(|e| HardwareSigner::device_error(&self.path, e))
    }

    async fn close(&mut self) -> TokenResult<()> {
        let Some(device) = self.device.take() else {
            return Ok(());
        };

        tokio::task::spawn_blocking(move || device.close())
            .await
            .map_err(|e| TokenError::Internal(format!("device close task failed: {e}")))?
            .map_err(|e| HardwareSigner::device_error(&self.path, e))?;

        debug!(device = %self.path.display(), "security device closed");
        Ok(())
    }
}
