//! In-process security module.
//!
//! Holds RSA keys in memory under persistent handles and behaves like a
//! device: `open` fails when the device path is absent, and signing uses
//! RSASSA-PKCS1-v1_5 over the supplied SHA-256 digest. Meant for development
//! machines without a TPM and for tests.

use super::hardware::{DeviceError, ModuleHandle, PersistentHandle, SecurityModule, SignatureScheme};
use crate::error::{TokenError, TokenResult};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Software stand-in for a security device.
#[derive(Clone, Default)]
pub struct SoftwareModule {
    keys: HashMap<PersistentHandle, Arc<RsaPrivateKey>>,
}

impl SoftwareModule {
    /// Create an empty module.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `key` under `handle`.
    #[must_use]
    pub fn with_key(mut self, handle: u32, key: RsaPrivateKey) -> Self {
        self.keys.insert(PersistentHandle(handle), Arc::new(key));
        self
    }

    /// Store a PEM encoded (PKCS#8 or PKCS#1) RSA key under `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ConfigInvalid`] if the PEM cannot be parsed.
    pub fn with_pem(self, handle: u32, pem: &str) -> TokenResult<Self> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| TokenError::config(format!("invalid RSA private key: {e}")))?;
        Ok(self.with_key(handle, key))
    }

    /// Load a PEM key file and store it under `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ConfigInvalid`] if the file cannot be read or parsed.
    pub fn with_pem_file(self, handle: u32, path: impl AsRef<Path>) -> TokenResult<Self> {
        let path = path.as_ref();
        let pem = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
            TokenError::config(format!("unable to read key file {}: {e}", path.display()))
        })?);
        self.with_pem(handle, &pem)
    }

    /// Public half of the key stored at `handle`.
    #[must_use]
    pub fn public_key(&self, handle: u32) -> Option<RsaPublicKey> {
        self.keys
            .get(&PersistentHandle(handle))
            .map(|key| key.to_public_key())
    }
}

impl SecurityModule for SoftwareModule {
    fn open(&self, path: &Path) -> Result<Box<dyn ModuleHandle>, DeviceError> {
        if !path.exists() {
            return Err(DeviceError::Unavailable(format!(
                "{} does not exist",
                path.display()
            )));
        }
        Ok(Box::new(SoftwareHandle {
            keys: self.keys.clone(),
        }))
    }
}

struct SoftwareHandle {
    keys: HashMap<PersistentHandle, Arc<RsaPrivateKey>>,
}

impl ModuleHandle for SoftwareHandle {
    fn sign(
        &mut self,
        key: PersistentHandle,
        digest: &[u8; 32],
        scheme: SignatureScheme,
    ) -> Result<Vec<u8>, DeviceError> {
        let private_key = self.keys.get(&key).ok_or(DeviceError::KeyNotFound(key))?;
        match scheme {
            SignatureScheme::RsaSsaPkcs1v15Sha256 => private_key
                .sign(Pkcs1v15Sign::new::<Sha256>(), digest)
                .map_err(|e| DeviceError::Operation(e.to_string())),
        }
    }

    fn close(self: Box<Self>) -> Result<(), DeviceError> {
        Ok(())
    }
}
