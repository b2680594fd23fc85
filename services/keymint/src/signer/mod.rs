//! Signing backends.
//!
//! A [`Signer`] describes a key held by some keystore and opens a
//! [`SignerSession`] against it. Sessions are opened as late as possible and
//! closed on every exit path by the token source; they are never kept
//! between calls.

pub mod hardware;
pub mod kms;
pub mod software;

pub use hardware::{
    DeviceError, HardwareConfig, HardwareSigner, ModuleHandle, PersistentHandle, SecurityModule,
    SignatureScheme,
};
pub use kms::{CloudKmsSigner, KmsConfig};
pub use software::SoftwareModule;

use crate::error::TokenResult;
use crate::jwt::SigningAlgorithm;
use async_trait::async_trait;
use sha2::{Digest as _, Sha256};

/// SHA-256 digest of a signing input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Hash `data` with SHA-256.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Wrap an existing 32-byte digest.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// A key that never leaves its keystore.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Algorithm matching the key type.
    fn algorithm(&self) -> SigningAlgorithm;

    /// Short backend name for logs and metrics.
    fn backend(&self) -> &'static str;

    /// Acquire the keystore resource.
    ///
    /// # Errors
    ///
    /// Returns a resource-unavailable error if the device or service cannot
    /// be reached.
    async fn open(&self) -> TokenResult<Box<dyn SignerSession>>;
}

/// An open handle to a keystore.
#[async_trait]
pub trait SignerSession: Send {
    /// Sign a digest, returning raw signature bytes in JWS form.
    async fn sign(&mut self, digest: &Digest) -> TokenResult<Vec<u8>>;

    /// Release the resource. Further calls to `sign` fail.
    async fn close(&mut self) -> TokenResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_of_empty_input() {
        let digest = Digest::of(b"");
        assert_eq!(
            digest.as_bytes()[..4],
            [0xe3, 0xb0, 0xc4, 0x42],
            "SHA-256 of empty input starts with e3b0c442"
        );
    }

    #[test]
    fn test_digest_round_trip() {
        let digest = Digest::of(b"header.claims");
        assert_eq!(Digest::from_bytes(*digest.as_bytes()), digest);
    }
}
