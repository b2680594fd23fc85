//! Compact serialization of signed tokens.
//!
//! Header and claims segments use padded URL-safe base64 while the signature
//! segment is unpadded. The identity provider verifies exactly these bytes, so
//! the asymmetry must be kept.

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;

/// The bytes that get hashed and signed: `b64(header) "." b64(claims)`.
#[must_use]
pub fn signing_input(header: &[u8], claims: &[u8]) -> String {
    format!("{}.{}", URL_SAFE.encode(header), URL_SAFE.encode(claims))
}

/// Join header, claims and signature into the bearer string.
#[must_use]
pub fn assemble(header: &[u8], claims: &[u8], signature: &[u8]) -> String {
    format!(
        "{}.{}",
        signing_input(header, claims),
        URL_SAFE_NO_PAD.encode(signature)
    )
}
