//! Keymint library.
//!
//! Mints short-lived OAuth2 bearer tokens whose signing keys never leave a
//! protected keystore: a security device, Cloud KMS, a Vault secret engine or
//! an impersonated service account. Downscoped exchange of an existing token
//! is offered through the same [`TokenSource`] contract.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod jwt;
pub mod metrics;
pub mod oauth2;
pub mod signer;
pub mod source;
pub mod token;

// Re-exports for convenience
pub use config::Config;
pub use error::{ErrorClass, TokenError, TokenResult};
pub use source::{BackendConfig, TokenSourceFactory};
pub use token::{Clock, FixedClock, StaticTokenSource, SystemClock, Token, TokenSource};
