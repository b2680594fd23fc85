//! Self-signed JWT construction: claim building and compact assembly.

pub mod assembler;
pub mod builder;
pub mod claims;

pub use assembler::{assemble, signing_input};
pub use builder::{ClaimBuilder, EncodedJwt, DEFAULT_LIFETIME};
pub use claims::{ClaimSet, Header, SigningAlgorithm};
