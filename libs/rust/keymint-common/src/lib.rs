//! Shared plumbing for keymint token backends.
//!
//! This crate provides:
//! - HTTP client configuration and building (rustls, timeouts, private CAs)
//! - Tracing subscriber initialization

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod http;
pub mod tracing_config;

pub use http::{build_http_client, HttpConfig, HttpConfigError, DEFAULT_USER_AGENT};
pub use tracing_config::{init_tracing, TracingConfig};
