//! Token sources, one per backend.
//!
//! Every source owns a [`SerializedAccess`]: a FIFO async mutex held for the
//! whole backend round trip. At most one signing or exchange call per
//! instance is in flight, and the guard is released on every exit path,
//! including errors and cancellation of the calling future.

pub mod downscope;
pub mod factory;
pub mod impersonate;
pub mod signing;
pub mod vault;

pub use downscope::{AccessBoundaryRule, AvailabilityCondition, DownscopeConfig, DownscopedTokenSource};
pub use factory::{BackendConfig, TokenSourceFactory};
pub use impersonate::{ImpersonatedTokenSource, ImpersonationConfig};
pub use signing::{SigningSourceConfig, SigningTokenSource, TokenFlavor};
pub use vault::{VaultConfig, VaultTokenSource};

use crate::error::TokenResult;
use crate::metrics::TokenMetrics;
use crate::token::Token;
use std::future::Future;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::debug;

/// OAuth2 token endpoint used for jwt-bearer exchanges.
pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Serialization point for one token source instance.
pub(crate) struct SerializedAccess {
    lock: Mutex<()>,
    backend: &'static str,
    metrics: TokenMetrics,
}

impl SerializedAccess {
    pub(crate) fn new(backend: &'static str) -> Self {
        Self {
            lock: Mutex::new(()),
            backend,
            metrics: TokenMetrics::new(),
        }
    }

    pub(crate) const fn metrics(&self) -> &TokenMetrics {
        &self.metrics
    }

    /// Run `call` while holding the instance lock.
    pub(crate) async fn run<F, Fut>(&self, call: F) -> TokenResult<Token>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = TokenResult<Token>> + Send,
    {
        let started = Instant::now();
        let _guard = self.lock.lock().await;
        let waited = started.elapsed();
        self.metrics.record_lock_wait(self.backend, waited);
        debug!(backend = self.backend, waited = ?waited, "token lock acquired");

        let result = call().await;
        self.metrics
            .record_request(self.backend, result.is_ok(), started.elapsed());
        result
    }
}
