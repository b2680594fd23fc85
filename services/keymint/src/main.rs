//! Mint one token from `KEYMINT_*` configuration and print it as JSON.

use anyhow::Context;
use keymint::{Config, TokenSourceFactory};
use keymint_common::init_tracing;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    init_tracing(&config.tracing);

    let backend = config.backend.backend();
    info!(backend, "Starting keymint");

    let source = TokenSourceFactory::create(config.backend).context("invalid backend configuration")?;
    let token = match source.token().await {
        Ok(token) => token,
        Err(e) => {
            error!(backend, error = %e, retryable = e.is_retryable(), "token request failed");
            return Err(e).context("unable to mint token");
        }
    };

    info!(backend, expiry = %token.expiry(), "token minted");
    println!("{}", serde_json::to_string_pretty(&token)?);
    Ok(())
}
