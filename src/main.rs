use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use moisture_daemon::{config::Config, supervisor};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env (ignore error if file absent — env vars may be set externally)
    let _ = dotenvy::dotenv();

    // Initialise tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    // Invalid configuration is fatal before anything connects.
    let config = Config::from_env().context("configuration")?;
    config.log();

    // A clean deadline or signal shutdown exits 0; an unrecoverable
    // connection or setup failure propagates and exits non-zero for the
    // scheduler to notice.
    supervisor::run(config).await.context("invocation failed")?;
    Ok(())
}
