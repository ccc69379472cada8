//! vessel-agent: worker process launched by a bridge.
//!
//! Speaks the control protocol on stdin/stdout. Never write anything else
//! to stdout.

use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("vessel_server=warn".parse()?))
        .init();

    tracing::debug!(pid = std::process::id(), "agent starting");
    vessel_server::agent::serve(tokio::io::stdin(), tokio::io::stdout()).await
}
