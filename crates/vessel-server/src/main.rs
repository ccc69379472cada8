//! vessel-server: remote job execution service.
//!
//! # Usage
//!
//! ```bash
//! # Defaults from ~/.config/vessel/server.toml, listening on 127.0.0.1:50001
//! vessel-server
//!
//! # Explicit config and address
//! vessel-server --config ./server.toml --listen 0.0.0.0:7000
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use vessel_kernel::Service;
use vessel_server::ServerConfig;
use vessel_server::front;

struct Args {
    config: Option<PathBuf>,
    listen: Option<String>,
}

fn parse_args() -> Result<Option<Args>> {
    let mut args = Args {
        config: None,
        listen: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                args.config = Some(iter.next().context("--config needs a path")?.into());
            }
            "-l" | "--listen" => {
                args.listen = Some(iter.next().context("--listen needs an address")?);
            }
            "-h" | "--help" => {
                println!("Usage: vessel-server [--config PATH] [--listen ADDR]");
                return Ok(None);
            }
            "-V" | "--version" => {
                println!("vessel-server {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            other => bail!("unknown argument: {}", other),
        }
    }
    Ok(Some(args))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::from_default_env()
                .add_directive("vessel_server=info".parse()?)
                .add_directive("vessel_kernel=info".parse()?),
        )
        .init();

    let Some(args) = parse_args()? else {
        return Ok(());
    };

    let mut config = match &args.config {
        Some(path) => ServerConfig::load_from(path)?,
        None => ServerConfig::load().context("Failed to load configuration")?,
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    let settings = config.settings()?;

    tracing::info!(
        "Server config: listen={}, cache_dir={}, bridge_slots={}",
        config.listen,
        settings.cache_dir.display(),
        settings.bridge_slots
    );

    let service = Service::new(settings);
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received");
                shutdown.cancel();
            }
        });
    }

    front::serve(listener, service.clone(), shutdown).await?;
    service.shutdown();
    Ok(())
}
