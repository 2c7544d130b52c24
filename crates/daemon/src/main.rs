mod config;
mod executor;
mod handlers;
mod paging;
mod server;
mod services;
mod session;
mod store;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Account administration server
#[derive(Debug, Parser)]
#[command(name = "wardend", version)]
struct Args {
    /// Configuration file (default: ~/.config/warden/wardend.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address from the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("wardend=info".parse()?))
        .init();

    let args = Args::parse();
    libwarden::command::verify_registry()?;

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    info!(?config, "config loaded");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(server::run(config))?;

    Ok(())
}
