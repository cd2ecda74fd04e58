//! dnstcp relay
//!
//! Answers tunnel queries for its zone and forwards each session's stream to
//! the resource the client asked for.

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::UdpSocket;

use dnstcp::{Relay, RelayConfig};

#[derive(Parser)]
#[command(name = "dnstcp-server")]
#[command(author = "Sina Rabbani")]
#[command(version)]
#[command(about = "TCP over DNS tunnel relay", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Zone this relay is authoritative for
    #[arg(short = 'z', long)]
    domain: Option<String>,

    /// Pre-shared key
    #[arg(short, long, env = "DNSTCP_KEY", hide_env_values = true)]
    key: Option<String>,

    /// UDP address to answer on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Debug level (0 = info, 1 = debug, 2 = trace)
    #[arg(short, long, default_value_t = 0)]
    debug: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.debug {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(filter)
        .init();

    let mut config = match &cli.config {
        Some(path) => RelayConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => RelayConfig::default(),
    };

    if let Some(domain) = cli.domain {
        config.domain = domain;
    }
    if let Some(key) = cli.key {
        config.key = Some(key);
    }
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    if let Err(e) = config.validate() {
        bail!("Invalid configuration: {}", e);
    }
    if config.key().is_none() {
        info!("No key set: any client may log in");
    }

    let socket = UdpSocket::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;

    Relay::new(&config).run(socket).await.context("Relay stopped")?;
    Ok(())
}
