//! dnstcp client
//!
//! Forwards local TCP connections (or stdin/stdout) through DNS queries to a
//! dnstcp relay.

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use dnstcp::{Client, ClientConfig};

#[derive(Parser)]
#[command(name = "dnstcp-client")]
#[command(author = "Sina Rabbani")]
#[command(version)]
#[command(about = "TCP over DNS tunnel client", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Zone delegated to the relay
    #[arg(short = 'z', long)]
    domain: Option<String>,

    /// Pre-shared key
    #[arg(short, long, env = "DNSTCP_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Seconds to wait for an answer before resending (1-240)
    #[arg(short = 't', long, value_name = "SECS")]
    conn_timeout: Option<u64>,

    /// Local UDP port to send queries from
    #[arg(short = 'b', long, value_name = "PORT")]
    bind_port: Option<u16>,

    /// Idle poll period, e.g. "200ms"
    #[arg(long, value_parser = humantime::parse_duration)]
    poll_interval: Option<Duration>,

    /// Local forwarding: listen on lport, relay connects to host:rport ("-" as lport for stdin)
    #[arg(short = 'L', long = "local", value_name = "LPORT:HOST:RPORT", conflicts_with = "remote", allow_hyphen_values = true)]
    local: Option<String>,

    /// Remote forwarding: relay binds lport, peers are joined to host:rport
    #[arg(short = 'R', long = "remote", value_name = "LPORT:HOST:RPORT")]
    remote: Option<String>,

    /// Single session over stdin/stdout
    #[arg(long)]
    stdin: bool,

    /// Debug level (0 = info, 1 = debug, 2 = trace)
    #[arg(short, long, default_value_t = 0)]
    debug: u8,

    /// DNS server (address or address:port), from /etc/resolv.conf when omitted
    server: Option<String>,
}

fn parse_server(server: &str) -> Result<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip: IpAddr = server
        .parse()
        .with_context(|| format!("Invalid DNS server {:?}", server))?;
    Ok(SocketAddr::new(ip, 53))
}

fn init_logger(level: u8) {
    let filter = match level {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.debug);

    let mut config = match &cli.config {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => ClientConfig::default(),
    };

    if let Some(domain) = cli.domain {
        config.domain = domain;
    }
    if let Some(key) = cli.key {
        config.key = Some(key);
    }
    if let Some(secs) = cli.conn_timeout {
        config.conn_timeout = Duration::from_secs(secs);
    }
    if let Some(port) = cli.bind_port {
        config.udp_port_bind = Some(port);
    }
    if let Some(interval) = cli.poll_interval {
        config.poll_interval = interval;
    }
    if let Some(spec) = &cli.local {
        config.set_forward(spec, true).map_err(anyhow::Error::msg)?;
    }
    if let Some(spec) = &cli.remote {
        config.set_forward(spec, false).map_err(anyhow::Error::msg)?;
    }
    if cli.stdin {
        config.use_stdin = true;
    }
    if let Some(server) = &cli.server {
        config.dns_server = Some(parse_server(server)?);
    }

    if let Err(e) = config.validate() {
        bail!("Invalid configuration: {}", e);
    }

    info!(
        "dnstcp client {}: zone {}, resource {}",
        env!("CARGO_PKG_VERSION"),
        config.domain,
        config.resource()
    );

    let client = Client::new(config)
        .await
        .context("Failed to start client")?;
    client.run().await.context("Client stopped")?;
    Ok(())
}
