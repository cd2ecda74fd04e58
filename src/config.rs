//! dnstcp configuration
//!
//! Both sides load from TOML and are then overridden by command-line flags:
//!
//! ```toml
//! domain = "tunnel.example.com"
//! key = "secret"
//! conn_timeout = "3s"
//! ```

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::dns::{self, DnsCodec};
use crate::packet::Packet;

/// Where to look for a nameserver when none is configured
pub const RESOLV_CONF: &str = "/etc/resolv.conf";

const DNS_PORT: u16 = 53;
const MIN_CONN_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_CONN_TIMEOUT: Duration = Duration::from_secs(240);

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// DNS server to send queries to, from resolv.conf when unset
    pub dns_server: Option<SocketAddr>,

    /// Local UDP port for queries, any free port when unset
    pub udp_port_bind: Option<u16>,

    /// Zone delegated to the relay
    pub domain: String,

    /// Pre-shared key for the login challenge
    pub key: Option<String>,

    /// How long to wait for an answer before resending
    #[serde(with = "humantime_serde")]
    pub conn_timeout: Duration,

    /// Idle poll period while waiting for relay data
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// `-L` (true) or `-R` (false)
    pub is_local_port_forwarding: bool,

    /// `-L`: port listened on locally. `-R`: port bound on the relay.
    pub local_port: Option<u16>,

    /// `-L`: host the relay connects to. `-R`: host connected to locally.
    pub remote_host: String,
    pub remote_port: u16,

    /// One session over stdin/stdout instead of a local listener
    pub use_stdin: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            dns_server: None,
            udp_port_bind: None,
            domain: String::new(),
            key: None,
            conn_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(200),
            is_local_port_forwarding: true,
            local_port: None,
            remote_host: String::new(),
            remote_port: 0,
            use_stdin: false,
        }
    }
}

impl ClientConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Apply an `lport:host:rport` forwarding spec
    ///
    /// `-` as the local port selects stdin/stdout.
    pub fn set_forward(&mut self, spec: &str, local: bool) -> Result<(), String> {
        let mut parts = spec.splitn(2, ':');
        let lport = parts.next().unwrap_or_default();
        let target = parts
            .next()
            .ok_or_else(|| format!("Forwarding spec must be lport:host:rport, got {:?}", spec))?;
        let (host, rport) = target
            .rsplit_once(':')
            .ok_or_else(|| format!("Forwarding spec must be lport:host:rport, got {:?}", spec))?;

        if lport == "-" {
            self.use_stdin = true;
            self.local_port = None;
        } else {
            let port = lport
                .parse::<u16>()
                .map_err(|_| format!("Bad local port {:?}", lport))?;
            self.local_port = Some(port);
        }
        self.remote_host = host.to_string();
        self.remote_port = rport
            .parse::<u16>()
            .map_err(|_| format!("Bad remote port {:?}", rport))?;
        self.is_local_port_forwarding = local;
        Ok(())
    }

    /// Resource string asked of the relay
    ///
    /// `-L` makes the relay connect to `host:rport`; `-R` makes it bind
    /// `lport`.
    pub fn resource(&self) -> String {
        if self.is_local_port_forwarding {
            format!("{}:{}", self.remote_host, self.remote_port)
        } else {
            self.local_port.map(|p| p.to_string()).unwrap_or_default()
        }
    }

    /// Key if one is set and non-empty
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref().filter(|k| !k.is_empty())
    }

    /// Configured DNS server, else the first nameserver of resolv.conf
    pub fn resolve_dns_server(&self) -> Result<SocketAddr, String> {
        if let Some(server) = self.dns_server {
            return Ok(server);
        }
        read_resolv(Path::new(RESOLV_CONF))
            .map_err(|e| format!("Cannot read {}: {}", RESOLV_CONF, e))?
            .ok_or_else(|| format!("No DNS server given and none in {}", RESOLV_CONF))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        validate_common(&self.domain, self.conn_timeout)?;

        if self.poll_interval.is_zero() {
            return Err("Poll interval must be positive".to_string());
        }

        if self.remote_host.is_empty() || self.remote_port == 0 {
            return Err("A forwarding spec (-L or -R lport:host:rport) is required".to_string());
        }

        if self.use_stdin {
            if !self.is_local_port_forwarding {
                return Err("stdin mode only works with local forwarding".to_string());
            }
        } else if self.local_port.is_none() {
            return Err("Local port must be set".to_string());
        }

        Ok(())
    }
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// UDP address answering DNS queries
    pub listen: SocketAddr,

    /// Zone this relay is authoritative for
    pub domain: String,

    /// Pre-shared key, any login is accepted without one
    pub key: Option<String>,

    /// Bound on outbound resource connects
    #[serde(with = "humantime_serde")]
    pub conn_timeout: Duration,

    /// Silence after which a session is evicted
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    pub max_sessions: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DNS_PORT)),
            domain: String::new(),
            key: None,
            conn_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(60),
            max_sessions: 256,
        }
    }
}

impl RelayConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref().filter(|k| !k.is_empty())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        validate_common(&self.domain, self.conn_timeout)?;

        if self.max_sessions == 0 || self.max_sessions > u16::MAX as usize {
            return Err("max_sessions must be between 1 and 65535".to_string());
        }

        if self.idle_timeout <= self.conn_timeout {
            return Err("idle_timeout must exceed conn_timeout".to_string());
        }

        Ok(())
    }
}

fn validate_common(domain: &str, conn_timeout: Duration) -> Result<(), String> {
    if domain.trim_matches('.').is_empty() {
        return Err("Domain must be set".to_string());
    }
    dns::check_zone(domain).map_err(|e| format!("Bad domain {:?}: {}", domain, e))?;
    if Packet::max_payload(DnsCodec::new(domain).upstream_budget()) == 0 {
        return Err(format!("Domain {:?} leaves no room for tunnel data", domain));
    }

    if conn_timeout < MIN_CONN_TIMEOUT || conn_timeout > MAX_CONN_TIMEOUT {
        return Err(format!(
            "Connection timeout must be between {}s and {}s",
            MIN_CONN_TIMEOUT.as_secs(),
            MAX_CONN_TIMEOUT.as_secs()
        ));
    }

    Ok(())
}

/// First `nameserver` entry of a resolv.conf file
pub fn read_resolv(path: &Path) -> std::io::Result<Option<SocketAddr>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(parse_resolv(&contents))
}

fn parse_resolv(contents: &str) -> Option<SocketAddr> {
    contents.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        if words.next() != Some("nameserver") {
            return None;
        }
        // strip an IPv6 zone index
        let addr = words.next()?.split('%').next()?;
        addr.parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, DNS_PORT))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_forward() -> ClientConfig {
        let mut config = ClientConfig {
            domain: "tunnel.example.com".to_string(),
            ..Default::default()
        };
        config.set_forward("2222:ssh.internal:22", true).unwrap();
        config
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.conn_timeout, Duration::from_secs(3));
        assert!(config.validate().is_err());

        let relay = RelayConfig::default();
        assert_eq!(relay.listen.port(), 53);
        assert_eq!(relay.max_sessions, 256);
    }

    #[test]
    fn test_local_forwarding() {
        let config = local_forward();
        assert!(config.validate().is_ok());
        assert_eq!(config.local_port, Some(2222));
        assert_eq!(config.resource(), "ssh.internal:22");
    }

    #[test]
    fn test_remote_forwarding() {
        let mut config = local_forward();
        config.set_forward("8080:127.0.0.1:80", false).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.resource(), "8080");
    }

    #[test]
    fn test_stdin_forwarding() {
        let mut config = local_forward();
        config.set_forward("-:db.internal:5432", true).unwrap();
        assert!(config.use_stdin);
        assert!(config.validate().is_ok());
        assert_eq!(config.resource(), "db.internal:5432");

        config.is_local_port_forwarding = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_forward_specs() {
        let mut config = ClientConfig::default();
        for bad in ["", "2222", "2222:host", "x:host:22", "2222:host:x"] {
            assert!(config.set_forward(bad, true).is_err(), "{:?}", bad);
        }
    }

    #[test]
    fn test_conn_timeout_range() {
        let mut config = local_forward();
        config.conn_timeout = Duration::from_millis(500);
        assert!(config.validate().is_err());
        config.conn_timeout = Duration::from_secs(241);
        assert!(config.validate().is_err());
        config.conn_timeout = Duration::from_secs(240);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_relay_validation() {
        let mut relay = RelayConfig::default();
        assert!(relay.validate().is_err());

        relay.domain = "tunnel.example.com".to_string();
        assert!(relay.validate().is_ok());

        relay.max_sessions = 0;
        assert!(relay.validate().is_err());
    }

    #[test]
    fn test_toml() {
        let relay: RelayConfig = toml::from_str(
            r#"
            listen = "127.0.0.1:5353"
            domain = "t.example.com"
            key = "secret"
            idle_timeout = "2m"
            "#,
        )
        .unwrap();
        assert_eq!(relay.listen.port(), 5353);
        assert_eq!(relay.key(), Some("secret"));
        assert_eq!(relay.idle_timeout, Duration::from_secs(120));
        assert_eq!(relay.conn_timeout, Duration::from_secs(3));

        let client: ClientConfig = toml::from_str(
            r#"
            domain = "t.example.com"
            key = ""
            poll_interval = "50ms"
            "#,
        )
        .unwrap();
        assert_eq!(client.key(), None);
        assert_eq!(client.poll_interval, Duration::from_millis(50));
        assert_eq!(client.udp_port_bind, None);

        let client: ClientConfig = toml::from_str("udp_port_bind = 5300").unwrap();
        assert_eq!(client.udp_port_bind, Some(5300));
    }

    #[test]
    fn test_domain_validation() {
        let mut config = local_forward();
        for bad in ["tunnel..example.com", "dömain.com"] {
            config.domain = bad.to_string();
            assert!(config.validate().is_err(), "{:?}", bad);
        }

        config.domain = format!("{}.example.com", "a".repeat(64));
        assert!(config.validate().is_err());

        // legal zone, but too long to leave room for a packet header
        let labels = ["a".repeat(63), "b".repeat(63), "c".repeat(63), "d".repeat(48)];
        config.domain = labels.join(".");
        assert_eq!(config.domain.len(), 240);
        assert!(config.validate().is_err());

        config.domain = labels[..3].join(".");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_resolv() {
        let contents = "# generated\nsearch example.com\nnameserver fe80::1%eth0\nnameserver 9.9.9.9\n";
        assert_eq!(
            parse_resolv(contents),
            Some("[fe80::1]:53".parse().unwrap())
        );
        assert_eq!(
            parse_resolv("nameserver 10.0.0.2"),
            Some("10.0.0.2:53".parse().unwrap())
        );
        assert_eq!(parse_resolv("options ndots:1"), None);
    }
}
