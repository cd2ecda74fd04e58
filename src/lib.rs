//! dnstcp: TCP over DNS
//!
//! dnstcp carries TCP byte streams through a path that only lets DNS out. A
//! client encodes stream fragments into the query names of TXT lookups for a
//! zone delegated to the relay; the relay answers with TXT records carrying its
//! own fragments and forwards the stream to a real TCP resource.
//!
//! ## Features
//!
//! - **Reliable streams**: sequenced fragments, acknowledgment and
//!   retransmission over a lossy request/response channel
//! - **Multiplexing**: many sessions share one UDP socket, keyed by session id
//! - **Port forwarding**: local (`-L`) and remote (`-R`) forwarding, or a
//!   single stream over stdin/stdout
//! - **Challenge/response login**: HMAC-SHA1 over a per-session challenge
//!
//! ## Quick Start
//!
//! ```bash
//! # Relay, authoritative for tunnel.example.com
//! dnstcp-server -z tunnel.example.com -k secret -l 0.0.0.0:53
//!
//! # Client: 127.0.0.1:2222 reaches ssh.internal:22 through the relay
//! dnstcp-client -z tunnel.example.com -k secret -L 2222:ssh.internal:22
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  TCP  ┌──────────┐  DNS (TXT)  ┌──────────┐  TCP  ┌──────────┐
//! │  Local   │──────▶│  Client  │────────────▶│  Relay   │──────▶│ Resource │
//! │   app    │◀──────│          │◀────────────│          │◀──────│          │
//! └──────────┘       └──────────┘  base32     └──────────┘       └──────────┘
//! ```
//!
//! Each side runs one event loop task that owns its [`SessionTable`]. Helper
//! tasks (local reads, accepts) only talk to it through [`pipe::Event`]s.

pub mod auth;
pub mod base32;
pub mod client;
pub mod config;
pub mod connector;
pub mod dns;
pub mod packet;
pub mod pipe;
pub mod queue;
pub mod relay;
pub mod session;
pub mod transceive;

pub use auth::AuthError;
pub use client::Client;
pub use config::{ClientConfig, RelayConfig};
pub use connector::{ConnError, ResourceSpec};
pub use dns::{DnsCodec, DnsError};
pub use packet::{FrameError, Packet, PacketKind, SessionId};
pub use queue::{Ack, Inbound, InboundWindow, OutboundQueue};
pub use relay::Relay;
pub use session::{Session, SessionState, SessionTable};
pub use transceive::Transceiver;

/// dnstcp error types
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Resource error: {0}")]
    Conn(#[from] ConnError),

    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// No reply within `conn_timeout`
    #[error("Timed out waiting for reply")]
    Timeout,

    /// No session can be created
    #[error("Session table exhausted")]
    Exhausted,

    #[error("Session not found: {0}")]
    NotFound(SessionId),

    /// `Err` reply from the peer
    #[error("Peer error: {0}")]
    Remote(String),

    #[error("Unexpected reply: {0:?}")]
    UnexpectedReply(PacketKind),

    #[error("Queue closed by abort")]
    QueueClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<queue::QueueClosed> for TunnelError {
    fn from(_: queue::QueueClosed) -> Self {
        Self::QueueClosed
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        let err: TunnelError = FrameError::Truncated.into();
        assert!(matches!(err, TunnelError::Frame(FrameError::Truncated)));

        let err: TunnelError = queue::QueueClosed.into();
        assert!(matches!(err, TunnelError::QueueClosed));

        let err: TunnelError = AuthError::NotAuthenticated.into();
        assert_eq!(
            err.to_string(),
            "Authentication error: Session is not authenticated"
        );
    }

    #[test]
    fn test_session_id_in_errors() {
        let id = SessionId::new(0x1f).unwrap();
        assert_eq!(TunnelError::NotFound(id).to_string(), "Session not found: 001f");
    }
}
