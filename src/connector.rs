//! Resource connector
//!
//! A resource string names what a session's stream is attached to on the
//! relay:
//! - `"port"`: bind `127.0.0.1:port` and wait for one inbound peer
//!   (remote port forwarding)
//! - `"host:port"`: connect out to `host:port` (local port forwarding)

use log::{debug, info, warn};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;

use crate::pipe::{Event, EventSender, Owner};

/// Listen backlog for bind mode
const LISTEN_BACKLOG: u32 = 10;

#[derive(Error, Debug)]
pub enum ConnError {
    #[error("Bad resource: {0:?}")]
    BadResource(String),

    #[error("Bind failed: {0}")]
    BindFailed(#[source] io::Error),

    #[error("Connect failed: {0}")]
    ConnectFailed(#[source] io::Error),
}

/// Parsed resource string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSpec {
    Bind(u16),
    Connect(String, u16),
}

impl ResourceSpec {
    pub fn parse(resource: &str) -> Result<Self, ConnError> {
        let bad = || ConnError::BadResource(resource.to_string());
        let resource = resource.trim();

        match resource.rsplit_once(':') {
            Some((host, port)) => {
                let host = host.trim_start_matches('[').trim_end_matches(']');
                if host.is_empty() {
                    return Err(bad());
                }
                let port = port.parse::<u16>().map_err(|_| bad())?;
                Ok(Self::Connect(host.to_string(), port))
            }
            None => resource.parse::<u16>().map(Self::Bind).map_err(|_| bad()),
        }
    }
}

/// Outcome of [`connect_resource`]
#[derive(Debug)]
pub enum Resource {
    /// Bound and listening for the inbound peer
    Listening(TcpListener),
    Connected(TcpStream),
}

/// Bind or connect the resource
pub async fn connect_resource(
    spec: &ResourceSpec,
    conn_timeout: Duration,
) -> Result<Resource, ConnError> {
    match spec {
        ResourceSpec::Bind(port) => {
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, *port));
            bind_loopback(addr).map(Resource::Listening).map_err(ConnError::BindFailed)
        }
        ResourceSpec::Connect(host, port) => {
            let stream = tokio::time::timeout(conn_timeout, TcpStream::connect((host.as_str(), *port)))
                .await
                .map_err(|_| {
                    ConnError::ConnectFailed(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no answer from {}:{} within {:?}", host, port, conn_timeout),
                    ))
                })?
                .map_err(ConnError::ConnectFailed)?;
            debug!("Connected to {}:{}", host, port);
            Ok(Resource::Connected(stream))
        }
    }
}

fn bind_loopback(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(LISTEN_BACKLOG)?;
    info!("Listening on {} for inbound peer", addr);
    Ok(listener)
}

/// Wait for one inbound peer, hand it to the event loop, then release the
/// listener
pub fn spawn_accept(owner: Owner, listener: TcpListener, events: EventSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!("Session {}: inbound peer {}", owner.id, peer);
                let _ = events.send(Event::Accepted(owner, stream));
            }
            Err(e) => {
                warn!("Session {}: accept failed: {}", owner.id, e);
                let _ = events.send(Event::Closed(owner));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::SessionId;
    use tokio::sync::mpsc;

    #[test]
    fn test_parse_resource() {
        assert_eq!(ResourceSpec::parse("8080").unwrap(), ResourceSpec::Bind(8080));
        assert_eq!(
            ResourceSpec::parse("example.com:22").unwrap(),
            ResourceSpec::Connect("example.com".to_string(), 22)
        );
        assert_eq!(
            ResourceSpec::parse("[::1]:22").unwrap(),
            ResourceSpec::Connect("::1".to_string(), 22)
        );

        for bad in ["", "http", "host:", ":80", "host:99999", "70000"] {
            assert!(
                matches!(ResourceSpec::parse(bad), Err(ConnError::BadResource(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_connect_mode() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        let spec = ResourceSpec::Connect("127.0.0.1".to_string(), port);
        let resource = connect_resource(&spec, Duration::from_secs(3)).await.unwrap();
        assert!(matches!(resource, Resource::Connected(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // grab a free port, then close it
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let spec = ResourceSpec::Connect("127.0.0.1".to_string(), port);
        let err = connect_resource(&spec, Duration::from_secs(3)).await.unwrap_err();
        assert!(matches!(err, ConnError::ConnectFailed(_)));
    }

    #[tokio::test]
    async fn test_bind_mode_accepts_once() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let listener = match connect_resource(&ResourceSpec::Bind(port), Duration::from_secs(3))
            .await
            .unwrap()
        {
            Resource::Listening(listener) => listener,
            other => panic!("expected listener, got {:?}", other),
        };

        let owner = Owner::next(SessionId::new(9).unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = spawn_accept(owner, listener, tx);

        let _peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        match rx.recv().await.unwrap() {
            Event::Accepted(got, _) => assert_eq!(got, owner),
            other => panic!("unexpected event {:?}", other),
        }
        task.await.unwrap();

        // listener released: the port can be bound again
        assert!(bind_loopback(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).is_ok());
    }

    #[tokio::test]
    async fn test_bind_in_use() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = connect_resource(&ResourceSpec::Bind(port), Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnError::BindFailed(_)));
    }
}
