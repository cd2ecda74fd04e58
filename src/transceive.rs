//! Client-side transceive and retransmission driver
//!
//! ## Architecture
//!
//! ```text
//! Packet → encode → base32 query name → UDP → resolver → relay
//! Packet ← parse  ← base32 TXT answer ← UDP ← resolver ← relay
//! ```
//!
//! Every query gets a fresh DNS id and cookie so resolvers never answer from
//! cache. A retransmission re-sends the stored datagram unchanged.

use log::{debug, info};
use rand::Rng;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

use crate::dns::{self, DnsCodec, MAX_DNS_UDP_SIZE};
use crate::packet::{Packet, SessionId};
use crate::session::SessionTable;
use crate::{Result, TunnelError};

/// Receive buffer, large enough for EDNS-padded answers
const RECV_BUF_LEN: usize = 4 * MAX_DNS_UDP_SIZE;

/// A query as it went on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentQuery {
    pub id: u16,
    pub datagram: Vec<u8>,
}

/// UDP socket connected to the DNS server, plus the codec for the zone
pub struct Transceiver {
    socket: UdpSocket,
    codec: DnsCodec,
    conn_timeout: Duration,
}

impl Transceiver {
    /// Bind a UDP socket (on `bind_port`, or any port for 0) and connect it to
    /// `server`
    pub async fn connect(
        server: SocketAddr,
        bind_port: u16,
        codec: DnsCodec,
        conn_timeout: Duration,
    ) -> Result<Self> {
        let local_ip: IpAddr = match (server.is_ipv4(), server.ip().is_loopback()) {
            (true, true) => Ipv4Addr::LOCALHOST.into(),
            (true, false) => Ipv4Addr::UNSPECIFIED.into(),
            (false, true) => Ipv6Addr::LOCALHOST.into(),
            (false, false) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let local_addr = SocketAddr::new(local_ip, bind_port);

        let socket = UdpSocket::bind(local_addr).await?;
        socket.connect(server).await?;

        info!(
            "DNS transceiver bound to {} → server {} (zone {})",
            socket.local_addr()?,
            server,
            codec.domain()
        );

        Ok(Self {
            socket,
            codec,
            conn_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Largest payload one request can carry
    pub fn max_payload(&self) -> usize {
        Packet::max_payload(self.codec.upstream_budget())
    }

    /// Frame `packet` into a query with a fresh id and cookie
    pub fn build_query(&self, packet: &Packet) -> Result<SentQuery> {
        let mut rng = rand::thread_rng();
        let packet = packet.clone().with_cookie(rng.gen());
        let bytes = packet.encode(self.codec.upstream_budget())?;
        let qname = self.codec.encode_query_name(&bytes)?;

        let id = rng.gen();
        Ok(SentQuery {
            id,
            datagram: dns::build_query(id, &qname)?,
        })
    }

    /// Send without waiting for the answer
    pub async fn send_query(&self, packet: &Packet) -> Result<SentQuery> {
        let query = self.build_query(packet)?;
        self.socket.send(&query.datagram).await?;
        debug!(
            "→ {:?} session {} seq {} ({} bytes, dns id {:04x})",
            packet.kind,
            session_label(packet.session_id),
            packet.seq,
            packet.payload.len(),
            query.id
        );
        Ok(query)
    }

    /// Re-send a stored query byte for byte
    pub async fn resend(&self, datagram: &[u8]) -> Result<()> {
        self.socket.send(datagram).await?;
        debug!("↻ {} bytes resent", datagram.len());
        Ok(())
    }

    /// Send and wait up to `conn_timeout` for the matching answer
    ///
    /// Answers carrying other DNS ids are dropped.
    pub async fn transceive_query(&self, packet: &Packet) -> Result<Packet> {
        let query = self.send_query(packet).await?;
        let deadline = tokio::time::Instant::now() + self.conn_timeout;
        let mut buf = vec![0u8; RECV_BUF_LEN];

        loop {
            let n = tokio::time::timeout_at(deadline, self.socket.recv(&mut buf))
                .await
                .map_err(|_| TunnelError::Timeout)??;

            match self.decode_reply(&buf[..n]) {
                Ok((id, reply)) if id == query.id => return Ok(reply),
                Ok((id, _)) => debug!("Dropping answer for dns id {:04x}", id),
                Err(e) => debug!("Dropping malformed answer: {}", e),
            }
        }
    }

    /// Wait for the next answer: its DNS id and packet
    pub async fn recv_reply(&self) -> Result<(u16, Packet)> {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        let n = self.socket.recv(&mut buf).await?;
        self.decode_reply(&buf[..n])
    }

    /// Next answer if one is already waiting
    pub fn try_recv_reply(&self) -> Result<Option<(u16, Packet)>> {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        match self.socket.try_recv(&mut buf) {
            Ok(n) => self.decode_reply(&buf[..n]).map(Some),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn decode_reply(&self, datagram: &[u8]) -> Result<(u16, Packet)> {
        let (id, text) = dns::parse_txt_response(datagram)?;
        let packet = Packet::parse(&self.codec.decode_answer(&text))?;
        Ok((id, packet))
    }
}

/// Datagrams of in-flight queries whose answer is overdue
///
/// Refreshes the send time of each returned query; the caller transmits.
pub fn check_for_resent(
    table: &mut SessionTable,
    now: Instant,
    conn_timeout: Duration,
) -> Vec<(SessionId, Vec<u8>)> {
    let mut resend = Vec::new();

    for session in table.iter_mut() {
        let in_flight = match session.in_flight.as_mut() {
            Some(in_flight) => in_flight,
            None => continue,
        };
        if now.saturating_duration_since(in_flight.sent_at) < conn_timeout {
            continue;
        }

        in_flight.sent_at = now;
        resend.push((session.id, in_flight.query.datagram.clone()));
        if let Some(seq) = in_flight.seq {
            session.outbound.mark_sent(seq, now);
        }
    }

    resend
}

pub(crate) fn session_label(id: Option<SessionId>) -> String {
    id.map_or_else(|| "-".to_string(), |id| id.to_string())
}
