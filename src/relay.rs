//! Relay: answers tunnel queries and forwards streams to resources
//!
//! The relay is authoritative for the tunnel zone. Every query carries one
//! request packet and gets exactly one reply packet in a TXT answer; the relay
//! never speaks first, so its outbound fragments ride on the answers to the
//! client's data and poll requests.
//!
//! ## Request handling
//!
//! | Request        | Reply                                             |
//! |----------------|---------------------------------------------------|
//! | `Login`, no id | `Ok` with new session id, challenge in payload    |
//! | `Login`, id    | `Ok` if the signed challenge matches, else `Err`  |
//! | `Connect`      | `Ok` once the resource is bound or connected      |
//! | `Connected`    | `Ok` when the stream is attached, `Nop` if not yet, `Err` if it never will be |
//! | `Data`/`Nop`/`Desauth` | queue head (`Data`/`Desauth`) or `Nop`, with ack |
//! | `Disconnected` | `Ok`, session deleted                             |

use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::auth;
use crate::config::RelayConfig;
use crate::connector::{self, Resource, ResourceSpec};
use crate::dns::{DnsCodec, Query, MAX_DNS_UDP_SIZE};
use crate::packet::{
    Packet, PacketKind, SessionId, ERR_AUTH_FAILED, ERR_BAD_REQUEST, ERR_BAD_SESSION,
    ERR_CONN_REFUSED, ERR_EXHAUSTED,
};
use crate::pipe::{Event, EventReceiver, EventSender, Pipe};
use crate::queue::{Fragment, Inbound};
use crate::session::{SessionState, SessionTable};
use crate::{Result, TunnelError};

/// Housekeeping period for idle eviction
const TICK: Duration = Duration::from_secs(1);

const RECV_BUF_LEN: usize = 4 * MAX_DNS_UDP_SIZE;

pub struct Relay {
    table: SessionTable,
    codec: DnsCodec,
    key: Option<String>,
    conn_timeout: Duration,
    idle_timeout: Duration,
    events_tx: EventSender,
    events_rx: EventReceiver,
}

impl Relay {
    pub fn new(config: &RelayConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            table: SessionTable::new(config.max_sessions),
            codec: DnsCodec::new(&config.domain),
            key: config.key().map(str::to_string),
            conn_timeout: config.conn_timeout,
            idle_timeout: config.idle_timeout,
            events_tx,
            events_rx,
        }
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.table
    }

    /// Largest fragment one answer can carry
    pub fn max_fragment(&self) -> usize {
        Packet::max_payload(self.codec.downstream_budget())
    }

    /// Serve `socket` until it fails
    pub async fn run(mut self, socket: UdpSocket) -> Result<()> {
        info!(
            "Relay for zone {} listening on {}",
            self.codec.domain(),
            socket.local_addr()?
        );

        let mut buf = vec![0u8; RECV_BUF_LEN];
        let mut tick = tokio::time::interval(TICK);

        loop {
            tokio::select! {
                res = socket.recv_from(&mut buf) => {
                    let first = res?;
                    self.check_incoming_ns_reply(&socket, &mut buf, first).await?;
                }
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = tick.tick() => {
                    self.evict_idle(Instant::now());
                }
            }
        }
    }

    /// Answer the datagram that woke the loop, then every one already queued
    async fn check_incoming_ns_reply(
        &mut self,
        socket: &UdpSocket,
        buf: &mut [u8],
        first: (usize, SocketAddr),
    ) -> Result<()> {
        let (mut len, mut peer) = first;
        loop {
            if let Some(answer) = self.handle_query(&buf[..len]).await {
                if let Err(e) = socket.send_to(&answer, peer).await {
                    warn!("Failed to answer {}: {}", peer, e);
                }
            }

            match socket.try_recv_from(buf) {
                Ok((n, from)) => {
                    len = n;
                    peer = from;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// DNS datagram in, answer datagram out. Malformed queries get no answer.
    pub async fn handle_query(&mut self, datagram: &[u8]) -> Option<Vec<u8>> {
        let query = match Query::parse(datagram) {
            Ok(query) => query,
            Err(e) => {
                debug!("Dropping malformed query: {}", e);
                return None;
            }
        };

        let bytes = match self.codec.decode_query_name(&query.qname) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Refusing {}: {}", query.qname, e);
                return Some(query.refused());
            }
        };

        let packet = match Packet::parse(&bytes) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping bad packet in {}: {}", query.qname, e);
                return None;
            }
        };

        let reply = self.handle_packet(packet).await;
        match reply.encode(self.codec.downstream_budget()) {
            Ok(bytes) => Some(query.txt_response(&self.codec.encode_answer(&bytes))),
            Err(e) => {
                warn!("Cannot frame reply: {}", e);
                None
            }
        }
    }

    /// Serve one request packet
    pub async fn handle_packet(&mut self, packet: Packet) -> Packet {
        debug!(
            "← {:?} session {} seq {} ack {:?} ({} bytes)",
            packet.kind,
            crate::transceive::session_label(packet.session_id),
            packet.seq,
            packet.ack,
            packet.payload.len()
        );

        if packet.kind == PacketKind::Login {
            return self.login_user(&packet);
        }

        let id = match packet.session_id {
            Some(id) if self.table.contains(id) => id,
            _ => return Packet::error(packet.session_id, ERR_BAD_SESSION),
        };

        let reply = match packet.kind {
            PacketKind::Connect => self.bind_user(id, &packet).await,
            PacketKind::Connected => self.check_connected(id),
            PacketKind::Disconnected => Ok(self.disconnected(id)),
            PacketKind::Data | PacketKind::Nop | PacketKind::Desauth => self.exchange(id, &packet),
            PacketKind::Ok | PacketKind::Err | PacketKind::Login => {
                Ok(Packet::error(Some(id), ERR_BAD_REQUEST))
            }
        };

        reply.unwrap_or_else(|e| self.reject(id, e))
    }

    /// Map a request failure to its `Err` reply
    fn reject(&mut self, id: SessionId, err: TunnelError) -> Packet {
        match err {
            TunnelError::Auth(e) => {
                warn!("Session {}: {}, deleting", id, e);
                let _ = self.table.delete(id);
                Packet::error(Some(id), ERR_AUTH_FAILED)
            }
            TunnelError::NotFound(_) => Packet::error(Some(id), ERR_BAD_SESSION),
            e => {
                warn!("Session {}: {}", id, e);
                Packet::error(Some(id), ERR_BAD_REQUEST)
            }
        }
    }

    /// Open a session, or check the answer to its challenge
    fn login_user(&mut self, packet: &Packet) -> Packet {
        let id = match packet.session_id {
            None => {
                return match self.table.create_session("") {
                    Ok(id) => {
                        let challenge = self
                            .table
                            .find_by_id(id)
                            .map(|s| s.challenge.clone())
                            .unwrap_or_default();
                        Packet::new(PacketKind::Ok, Some(id)).with_payload(challenge.into_bytes())
                    }
                    Err(e) => {
                        warn!("Login refused: {}", e);
                        Packet::error(None, ERR_EXHAUSTED)
                    }
                };
            }
            Some(id) => id,
        };

        let key = self.key.as_deref();
        let session = match self.table.find_by_id_mut(id) {
            Ok(session) => session,
            Err(_) => return Packet::error(Some(id), ERR_BAD_SESSION),
        };

        match auth::verify(&session.challenge, key, &packet.payload_str()) {
            Ok(()) => {
                if session.state == SessionState::Challenged {
                    session.state = SessionState::Authenticated;
                    info!("Session {} authenticated", id);
                }
                session.touch();
                Packet::new(PacketKind::Ok, Some(id))
            }
            Err(e) => self.reject(id, e.into()),
        }
    }

    /// Connect or bind the resource named in the payload
    async fn bind_user(&mut self, id: SessionId, packet: &Packet) -> Result<Packet> {
        let session = self.table.require_authenticated(id)?;
        session.touch();

        // a resent request after the first one went through
        if session.pipe.is_some() || session.listener.is_some() {
            return Ok(Packet::new(PacketKind::Ok, Some(id)));
        }

        let resource = packet.payload_str();
        let spec = match ResourceSpec::parse(&resource) {
            Ok(spec) => spec,
            Err(e) => {
                warn!("Session {}: {}", id, e);
                return Ok(Packet::error(Some(id), ERR_BAD_REQUEST));
            }
        };

        let attached = connector::connect_resource(&spec, self.conn_timeout).await;
        let session = self.table.find_by_id_mut(id)?;
        let owner = session.owner();
        match attached {
            Ok(Resource::Connected(stream)) => {
                session.pipe = Some(Pipe::tcp(owner, stream, self.events_tx.clone()));
            }
            Ok(Resource::Listening(listener)) => {
                session.listener = Some(connector::spawn_accept(owner, listener, self.events_tx.clone()));
            }
            Err(e) => {
                warn!("Session {}: resource {:?}: {}", id, resource, e);
                return Ok(Packet::error(Some(id), ERR_CONN_REFUSED));
            }
        }

        info!("Session {} attached to {}", id, resource);
        session.resource = resource;
        session.is_local_port_forwarding = matches!(spec, ResourceSpec::Connect(..));
        session.state = SessionState::Connected;
        Ok(Packet::new(PacketKind::Ok, Some(id)))
    }

    /// `Ok` once the stream is attached, `Nop` while still waiting
    ///
    /// A session whose stream ended before it was ever attached (the inbound
    /// peer never arrived) is deleted and refused.
    fn check_connected(&mut self, id: SessionId) -> Result<Packet> {
        let session = self.table.require_authenticated(id)?;
        session.touch();
        if session.pipe.is_some() {
            return Ok(Packet::new(PacketKind::Ok, Some(id)));
        }
        if session.outbound.is_closed() {
            warn!("Session {}: resource gone before it was attached", id);
            self.table.delete(id)?;
            return Ok(Packet::error(Some(id), ERR_CONN_REFUSED));
        }
        Ok(Packet::new(PacketKind::Nop, Some(id)))
    }

    fn disconnected(&mut self, id: SessionId) -> Packet {
        if self.table.delete(id).is_ok() {
            info!("Session {} disconnected by client", id);
        }
        Packet::new(PacketKind::Ok, Some(id))
    }

    /// Take the client's fragment and ack, answer with the queue head
    fn exchange(&mut self, id: SessionId, packet: &Packet) -> Result<Packet> {
        let session = self.table.require_authenticated(id)?;
        session.touch();

        if let Some(ack) = packet.ack {
            let acked = session.outbound.acknowledge(ack);
            debug!("Session {}: ack {} → {:?}", id, ack, acked);
        }

        let mut reply_ack = None;
        let mut aborted = false;
        if packet.kind.is_sequenced() {
            match session.inbound.accept(packet.seq) {
                Inbound::Deliver => {
                    reply_ack = Some(packet.seq);
                    if packet.kind == PacketKind::Desauth {
                        aborted = true;
                    } else if let Some(pipe) = &session.pipe {
                        pipe.write(packet.payload.clone());
                    } else {
                        debug!("Session {}: no stream, {} bytes dropped", id, packet.payload.len());
                    }
                }
                Inbound::Duplicate => reply_ack = Some(packet.seq),
                Inbound::Ahead => debug!("Session {}: seq {} ahead, dropped", id, packet.seq),
            }
        }

        if aborted {
            info!("Session {} aborted by client", id);
            self.table.delete(id)?;
            return Ok(Packet::new(PacketKind::Nop, Some(id)).with_ack(reply_ack));
        }

        let now = Instant::now();
        let reply = match session.outbound.head() {
            Some(head) => {
                let kind = match head.fragment {
                    Fragment::Data(_) => PacketKind::Data,
                    Fragment::Abort => PacketKind::Desauth,
                };
                let seq = head.seq;
                let reply = Packet::new(kind, Some(id))
                    .with_seq(seq)
                    .with_payload(head.payload());
                session.outbound.mark_sent(seq, now);
                reply
            }
            None => Packet::new(PacketKind::Nop, Some(id)),
        };

        Ok(reply.with_ack(reply_ack))
    }

    /// Apply a helper task notification
    pub fn handle_event(&mut self, event: Event) {
        let max_fragment = self.max_fragment();
        let owner = event.owner();
        let session = match self.table.find_owner_mut(owner) {
            Some(session) => session,
            None => {
                debug!("Session {} gone, stale {:?} dropped", owner, event);
                return;
            }
        };

        match event {
            Event::Read(_, data) => {
                if session.outbound.push(&data, max_fragment).is_err() {
                    debug!("Session {}: {} bytes after abort dropped", owner.id, data.len());
                }
            }
            Event::Closed(_) => {
                if session.outbound.push_abort().is_some() {
                    info!("Session {}: resource closed, abort queued", owner.id);
                }
            }
            Event::Accepted(_, stream) => {
                session.listener = None;
                session.pipe = Some(Pipe::tcp(owner, stream, self.events_tx.clone()));
            }
        }
    }

    /// Wait for the next helper task notification
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events_rx.recv().await
    }

    pub fn evict_idle(&mut self, now: Instant) -> usize {
        self.table.evict_idle(now, self.idle_timeout).len()
    }

    /// Queue bytes for a session's client, as if read from its resource
    pub fn push_outbound(&mut self, id: SessionId, data: &[u8]) -> Result<usize> {
        let max_fragment = self.max_fragment();
        let session = self.table.find_by_id_mut(id)?;
        Ok(session.outbound.push(data, max_fragment)?)
    }
}
