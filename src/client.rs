//! Client: carries local streams to the relay through DNS
//!
//! ## Modes
//!
//! - `-L lport:host:rport`: listen on `127.0.0.1:lport`; every accepted
//!   connection gets its own session, the relay connects to `host:rport`
//! - `-R lport:host:rport`: the relay binds `lport`; each inbound peer there is
//!   joined to a fresh local connection to `host:rport`
//! - `-L -:host:rport`: one session over stdin/stdout
//!
//! Sessions are opened with blocking request/answer exchanges (login,
//! challenge, connect). Once a session is ready its stream moves through the
//! event loop: one query in flight per session, data first, polls when idle.

use log::{debug, error, info, warn};
use std::io;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::auth;
use crate::config::ClientConfig;
use crate::dns::DnsCodec;
use crate::packet::{Packet, PacketKind, SessionId, ERR_AUTH_FAILED, ERR_BAD_SESSION};
use crate::pipe::{Event, EventReceiver, EventSender, Pipe};
use crate::queue::{Ack, Fragment, Inbound};
use crate::session::{InFlight, Session, SessionState, SessionTable};
use crate::transceive::{self, Transceiver};
use crate::{Result, TunnelError};

/// Attempts for each session setup exchange
const HANDSHAKE_ATTEMPTS: usize = 3;

/// Upper bound on the loop's housekeeping period
const MAX_TICK: Duration = Duration::from_millis(50);

/// Client sessions never outnumber the relay's id space
const MAX_SESSIONS: usize = u16::MAX as usize;

/// Local side of a new session
#[derive(Debug)]
pub enum Local {
    Tcp(TcpStream),
    Stdio,
}

pub struct Client {
    config: ClientConfig,
    transceiver: Transceiver,
    table: SessionTable,
    events_tx: EventSender,
    events_rx: EventReceiver,
    /// `-R` session waiting for an inbound peer on the relay
    waiting: Option<SessionId>,
}

impl Client {
    /// Bind the DNS socket and prepare an empty session table
    pub async fn new(config: ClientConfig) -> Result<Self> {
        let server = config.resolve_dns_server().map_err(TunnelError::Config)?;
        let transceiver =
            Transceiver::connect(
                server,
                config.udp_port_bind.unwrap_or(0),
                DnsCodec::new(&config.domain),
                config.conn_timeout,
            )
            .await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            transceiver,
            table: SessionTable::new(MAX_SESSIONS),
            events_tx,
            events_rx,
            waiting: None,
        })
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.table
    }

    /// Send a setup request, retrying on timeout, and fail on `Err` replies
    async fn request(&self, packet: &Packet) -> Result<Packet> {
        for attempt in 1..=HANDSHAKE_ATTEMPTS {
            match self.transceiver.transceive_query(packet).await {
                Ok(reply) if reply.kind == PacketKind::Err => {
                    return Err(TunnelError::Remote(reply.payload_str()));
                }
                Ok(reply) => return Ok(reply),
                Err(TunnelError::Timeout) => {
                    debug!("{:?} timed out (attempt {})", packet.kind, attempt);
                }
                Err(e) => return Err(e),
            }
        }
        Err(TunnelError::Timeout)
    }

    /// Log in: get a session id and challenge, then answer the challenge
    pub async fn create_session(&mut self) -> Result<SessionId> {
        let reply = self.request(&Packet::new(PacketKind::Login, None)).await?;
        let id = match (reply.kind, reply.session_id) {
            (PacketKind::Ok, Some(id)) => id,
            (kind, _) => return Err(TunnelError::UnexpectedReply(kind)),
        };

        let challenge = reply.payload_str();
        let response = self
            .config
            .key()
            .map(|key| auth::sign_challenge(&challenge, key))
            .unwrap_or_default();

        let login = Packet::new(PacketKind::Login, Some(id)).with_payload(response.into_bytes());
        let reply = self.request(&login).await?;
        if reply.kind != PacketKind::Ok {
            return Err(TunnelError::UnexpectedReply(reply.kind));
        }

        let mut session = Session::new(id, &self.config.resource(), SessionState::Init);
        session.is_local_port_forwarding = self.config.is_local_port_forwarding;
        session.challenge = challenge;
        self.table.insert_with_id(session)?;
        info!("Session {} logged in", id);
        Ok(id)
    }

    /// Ask the relay to connect or bind this session's resource
    pub async fn connect_resource(&mut self, id: SessionId) -> Result<()> {
        let resource = self.table.find_by_id(id)?.resource.clone();
        let packet = Packet::new(PacketKind::Connect, Some(id)).with_payload(resource.clone().into_bytes());

        match self.request(&packet).await {
            Ok(reply) if reply.kind == PacketKind::Ok => {
                self.table.find_by_id_mut(id)?.state = SessionState::Connected;
                info!("Session {}: relay attached {}", id, resource);
                Ok(())
            }
            Ok(reply) => Err(TunnelError::UnexpectedReply(reply.kind)),
            Err(e) => {
                error!("Session {}: cannot attach {}: {}", id, resource, e);
                Err(e)
            }
        }
    }

    /// `true` once the relay's end of the stream is attached
    pub async fn check_resource_connected(&mut self, id: SessionId) -> Result<bool> {
        let reply = self.request(&Packet::new(PacketKind::Connected, Some(id))).await?;
        let session = self.table.find_by_id_mut(id)?;
        session.touch();

        match reply.kind {
            PacketKind::Ok => {
                session.state = SessionState::Ready;
                Ok(true)
            }
            PacketKind::Nop => Ok(false),
            kind => Err(TunnelError::UnexpectedReply(kind)),
        }
    }

    /// Tell the relay a session is over and drop it
    pub async fn disconnect_client(&mut self, id: SessionId) -> Result<()> {
        self.table.delete(id)?;
        self.transceiver
            .send_query(&Packet::new(PacketKind::Disconnected, Some(id)))
            .await?;
        info!("Session {} disconnected", id);
        Ok(())
    }

    /// Open a session for a new local endpoint
    pub async fn add_client(&mut self, local: Local) -> Result<SessionId> {
        let id = self.create_session().await?;

        let ready = match self.connect_resource(id).await {
            Ok(()) => self.check_resource_connected(id).await,
            Err(e) => Err(e),
        };
        match ready {
            Ok(true) => {}
            Ok(false) => {
                let _ = self.disconnect_client(id).await;
                return Err(TunnelError::Remote("resource not connected".to_string()));
            }
            Err(e) => {
                let _ = self.disconnect_client(id).await;
                return Err(e);
            }
        }

        let session = self.table.find_by_id_mut(id)?;
        let owner = session.owner();
        session.pipe = Some(match local {
            Local::Tcp(stream) => Pipe::tcp(owner, stream, self.events_tx.clone()),
            Local::Stdio => Pipe::stdio(owner, self.events_tx.clone()),
        });
        Ok(id)
    }

    /// `-R`: session waiting on the relay for the next inbound peer
    async fn open_waiting(&mut self) -> Result<()> {
        let id = self.create_session().await?;
        if let Err(e) = self.connect_resource(id).await {
            let _ = self.disconnect_client(id).await;
            return Err(e);
        }
        self.waiting = Some(id);
        Ok(())
    }

    /// `-R`: poll the waiting session; when its peer arrived, join it to a
    /// local connection and open the next one
    async fn poll_waiting(&mut self, now: Instant) -> Result<()> {
        let id = match self.waiting {
            Some(id) => id,
            None => return Ok(()),
        };
        let last = self.table.find_by_id(id)?.last_activity;
        if now.saturating_duration_since(last) < self.config.poll_interval {
            return Ok(());
        }

        match self.check_resource_connected(id).await {
            Ok(false) | Err(TunnelError::Timeout) => return Ok(()),
            Ok(true) => {}
            Err(TunnelError::Remote(message)) => {
                warn!("Session {}: relay stopped waiting for a peer: {}", id, message);
                let _ = self.disconnect_client(id).await;
                self.waiting = None;
                return self.open_waiting().await;
            }
            Err(e) => return Err(e),
        }

        let target = (self.config.remote_host.as_str(), self.config.remote_port);
        let local = tokio::time::timeout(self.config.conn_timeout, TcpStream::connect(target)).await;
        let session = self.table.find_by_id_mut(id)?;
        match local {
            Ok(Ok(stream)) => {
                info!("Session {}: joined to {}:{}", id, target.0, target.1);
                session.pipe = Some(Pipe::tcp(session.owner(), stream, self.events_tx.clone()));
            }
            Ok(Err(e)) => {
                warn!("Session {}: local connect to {}:{} failed: {}", id, target.0, target.1, e);
                session.outbound.push_abort();
            }
            Err(_) => {
                warn!("Session {}: local connect to {}:{} timed out", id, target.0, target.1);
                session.outbound.push_abort();
            }
        }

        self.waiting = None;
        self.open_waiting().await
    }

    /// Apply an answer from the relay
    pub async fn handle_reply(&mut self, dns_id: u16, reply: Packet) -> Result<()> {
        let id = match reply.session_id {
            Some(id) => id,
            None => return Ok(()),
        };
        let session = match self.table.find_by_id_mut(id) {
            Ok(session) => session,
            Err(_) => {
                debug!("Answer for unknown session {}", id);
                return Ok(());
            }
        };
        match &session.in_flight {
            Some(in_flight) if in_flight.query.id == dns_id => {}
            _ => {
                debug!("Session {}: stale answer {:04x} dropped", id, dns_id);
                return Ok(());
            }
        }

        session.in_flight = None;
        session.touch();

        if let Some(ack) = reply.ack {
            if let Ack::Advanced(n) = session.outbound.acknowledge(ack) {
                debug!("Session {}: {} fragment(s) acknowledged", id, n);
            }
            if session.outbound.is_closed() && session.outbound.is_drained() {
                info!("Session {}: close acknowledged", id);
                self.table.delete(id)?;
                return Ok(());
            }
        }

        match reply.kind {
            PacketKind::Data | PacketKind::Desauth => match session.inbound.accept(reply.seq) {
                Inbound::Deliver if reply.kind == PacketKind::Desauth => {
                    info!("Session {}: closed by relay", id);
                    return self.disconnect_client(id).await;
                }
                Inbound::Deliver => {
                    session.ack_pending = Some(reply.seq);
                    if let Some(pipe) = &session.pipe {
                        pipe.write(reply.payload.clone());
                    }
                }
                Inbound::Duplicate => session.ack_pending = Some(reply.seq),
                Inbound::Ahead => debug!("Session {}: seq {} ahead, dropped", id, reply.seq),
            },
            PacketKind::Err => {
                let message = reply.payload_str();
                warn!("Session {}: relay error: {}", id, message);
                if message == ERR_BAD_SESSION || message == ERR_AUTH_FAILED {
                    self.table.delete(id)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Apply a helper task notification
    pub fn handle_event(&mut self, event: Event) {
        let max_fragment = self.transceiver.max_payload();
        let owner = event.owner();
        let session = match self.table.find_owner_mut(owner) {
            Some(session) => session,
            None => {
                debug!("Session {} gone, stale event dropped", owner);
                return;
            }
        };

        match event {
            Event::Read(_, data) => {
                if session.outbound.push(&data, max_fragment).is_err() {
                    debug!("Session {}: {} bytes after close dropped", owner.id, data.len());
                }
            }
            Event::Closed(_) => {
                if session.outbound.push_abort().is_some() {
                    info!("Session {}: local side closed", owner.id);
                }
            }
            Event::Accepted(..) => debug!("Session {}: unexpected inbound peer", owner.id),
        }
    }

    /// Retransmit overdue queries, then start a new exchange on every idle
    /// ready session
    pub async fn flush(&mut self, now: Instant) -> Result<()> {
        let conn_timeout = self.config.conn_timeout;
        for (id, datagram) in transceive::check_for_resent(&mut self.table, now, conn_timeout) {
            debug!("Session {}: resending", id);
            self.transceiver.resend(&datagram).await?;
        }

        for session in self.table.iter_mut() {
            let pending = session.pending();
            if pending.data_pending || pending.nop_pending || session.state != SessionState::Ready {
                continue;
            }

            let (packet, seq) = match session.outbound.next_to_send(now, conn_timeout) {
                Some(entry) => {
                    let kind = match entry.fragment {
                        Fragment::Data(_) => PacketKind::Data,
                        Fragment::Abort => PacketKind::Desauth,
                    };
                    let packet = Packet::new(kind, Some(session.id))
                        .with_seq(entry.seq)
                        .with_payload(entry.payload());
                    (packet, Some(entry.seq))
                }
                None => {
                    let idle = now.saturating_duration_since(session.last_activity);
                    if session.ack_pending.is_none() && idle < self.config.poll_interval {
                        continue;
                    }
                    (Packet::new(PacketKind::Nop, Some(session.id)), None)
                }
            };

            let packet = packet.with_ack(session.ack_pending.take());
            let query = self.transceiver.send_query(&packet).await?;
            if let Some(seq) = seq {
                session.outbound.mark_sent(seq, now);
            }
            session.in_flight = Some(InFlight {
                query,
                sent_at: now,
                seq,
            });
        }

        Ok(())
    }

    /// Send `Disconnected` for every live session
    pub async fn shutdown(&mut self) {
        for id in self.table.ids() {
            if let Err(e) = self.disconnect_client(id).await {
                warn!("Session {}: {}", id, e);
            }
        }
    }

    /// Run until the work for the configured mode is done
    pub async fn run(mut self) -> Result<()> {
        let listener = if self.config.use_stdin {
            self.add_client(Local::Stdio).await?;
            None
        } else if self.config.is_local_port_forwarding {
            let port = self
                .config
                .local_port
                .ok_or_else(|| TunnelError::Config("local port missing".to_string()))?;
            let listener = TcpListener::bind(("127.0.0.1", port)).await?;
            info!("Forwarding 127.0.0.1:{} → {}", port, self.config.resource());
            Some(listener)
        } else {
            self.open_waiting().await?;
            info!(
                "Relay port {} forwarded to {}:{}",
                self.config.resource(),
                self.config.remote_host,
                self.config.remote_port
            );
            None
        };

        let mut tick = tokio::time::interval(self.config.poll_interval.min(MAX_TICK));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                res = accept(&listener) => {
                    let (stream, peer) = res?;
                    info!("Local connection from {}", peer);
                    if let Err(e) = self.add_client(Local::Tcp(stream)).await {
                        warn!("Cannot open session for {}: {}", peer, e);
                    }
                }
                res = self.transceiver.recv_reply() => self.on_reply(res).await?,
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = tick.tick() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, closing {} session(s)", self.table.len());
                    self.shutdown().await;
                    return Ok(());
                }
            }

            while let Some(reply) = self.try_recv_reply()? {
                self.on_reply(Ok(reply)).await?;
            }

            let now = Instant::now();
            self.poll_waiting(now).await?;
            self.flush(now).await?;

            if self.config.use_stdin && self.table.is_empty() {
                info!("Stream finished");
                return Ok(());
            }
        }
    }

    fn try_recv_reply(&self) -> Result<Option<(u16, Packet)>> {
        loop {
            match self.transceiver.try_recv_reply() {
                Err(TunnelError::Io(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    warn!("DNS server unreachable: {}", e);
                    return Ok(None);
                }
                Err(TunnelError::Io(e)) => return Err(e.into()),
                Err(e) => debug!("Dropping answer: {}", e),
                other => return other,
            }
        }
    }

    async fn on_reply(&mut self, res: Result<(u16, Packet)>) -> Result<()> {
        match res {
            Ok((dns_id, reply)) => self.handle_reply(dns_id, reply).await,
            Err(TunnelError::Io(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                warn!("DNS server unreachable: {}", e);
                Ok(())
            }
            Err(TunnelError::Io(e)) => Err(e.into()),
            Err(e) => {
                debug!("Dropping answer: {}", e);
                Ok(())
            }
        }
    }
}

async fn accept(listener: &Option<TcpListener>) -> io::Result<(TcpStream, std::net::SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}
