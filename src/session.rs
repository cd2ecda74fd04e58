//! Session table
//!
//! Sessions multiplex independent streams over the one DNS channel. The table
//! owns every session together with its queues and local endpoint; removing
//! a session from the table is the only way to destroy it.
//!
//! Iteration follows session id order. The `current` cursor walks that order
//! and moves to the next live session when the current one is deleted.

use log::{debug, info};
use rand::Rng;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::auth::{self, AuthError};
use crate::packet::SessionId;
use crate::pipe::{Owner, Pipe};
use crate::queue::{InboundWindow, OutboundQueue};
use crate::transceive::SentQuery;
use crate::{Result, TunnelError};

/// Random id draws before giving up
const MAX_ID_ATTEMPTS: usize = 64;

/// Session lifecycle
///
/// The relay walks `Challenged → Authenticated → Connected → Terminated`;
/// the client walks `Init → Connected → Ready → Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Challenged,
    Authenticated,
    /// Relay: resource bound or connected. Client: relay accepted the resource.
    Connected,
    /// Client: resource reachable, stream flowing
    Ready,
    Terminated,
}

/// Outstanding exchange flags, derived from [`Session::in_flight`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Pending {
    pub data_pending: bool,
    pub nop_pending: bool,
}

/// The one query a client session has in flight
#[derive(Debug, Clone)]
pub struct InFlight {
    pub query: SentQuery,
    pub sent_at: Instant,
    /// Sequence number of the data fragment carried, if any
    pub seq: Option<u16>,
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    /// Distinguishes this session from earlier ones that held the same id
    pub generation: u64,
    pub resource: String,
    pub is_local_port_forwarding: bool,
    pub state: SessionState,
    pub challenge: String,
    pub outbound: OutboundQueue,
    pub inbound: InboundWindow,
    pub pipe: Option<Pipe>,
    /// Accept task while waiting for the inbound peer in bind mode
    pub listener: Option<JoinHandle<()>>,
    pub last_activity: Instant,
    pub in_flight: Option<InFlight>,
    /// Peer fragment to acknowledge with the next request
    pub ack_pending: Option<u16>,
}

impl Session {
    pub fn new(id: SessionId, resource: &str, state: SessionState) -> Self {
        Self {
            id,
            generation: Owner::next(id).generation,
            resource: resource.to_string(),
            is_local_port_forwarding: false,
            state,
            challenge: String::new(),
            outbound: OutboundQueue::new(),
            inbound: InboundWindow::new(),
            pipe: None,
            listener: None,
            last_activity: Instant::now(),
            in_flight: None,
            ack_pending: None,
        }
    }

    /// Tag for helper tasks spawned on behalf of this session
    pub fn owner(&self) -> Owner {
        Owner {
            id: self.id,
            generation: self.generation,
        }
    }

    /// What the query in flight is waiting for
    pub fn pending(&self) -> Pending {
        match &self.in_flight {
            Some(in_flight) => Pending {
                data_pending: in_flight.seq.is_some(),
                nop_pending: in_flight.seq.is_none(),
            },
            None => Pending::default(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.state,
            SessionState::Authenticated | SessionState::Connected | SessionState::Ready
        )
    }

    /// Release the local endpoint: write side, read side, then any listener
    pub fn close(&mut self) {
        if let Some(mut pipe) = self.pipe.take() {
            pipe.close();
        }
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        self.in_flight = None;
        self.state = SessionState::Terminated;
    }
}

#[derive(Debug)]
pub struct SessionTable {
    sessions: BTreeMap<SessionId, Session>,
    current: Option<SessionId>,
    max_sessions: usize,
}

impl SessionTable {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: BTreeMap::new(),
            current: None,
            max_sessions,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    /// New relay session under a random unused id, challenge issued
    pub fn create_session(&mut self, resource: &str) -> Result<SessionId> {
        if self.sessions.len() >= self.max_sessions {
            return Err(TunnelError::Exhausted);
        }

        let id = self.random_free_id().or_else(|| self.first_free_id());
        let id = id.ok_or(TunnelError::Exhausted)?;

        let mut session = Session::new(id, resource, SessionState::Challenged);
        session.challenge = auth::new_challenge();
        self.sessions.insert(id, session);
        if self.current.is_none() {
            self.current = Some(id);
        }
        info!("Session {} created ({} live)", id, self.sessions.len());
        Ok(id)
    }

    fn random_free_id(&self) -> Option<SessionId> {
        let mut rng = rand::thread_rng();
        (0..MAX_ID_ATTEMPTS)
            .filter_map(|_| SessionId::new(rng.gen()))
            .find(|id| !self.sessions.contains_key(id))
    }

    /// Lowest unused id, for a table too crowded for random draws
    fn first_free_id(&self) -> Option<SessionId> {
        (1..=u16::MAX)
            .filter_map(SessionId::new)
            .find(|id| !self.sessions.contains_key(id))
    }

    /// Insert a session whose id was assigned by the peer
    pub fn insert_with_id(&mut self, session: Session) -> Result<()> {
        let id = session.id;
        if self.sessions.contains_key(&id) {
            self.delete(id)?;
        } else if self.sessions.len() >= self.max_sessions {
            return Err(TunnelError::Exhausted);
        }

        self.sessions.insert(id, session);
        if self.current.is_none() {
            self.current = Some(id);
        }
        Ok(())
    }

    pub fn find_by_id(&self, id: SessionId) -> Result<&Session> {
        self.sessions.get(&id).ok_or(TunnelError::NotFound(id))
    }

    pub fn find_by_id_mut(&mut self, id: SessionId) -> Result<&mut Session> {
        self.sessions.get_mut(&id).ok_or(TunnelError::NotFound(id))
    }

    /// Session `owner` was spawned for, if it is still the live holder of the id
    pub fn find_owner_mut(&mut self, owner: Owner) -> Option<&mut Session> {
        self.sessions
            .get_mut(&owner.id)
            .filter(|s| s.generation == owner.generation)
    }

    /// Session `id` if it passed the challenge
    pub fn require_authenticated(&mut self, id: SessionId) -> Result<&mut Session> {
        let session = self.find_by_id_mut(id)?;
        if !session.is_authenticated() {
            return Err(AuthError::NotAuthenticated.into());
        }
        Ok(session)
    }

    /// Close and remove a session, moving the cursor off it
    pub fn delete(&mut self, id: SessionId) -> Result<Session> {
        let mut session = self.sessions.remove(&id).ok_or(TunnelError::NotFound(id))?;
        session.close();

        if self.current == Some(id) {
            self.current = self.next_after(id);
        }
        debug!("Session {} deleted ({} live)", id, self.sessions.len());
        Ok(session)
    }

    pub fn current(&self) -> Option<SessionId> {
        self.current
    }

    pub fn set_current(&mut self, id: SessionId) -> Result<()> {
        if !self.sessions.contains_key(&id) {
            return Err(TunnelError::NotFound(id));
        }
        self.current = Some(id);
        Ok(())
    }

    /// Move the cursor to the next live session, wrapping around
    pub fn advance_current(&mut self) -> Option<SessionId> {
        self.current = match self.current {
            Some(id) => self.next_after(id),
            None => self.sessions.keys().next().copied(),
        };
        self.current
    }

    fn next_after(&self, id: SessionId) -> Option<SessionId> {
        self.sessions
            .range((std::ops::Bound::Excluded(id), std::ops::Bound::Unbounded))
            .next()
            .or_else(|| self.sessions.iter().next())
            .map(|(id, _)| *id)
    }

    /// Sessions silent for at least `idle_timeout`
    pub fn expired(&self, now: Instant, idle_timeout: Duration) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.last_activity) >= idle_timeout)
            .map(|s| s.id)
            .collect()
    }

    /// Delete every expired session
    pub fn evict_idle(&mut self, now: Instant, idle_timeout: Duration) -> Vec<Session> {
        self.expired(now, idle_timeout)
            .into_iter()
            .filter_map(|id| {
                info!("Session {} idle, evicting", id);
                self.delete(id).ok()
            })
            .collect()
    }
}
