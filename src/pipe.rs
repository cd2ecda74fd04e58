//! Local endpoint plumbing
//!
//! A [`Pipe`] joins one session to its local byte stream: a TCP connection,
//! or stdin/stdout where the read and write sides are distinct handles.
//! Reads are forwarded to the owning event loop as [`Event`]s; writes go
//! through an unbounded channel to a writer task so the loop never waits on a
//! slow local peer.

use bytes::Bytes;
use log::{debug, warn};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::packet::SessionId;

/// Read chunk size for local endpoints
pub const READ_CHUNK: usize = 4096;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// The session incarnation a helper task works for
///
/// Session ids are reused, so events also carry the generation the session
/// was created with. Events from an earlier holder of the same id are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Owner {
    pub id: SessionId,
    pub generation: u64,
}

impl Owner {
    /// New owner for `id` with a generation never handed out before
    pub fn next(id: SessionId) -> Self {
        Self {
            id,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.generation)
    }
}

/// Notifications from helper tasks to the event loop that owns the sessions
#[derive(Debug)]
pub enum Event {
    /// Bytes read from the local side of a session
    Read(Owner, Bytes),
    /// Local side reached EOF or failed
    Closed(Owner),
    /// Inbound peer for a session listening in bind mode
    Accepted(Owner, TcpStream),
}

impl Event {
    pub fn owner(&self) -> Owner {
        match self {
            Self::Read(owner, _) | Self::Closed(owner) | Self::Accepted(owner, _) => *owner,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Read and write halves of one local endpoint
#[derive(Debug)]
pub struct Pipe {
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    reader: Option<JoinHandle<()>>,
}

impl Pipe {
    /// Spawn the reader and writer tasks for `owner`
    pub fn spawn<R, W>(owner: Owner, reader: R, writer: W, events: EventSender) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(owner, writer, rx, events.clone()));
        let reader = tokio::spawn(read_loop(owner, reader, events));

        Self {
            writer: Some(tx),
            reader: Some(reader),
        }
    }

    pub fn tcp(owner: Owner, stream: TcpStream, events: EventSender) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self::spawn(owner, read_half, write_half, events)
    }

    pub fn stdio(owner: Owner, events: EventSender) -> Self {
        Self::spawn(owner, tokio::io::stdin(), tokio::io::stdout(), events)
    }

    /// Queue bytes for the local side. Returns `false` once closed.
    pub fn write(&self, data: Bytes) -> bool {
        match &self.writer {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        }
    }

    /// Close the write side, then the read side
    ///
    /// The writer task still flushes what was queued before shutting its half
    /// down.
    pub fn close(&mut self) {
        self.writer.take();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop<R>(owner: Owner, mut reader: R, events: EventSender)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Session {}: local EOF", owner.id);
                break;
            }
            Ok(n) => {
                if events
                    .send(Event::Read(owner, Bytes::copy_from_slice(&buf[..n])))
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                warn!("Session {}: local read error: {}", owner.id, e);
                break;
            }
        }
    }
    let _ = events.send(Event::Closed(owner));
}

async fn write_loop<W>(
    owner: Owner,
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    events: EventSender,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(data) = rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            warn!("Session {}: local write error: {}", owner.id, e);
            let _ = events.send(Event::Closed(owner));
            return;
        }
        if let Err(e) = writer.flush().await {
            warn!("Session {}: local flush error: {}", owner.id, e);
            let _ = events.send(Event::Closed(owner));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn owner() -> Owner {
        Owner {
            id: SessionId::new(0x42).unwrap(),
            generation: 7,
        }
    }

    #[tokio::test]
    async fn test_reads_become_events() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (local, mut peer) = duplex(64);
        let (read_half, write_half) = tokio::io::split(local);
        let _pipe = Pipe::spawn(owner(), read_half, write_half, events_tx);

        peer.write_all(b"hello").await.unwrap();
        match events_rx.recv().await.unwrap() {
            Event::Read(from, data) => {
                assert_eq!(from, owner());
                assert_eq!(&data[..], b"hello");
            }
            other => panic!("unexpected event {:?}", other),
        }

        drop(peer);
        assert!(matches!(events_rx.recv().await, Some(Event::Closed(_))));
    }

    #[tokio::test]
    async fn test_close_flushes_then_shuts_down() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (local, mut peer) = duplex(64);
        let (read_half, write_half) = tokio::io::split(local);
        let mut pipe = Pipe::spawn(owner(), read_half, write_half, events_tx);

        assert!(pipe.write(Bytes::from_static(b"bye")));
        pipe.close();
        assert!(pipe.is_closed());
        assert!(!pipe.write(Bytes::from_static(b"late")));

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");
    }

    #[test]
    fn test_owner_generations_unique() {
        let id = SessionId::new(9).unwrap();
        let first = Owner::next(id);
        let second = Owner::next(id);
        assert_eq!(first.id, second.id);
        assert_ne!(first, second);
        assert!(first.to_string().starts_with("0009#"));
    }
}
