//! Per-session fragment queues
//!
//! [`OutboundQueue`] holds the byte stream not yet acknowledged by the peer,
//! cut into sequenced fragments. It is append-only at the tail and pop-only at
//! the head: an entry leaves only once it and everything before it has been
//! acknowledged.
//!
//! [`InboundWindow`] is the receiving half. It tracks the next expected
//! sequence number and sorts incoming fragments into deliver, duplicate and
//! ahead.
//!
//! Sequence numbers are `u16` and wrap. `a` precedes `b` when
//! `b - a (mod 2^16)` lies in `1..=0x7fff`.

use bytes::Bytes;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Returns `true` when `a` comes strictly before `b` in wrap-around space
#[inline]
pub fn seq_before(a: u16, b: u16) -> bool {
    let distance = b.wrapping_sub(a);
    distance != 0 && distance <= 0x7fff
}

/// Push after an abort was queued
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Queue closed by abort")]
pub struct QueueClosed;

/// Fragment contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Data(Bytes),
    /// Stream ends here, sequenced like data
    Abort,
}

/// One queued fragment
#[derive(Debug, Clone)]
pub struct Entry {
    pub seq: u16,
    pub fragment: Fragment,
    /// Last (re)transmission, `None` until first sent
    pub sent_at: Option<Instant>,
    pub acknowledged: bool,
}

impl Entry {
    pub fn is_abort(&self) -> bool {
        matches!(self.fragment, Fragment::Abort)
    }

    pub fn payload(&self) -> Bytes {
        match &self.fragment {
            Fragment::Data(data) => data.clone(),
            Fragment::Abort => Bytes::new(),
        }
    }
}

/// Result of [`OutboundQueue::acknowledge`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Head moved forward by this many entries
    Advanced(usize),
    /// Matched an entry behind an unacknowledged head
    Pending,
    /// No queued entry carries this sequence number
    Unknown,
}

/// Outbound fragments of one session
#[derive(Debug, Default)]
pub struct OutboundQueue {
    entries: VecDeque<Entry>,
    next_seq: u16,
    closed: bool,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` as fragments of at most `max_fragment` bytes
    ///
    /// Returns the number of fragments queued. A zero `max_fragment` is
    /// treated as one byte so no data is ever dropped.
    pub fn push(&mut self, data: &[u8], max_fragment: usize) -> Result<usize, QueueClosed> {
        if self.closed {
            return Err(QueueClosed);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let mut count = 0;
        for chunk in data.chunks(max_fragment.max(1)) {
            self.append(Fragment::Data(Bytes::copy_from_slice(chunk)));
            count += 1;
        }
        Ok(count)
    }

    fn append(&mut self, fragment: Fragment) -> u16 {
        let seq = self.next_seq;
        self.entries.push_back(Entry {
            seq,
            fragment,
            sent_at: None,
            acknowledged: false,
        });
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// Head entry if it may be (re)sent at `now`
    ///
    /// Only the head is ever eligible: one fragment in flight per session.
    pub fn next_to_send(&self, now: Instant, resend_after: Duration) -> Option<&Entry> {
        let head = self.entries.front()?;
        if head.acknowledged {
            return None;
        }
        match head.sent_at {
            None => Some(head),
            Some(sent) if now.saturating_duration_since(sent) >= resend_after => Some(head),
            Some(_) => None,
        }
    }

    /// Head entry whatever its timing
    pub fn head(&self) -> Option<&Entry> {
        self.entries.front()
    }

    pub fn mark_sent(&mut self, seq: u16, now: Instant) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.seq == seq) {
            entry.sent_at = Some(now);
        }
    }

    /// Mark `seq` acknowledged and pop every acknowledged entry at the head
    pub fn acknowledge(&mut self, seq: u16) -> Ack {
        let entry = match self.entries.iter_mut().find(|e| e.seq == seq) {
            Some(entry) => entry,
            None => return Ack::Unknown,
        };
        entry.acknowledged = true;

        let mut popped = 0;
        while self.entries.front().map_or(false, |e| e.acknowledged) {
            self.entries.pop_front();
            popped += 1;
        }

        if popped == 0 {
            Ack::Pending
        } else {
            Ack::Advanced(popped)
        }
    }

    /// Sequence number a control fragment would take, `None` once closed
    pub fn find_empty_data_cell(&self) -> Option<u16> {
        (!self.closed).then_some(self.next_seq)
    }

    /// Queue an abort after all data already queued
    ///
    /// Returns its sequence number, or `None` if an abort is already queued.
    pub fn push_abort(&mut self) -> Option<u16> {
        self.find_empty_data_cell()?;
        self.closed = true;
        Some(self.append(Fragment::Abort))
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_drained(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Classification of an incoming sequenced fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Next in order: deliver and acknowledge
    Deliver,
    /// Already delivered: acknowledge again, do not deliver
    Duplicate,
    /// Beyond the expected sequence: drop without acknowledging
    Ahead,
}

/// Receiving half of a session's stream
#[derive(Debug, Default, Clone, Copy)]
pub struct InboundWindow {
    expected: u16,
}

impl InboundWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expected(&self) -> u16 {
        self.expected
    }

    pub fn accept(&mut self, seq: u16) -> Inbound {
        if seq == self.expected {
            self.expected = self.expected.wrapping_add(1);
            Inbound::Deliver
        } else if seq_before(seq, self.expected) {
            Inbound::Duplicate
        } else {
            Inbound::Ahead
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(entry: &Entry) -> &[u8] {
        match &entry.fragment {
            Fragment::Data(d) => d,
            Fragment::Abort => panic!("abort fragment"),
        }
    }

    #[test]
    fn test_seq_before_wraps() {
        assert!(seq_before(1, 2));
        assert!(!seq_before(2, 1));
        assert!(!seq_before(5, 5));
        assert!(seq_before(u16::MAX, 0));
        assert!(seq_before(0xfff0, 0x0010));
    }

    #[test]
    fn test_push_fragments() {
        let mut queue = OutboundQueue::new();
        assert_eq!(queue.push(&[1u8; 25], 10), Ok(3));
        assert_eq!(queue.len(), 3);

        let sizes: Vec<usize> = queue.entries.iter().map(|e| data(e).len()).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        let seqs: Vec<u16> = queue.entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);

        assert_eq!(queue.push(&[], 10), Ok(0));
    }

    #[test]
    fn test_push_zero_fragment_size_keeps_data() {
        let mut queue = OutboundQueue::new();
        assert_eq!(queue.push(b"abc", 0), Ok(3));
        let bytes: Vec<u8> = queue.entries.iter().flat_map(|e| data(e).to_vec()).collect();
        assert_eq!(bytes, b"abc");
    }

    #[test]
    fn test_head_of_line_ack() {
        let now = Instant::now();
        let resend = Duration::from_secs(3);
        let mut queue = OutboundQueue::new();
        queue.push(b"a", 8).unwrap();
        queue.push(b"b", 8).unwrap();
        queue.push(b"c", 8).unwrap();

        assert_eq!(data(queue.next_to_send(now, resend).unwrap()), b"a");

        // b acknowledged first: a stays at the head
        assert_eq!(queue.acknowledge(1), Ack::Pending);
        assert_eq!(data(queue.head().unwrap()), b"a");
        assert_eq!(queue.len(), 3);

        // a releases both
        assert_eq!(queue.acknowledge(0), Ack::Advanced(2));
        assert_eq!(data(queue.next_to_send(now, resend).unwrap()), b"c");

        assert_eq!(queue.acknowledge(0), Ack::Unknown);
        assert_eq!(queue.acknowledge(2), Ack::Advanced(1));
        assert!(queue.is_drained());
    }

    #[test]
    fn test_resend_timing() {
        let start = Instant::now();
        let resend = Duration::from_secs(3);
        let mut queue = OutboundQueue::new();
        queue.push(b"xyz", 8).unwrap();

        queue.mark_sent(0, start);
        assert!(queue.next_to_send(start + Duration::from_secs(1), resend).is_none());
        let entry = queue.next_to_send(start + resend, resend).unwrap();
        assert_eq!(entry.seq, 0);
        assert_eq!(data(entry), b"xyz");
        // head() ignores timing
        assert!(queue.head().is_some());
    }

    #[test]
    fn test_only_head_is_sent() {
        let now = Instant::now();
        let mut queue = OutboundQueue::new();
        queue.push(&[0u8; 20], 10).unwrap();
        queue.mark_sent(0, now);

        // second fragment waits behind the outstanding head
        assert!(queue.next_to_send(now, Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_abort_after_data() {
        let now = Instant::now();
        let mut queue = OutboundQueue::new();
        queue.push(b"last words", 4).unwrap();

        assert_eq!(queue.find_empty_data_cell(), Some(3));
        assert_eq!(queue.push_abort(), Some(3));
        assert_eq!(queue.find_empty_data_cell(), None);
        assert_eq!(queue.push_abort(), None);
        assert_eq!(queue.push(b"more", 4), Err(QueueClosed));

        let mut order = Vec::new();
        while let Some(entry) = queue.next_to_send(now, Duration::ZERO) {
            order.push(entry.is_abort());
            let seq = entry.seq;
            queue.acknowledge(seq);
        }
        assert_eq!(order, vec![false, false, false, true]);
        assert!(queue.is_drained());
    }

    #[test]
    fn test_sequence_wraps() {
        let mut queue = OutboundQueue::new();
        queue.next_seq = u16::MAX;
        queue.push(&[0u8; 3], 1).unwrap();
        let seqs: Vec<u16> = queue.entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![u16::MAX, 0, 1]);
    }

    #[test]
    fn test_inbound_window() {
        let mut window = InboundWindow::new();
        assert_eq!(window.accept(0), Inbound::Deliver);
        assert_eq!(window.accept(0), Inbound::Duplicate);
        assert_eq!(window.accept(2), Inbound::Ahead);
        assert_eq!(window.accept(1), Inbound::Deliver);
        assert_eq!(window.expected(), 2);
    }

    #[test]
    fn test_inbound_window_wraps() {
        let mut window = InboundWindow { expected: u16::MAX };
        assert_eq!(window.accept(u16::MAX), Inbound::Deliver);
        assert_eq!(window.expected(), 0);
        assert_eq!(window.accept(u16::MAX), Inbound::Duplicate);
        assert_eq!(window.accept(0), Inbound::Deliver);
        assert_eq!(window.accept(5), Inbound::Ahead);
    }
}
