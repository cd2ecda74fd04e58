//! DNS carrier for tunnel packets
//!
//! Implements just enough of the DNS protocol to:
//! - Build TXT queries whose name carries a base32 packet (upstream)
//! - Answer them with a single TXT record carrying a base32 packet (downstream)
//! - Parse both directions and refuse anything outside the tunnel zone
//!
//! Size budgets are derived here so that a packet always fits the carrier:
//! a query name is limited to 253 characters in labels of 63, and a response
//! has to fit a plain 512-byte UDP datagram whatever the question size.

use bytes::{Buf, BufMut, BytesMut};
use std::io::Cursor;
use thiserror::Error;

use crate::base32;

/// Maximum DNS label length (RFC 1035)
pub const MAX_DNS_LABEL_LEN: usize = 63;

/// Maximum DNS name length in presentation form (RFC 1035)
pub const MAX_DNS_NAME_LEN: usize = 253;

/// Maximum DNS UDP packet size without EDNS (RFC 1035)
pub const MAX_DNS_UDP_SIZE: usize = 512;

/// Longest question section: 255 octets of wire name + QTYPE + QCLASS
const MAX_QUESTION_LEN: usize = 255 + 4;

/// NAME ptr + TYPE + CLASS + TTL + RDLENGTH
const RR_OVERHEAD: usize = 12;

const HEADER_LEN: usize = 12;

/// Longest TXT character-string
const MAX_TXT_STRING: usize = 255;

const QTYPE_TXT: u16 = 16;
const QCLASS_IN: u16 = 1;

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_RD: u16 = 0x0100;
const RCODE_MASK: u16 = 0x000f;
const RCODE_REFUSED: u16 = 5;

/// Packet octets per response, whatever the question size
///
/// 512 - header - longest question - RR overhead, minus two TXT length bytes
/// leaves 227 characters, which hold 28 base32 sequences.
pub const DOWNSTREAM_BUDGET: usize = base32::decoded_capacity(
    MAX_DNS_UDP_SIZE - HEADER_LEN - MAX_QUESTION_LEN - RR_OVERHEAD - 2,
);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    #[error("Truncated DNS message")]
    Truncated,

    #[error("Invalid label in domain name")]
    BadLabel,

    #[error("Name outside the tunnel domain: {0}")]
    WrongDomain(String),

    #[error("No TXT answer in response")]
    NoAnswer,

    #[error("Domain name too long: {0} bytes")]
    NameTooLong(usize),

    #[error("Unexpected message direction")]
    WrongDirection,

    #[error("DNS error response, rcode {0}")]
    Rcode(u16),
}

pub type Result<T> = std::result::Result<T, DnsError>;

/// DNS message header (12 bytes)
#[derive(Debug, Clone, Copy)]
struct DnsHeader {
    id: u16,
    flags: u16,
    qdcount: u16,
    ancount: u16,
    nscount: u16,
    arcount: u16,
}

impl DnsHeader {
    fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(DnsError::Truncated);
        }

        Ok(Self {
            id: buf.get_u16(),
            flags: buf.get_u16(),
            qdcount: buf.get_u16(),
            ancount: buf.get_u16(),
            nscount: buf.get_u16(),
            arcount: buf.get_u16(),
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(self.id);
        buf.put_u16(self.flags);
        buf.put_u16(self.qdcount);
        buf.put_u16(self.ancount);
        buf.put_u16(self.nscount);
        buf.put_u16(self.arcount);
    }

    fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }
}

/// Question of an incoming query, kept verbatim for the answer
#[derive(Debug, Clone)]
pub struct Query {
    pub id: u16,
    pub qname: String,
    pub qtype: u16,
    flags: u16,
    question: Vec<u8>,
}

impl Query {
    /// Parse the first question of a query datagram
    pub fn parse(datagram: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(datagram);
        let header = DnsHeader::parse(&mut cursor)?;
        if header.is_response() {
            return Err(DnsError::WrongDirection);
        }
        if header.qdcount == 0 {
            return Err(DnsError::Truncated);
        }

        let start = cursor.position() as usize;
        let qname = read_domain_name(&mut cursor)?;
        if cursor.remaining() < 4 {
            return Err(DnsError::Truncated);
        }
        let qtype = cursor.get_u16();
        let _qclass = cursor.get_u16();
        let end = cursor.position() as usize;

        Ok(Self {
            id: header.id,
            qname,
            qtype,
            flags: header.flags,
            question: datagram[start..end].to_vec(),
        })
    }

    fn response_header(&self, rcode: u16, ancount: u16) -> DnsHeader {
        DnsHeader {
            id: self.id,
            flags: FLAG_QR | FLAG_AA | (self.flags & FLAG_RD) | rcode,
            qdcount: 1,
            ancount,
            nscount: 0,
            arcount: 0,
        }
    }

    /// Answer with one TXT record holding `text`
    pub fn txt_response(&self, text: &str) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(MAX_DNS_UDP_SIZE);
        self.response_header(0, 1).write(&mut buf);
        buf.put_slice(&self.question);

        let strings: Vec<&[u8]> = text.as_bytes().chunks(MAX_TXT_STRING).collect();
        let rdlength = text.len() + strings.len().max(1);

        buf.put_u16(0xc00c); // NAME: pointer to question
        buf.put_u16(QTYPE_TXT);
        buf.put_u16(QCLASS_IN);
        buf.put_u32(0); // TTL: never cache
        buf.put_u16(rdlength as u16);
        if strings.is_empty() {
            buf.put_u8(0);
        }
        for string in strings {
            buf.put_u8(string.len() as u8);
            buf.put_slice(string);
        }

        buf.to_vec()
    }

    /// Answer REFUSED, for names outside the tunnel zone
    pub fn refused(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.question.len());
        self.response_header(RCODE_REFUSED, 0).write(&mut buf);
        buf.put_slice(&self.question);
        buf.to_vec()
    }
}

/// Build a TXT query for `qname`
pub fn build_query(id: u16, qname: &str) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + qname.len() + 6);
    DnsHeader {
        id,
        flags: FLAG_RD,
        qdcount: 1,
        ancount: 0,
        nscount: 0,
        arcount: 0,
    }
    .write(&mut buf);
    write_domain_name(qname, &mut buf)?;
    buf.put_u16(QTYPE_TXT);
    buf.put_u16(QCLASS_IN);
    Ok(buf.to_vec())
}

/// Parse a response, returning its id and the text of its TXT answers
pub fn parse_txt_response(datagram: &[u8]) -> Result<(u16, String)> {
    let mut cursor = Cursor::new(datagram);
    let header = DnsHeader::parse(&mut cursor)?;
    if !header.is_response() {
        return Err(DnsError::WrongDirection);
    }
    let rcode = header.flags & RCODE_MASK;
    if rcode != 0 {
        return Err(DnsError::Rcode(rcode));
    }

    for _ in 0..header.qdcount {
        read_domain_name(&mut cursor)?;
        if cursor.remaining() < 4 {
            return Err(DnsError::Truncated);
        }
        cursor.advance(4);
    }

    let mut text = String::new();
    let mut found = false;
    for _ in 0..header.ancount {
        read_domain_name(&mut cursor)?;
        if cursor.remaining() < 10 {
            return Err(DnsError::Truncated);
        }
        let rtype = cursor.get_u16();
        let _rclass = cursor.get_u16();
        let _ttl = cursor.get_u32();
        let rdlength = cursor.get_u16() as usize;
        if cursor.remaining() < rdlength {
            return Err(DnsError::Truncated);
        }

        let start = cursor.position() as usize;
        let rdata = &datagram[start..start + rdlength];
        cursor.advance(rdlength);
        if rtype != QTYPE_TXT {
            continue;
        }

        let mut strings = rdata;
        while strings.has_remaining() {
            let len = strings.get_u8() as usize;
            if strings.remaining() < len {
                return Err(DnsError::Truncated);
            }
            text.push_str(std::str::from_utf8(&strings[..len]).map_err(|_| DnsError::BadLabel)?);
            strings.advance(len);
        }
        found = true;
    }

    if !found {
        return Err(DnsError::NoAnswer);
    }
    Ok((header.id, text))
}

/// Read a domain name, stopping at a compression pointer
fn read_domain_name(buf: &mut Cursor<&[u8]>) -> Result<String> {
    let mut labels = Vec::new();

    loop {
        if !buf.has_remaining() {
            return Err(DnsError::Truncated);
        }

        let len = buf.get_u8();
        if len == 0 {
            break;
        }

        // Compression pointer ends the name
        if len & 0xc0 == 0xc0 {
            if !buf.has_remaining() {
                return Err(DnsError::Truncated);
            }
            buf.get_u8();
            break;
        }
        if len as usize > MAX_DNS_LABEL_LEN {
            return Err(DnsError::BadLabel);
        }

        let label_len = len as usize;
        if buf.remaining() < label_len {
            return Err(DnsError::Truncated);
        }
        let mut label = vec![0u8; label_len];
        buf.copy_to_slice(&mut label);
        labels.push(String::from_utf8(label).map_err(|_| DnsError::BadLabel)?);
    }

    Ok(labels.join("."))
}

fn write_domain_name(domain: &str, buf: &mut BytesMut) -> Result<()> {
    let domain = domain.trim_end_matches('.');
    if domain.len() > MAX_DNS_NAME_LEN {
        return Err(DnsError::NameTooLong(domain.len()));
    }
    for label in domain.split('.').filter(|l| !l.is_empty()) {
        let len = u8::try_from(label.len())
            .ok()
            .filter(|&len| len as usize <= MAX_DNS_LABEL_LEN)
            .ok_or(DnsError::BadLabel)?;
        buf.put_u8(len);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
    Ok(())
}

/// Check that `domain` can serve as a tunnel zone
///
/// Every label must be 1 to 63 ASCII characters, and the zone must leave
/// room in a query name for at least one packet header.
pub fn check_zone(domain: &str) -> Result<()> {
    let zone = domain.trim_matches('.');
    if zone.is_empty() || !zone.is_ascii() {
        return Err(DnsError::BadLabel);
    }
    if zone
        .split('.')
        .any(|label| label.is_empty() || label.len() > MAX_DNS_LABEL_LEN)
    {
        return Err(DnsError::BadLabel);
    }
    if zone.len() > MAX_DNS_NAME_LEN {
        return Err(DnsError::NameTooLong(zone.len()));
    }
    Ok(())
}

/// Maps packets to query names and TXT text for one tunnel zone
#[derive(Debug, Clone)]
pub struct DnsCodec {
    /// Tunnel zone, e.g. "tunnel.example.com"
    domain: String,
}

impl DnsCodec {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.trim_matches('.').to_ascii_lowercase(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Packet octets that fit in one query name under this zone
    pub fn upstream_budget(&self) -> usize {
        let available = MAX_DNS_NAME_LEN.saturating_sub(self.domain.len() + 1);
        // one dot for every full label
        let chars = available * MAX_DNS_LABEL_LEN / (MAX_DNS_LABEL_LEN + 1);
        base32::decoded_capacity(chars)
    }

    /// Packet octets that fit in one TXT answer
    pub fn downstream_budget(&self) -> usize {
        DOWNSTREAM_BUDGET
    }

    /// `<base32 labels>.<domain>`, padding stripped
    pub fn encode_query_name(&self, packet: &[u8]) -> Result<String> {
        let encoded = base32::encode(packet);
        let encoded = encoded.trim_end_matches(base32::PADDING_CHAR as char);

        let mut name = String::with_capacity(MAX_DNS_NAME_LEN);
        for label in encoded.as_bytes().chunks(MAX_DNS_LABEL_LEN) {
            name.push_str(std::str::from_utf8(label).map_err(|_| DnsError::BadLabel)?);
            name.push('.');
        }
        name.push_str(&self.domain);

        if name.len() > MAX_DNS_NAME_LEN {
            return Err(DnsError::NameTooLong(name.len()));
        }
        Ok(name)
    }

    /// Extract the packet from a query name of this zone
    pub fn decode_query_name(&self, qname: &str) -> Result<Vec<u8>> {
        let qname = qname.trim_end_matches('.');
        if !qname.is_ascii() {
            return Err(DnsError::WrongDomain(qname.to_string()));
        }
        let split = qname
            .len()
            .checked_sub(self.domain.len() + 1)
            .ok_or_else(|| DnsError::WrongDomain(qname.to_string()))?;

        let (prefix, suffix) = qname.split_at(split);
        if !suffix.starts_with('.') || !suffix[1..].eq_ignore_ascii_case(&self.domain) {
            return Err(DnsError::WrongDomain(qname.to_string()));
        }

        Ok(base32::decode(&prefix.replace('.', "")))
    }

    /// TXT text for a reply packet
    pub fn encode_answer(&self, packet: &[u8]) -> String {
        base32::encode(packet)
            .trim_end_matches(base32::PADDING_CHAR as char)
            .to_string()
    }

    pub fn decode_answer(&self, text: &str) -> Vec<u8> {
        base32::decode(text)
    }
}
