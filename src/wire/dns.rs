//! Minimal DNS codec
//!
//! Parses exactly what the interceptor needs from a query and builds the
//! fixed answer. The answer copies the transaction ID and the question
//! section byte-for-byte, then appends one `A` record whose owner name is a
//! compression pointer back to the question at offset 12.
//!
//! ```text
//! +---------+----------------------------+---------------------------------+
//! | header  | question (verbatim)        | answer                          |
//! | 12 B    | QNAME QTYPE QCLASS         | C0 0C | A | IN | TTL | 4 | addr |
//! +---------+----------------------------+---------------------------------+
//! ```
//!
//! # Example
//!
//! ```
//! use std::net::Ipv4Addr;
//! use captive_portal::wire::dns::{build_answer, DnsQuery};
//!
//! let query = [
//!     0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
//!     0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00,
//!     0x00, 0x01, 0x00, 0x01,
//! ];
//! let parsed = DnsQuery::parse(&query).unwrap();
//! assert_eq!(parsed.requested_name(), "example.com");
//!
//! let answer = build_answer(&parsed, Ipv4Addr::new(192, 168, 1, 1), 60);
//! assert_eq!(&answer[..2], &[0x12, 0x34]);
//! assert_eq!(&answer[answer.len() - 4..], &[192, 168, 1, 1]);
//! ```

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};

use super::error::{WireError, WireResult};

/// Size of the fixed DNS header
pub const DNS_HEADER_SIZE: usize = 12;

/// Maximum length of a single label (RFC 1035 2.3.4)
pub const MAX_LABEL_LENGTH: usize = 63;

/// Maximum length of an encoded name including length octets
pub const MAX_NAME_LENGTH: usize = 255;

/// TTL used when none is configured
pub const DEFAULT_ANSWER_TTL: u32 = 60;

/// Record type A
pub const TYPE_A: u16 = 1;

/// Class IN
pub const CLASS_IN: u16 = 1;

/// Compression pointer to the question name at offset 12
const NAME_POINTER: u16 = 0xC000 | DNS_HEADER_SIZE as u16;

const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;
const OPCODE_SHIFT: u16 = 11;
const OPCODE_MASK: u16 = 0x0F;

/// Length of the appended answer record
const ANSWER_RECORD_LEN: usize = 2 + 2 + 2 + 4 + 2 + 4;

/// A validated standard query
///
/// Borrows the datagram it was parsed from so the question section can be
/// echoed without re-encoding.
#[derive(Debug, Clone)]
pub struct DnsQuery<'a> {
    raw: &'a [u8],
    transaction_id: u16,
    flags: u16,
    question_end: usize,
    requested_name: String,
    question_type: u16,
    question_class: u16,
}

impl<'a> DnsQuery<'a> {
    /// Parse and validate a query datagram
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] if the datagram is shorter than the header,
    /// is a response, uses a non-zero opcode, does not carry exactly one
    /// question, or contains a label longer than 63 bytes or running past
    /// the end of the buffer.
    pub fn parse(raw: &'a [u8]) -> WireResult<Self> {
        if raw.len() < DNS_HEADER_SIZE {
            return Err(WireError::TooShort {
                len: raw.len(),
                min: DNS_HEADER_SIZE,
            });
        }

        let transaction_id = read_u16(raw, 0);
        let flags = read_u16(raw, 2);

        if flags & FLAG_QR != 0 {
            return Err(WireError::NotAQuery);
        }

        #[allow(clippy::cast_possible_truncation)]
        let opcode = ((flags >> OPCODE_SHIFT) & OPCODE_MASK) as u8;
        if opcode != 0 {
            return Err(WireError::UnsupportedOpcode(opcode));
        }

        let qdcount = read_u16(raw, 4);
        if qdcount != 1 {
            return Err(WireError::QuestionCount(qdcount));
        }

        let (requested_name, name_end) = parse_name(raw, DNS_HEADER_SIZE)?;

        let question_end = name_end + 4;
        if question_end > raw.len() {
            return Err(WireError::Truncated { offset: name_end });
        }

        Ok(Self {
            raw,
            transaction_id,
            flags,
            question_end,
            requested_name,
            question_type: read_u16(raw, name_end),
            question_class: read_u16(raw, name_end + 2),
        })
    }

    /// Transaction ID from the header
    #[must_use]
    pub const fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    /// Dotted name from the question, `"."` for the root
    #[must_use]
    pub fn requested_name(&self) -> &str {
        &self.requested_name
    }

    /// QTYPE of the question
    #[must_use]
    pub const fn question_type(&self) -> u16 {
        self.question_type
    }

    /// QCLASS of the question
    #[must_use]
    pub const fn question_class(&self) -> u16 {
        self.question_class
    }

    /// Whether the client asked for recursion
    #[must_use]
    pub const fn recursion_desired(&self) -> bool {
        self.flags & FLAG_RD != 0
    }

    /// Question section bytes exactly as received
    #[must_use]
    pub fn question_section(&self) -> &'a [u8] {
        &self.raw[DNS_HEADER_SIZE..self.question_end]
    }
}

/// Build the fixed answer for a parsed query
///
/// Flags are "standard response, no error" with the client's RD bit echoed.
/// Authority and additional sections are always empty.
#[must_use]
pub fn build_answer(query: &DnsQuery<'_>, address: Ipv4Addr, ttl: u32) -> Bytes {
    let question = query.question_section();
    let mut buf = BytesMut::with_capacity(DNS_HEADER_SIZE + question.len() + ANSWER_RECORD_LEN);

    buf.put_u16(query.transaction_id);
    buf.put_u16(FLAG_QR | (query.flags & FLAG_RD));
    // One question in, one answer out
    buf.put_u16(1);
    buf.put_u16(1);
    buf.put_u16(0);
    buf.put_u16(0);

    buf.put_slice(question);

    buf.put_u16(NAME_POINTER);
    buf.put_u16(TYPE_A);
    buf.put_u16(CLASS_IN);
    buf.put_u32(ttl);
    buf.put_u16(4);
    buf.put_slice(&address.octets());

    buf.freeze()
}

/// Parse a datagram and build its answer in one step
///
/// Returns `None` for anything that must not be answered.
#[must_use]
pub fn answer_for(datagram: &[u8], address: Ipv4Addr, ttl: u32) -> Option<Bytes> {
    DnsQuery::parse(datagram)
        .ok()
        .map(|query| build_answer(&query, address, ttl))
}

/// Walk length-prefixed labels starting at `offset`
///
/// Returns the dotted name and the offset just past the terminating zero
/// label.
fn parse_name(raw: &[u8], offset: usize) -> WireResult<(String, usize)> {
    let mut pos = offset;
    let mut name = String::new();

    loop {
        let Some(&len_byte) = raw.get(pos) else {
            return Err(WireError::Truncated { offset: pos });
        };
        let len = usize::from(len_byte);

        if len == 0 {
            pos += 1;
            break;
        }
        if len > MAX_LABEL_LENGTH {
            return Err(WireError::LabelTooLong { offset: pos, len });
        }

        let label_start = pos + 1;
        let label_end = label_start + len;
        if label_end > raw.len() {
            return Err(WireError::Truncated { offset: pos });
        }

        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(&raw[label_start..label_end]));

        pos = label_end;
        // Length octets and label bytes so far, plus the root label still to come
        let wire_len = pos - offset + 1;
        if wire_len > MAX_NAME_LENGTH {
            return Err(WireError::NameTooLong(wire_len));
        }
    }

    if name.is_empty() {
        name.push('.');
    }

    Ok((name, pos))
}

fn read_u16(raw: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([raw[offset], raw[offset + 1]])
}
