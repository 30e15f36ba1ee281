//! LDAPMessage envelope: message id access and rewriting.

use bytes::{BufMut, Bytes, BytesMut};

use crate::pdu::tag;

/// Message id scoped to a single connection.
pub type MessageId = i32;

const SEQUENCE: u8 = 0x30;
const INTEGER: u8 = 0x02;
const OCTET_STRING: u8 = 0x04;
const ENUMERATED: u8 = 0x0a;

/// Errors produced while framing or inspecting a PDU.
#[derive(Debug, thiserror::Error)]
pub enum PduError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected tag 0x{0:02x}, expected an LDAPMessage sequence")]
    UnexpectedTag(u8),
    #[error("indefinite length encoding is not allowed")]
    IndefiniteLength,
    #[error("length field wider than 4 bytes")]
    LengthOverflow,
    #[error("PDU of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("stream ended in the middle of a PDU")]
    Truncated,
    #[error("malformed PDU: {0}")]
    Malformed(&'static str),
}

/// LDAP result codes the balancer synthesizes itself.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success = 0,
    ProtocolError = 2,
    TimeLimitExceeded = 3,
    Busy = 51,
    Unavailable = 52,
    Other = 80,
    Cancelled = 118,
}

/// One framed LDAPMessage.
///
/// The payload after the message id is kept as the original bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    raw: Bytes,
    message_id: MessageId,
    /// Offset of the protocol op tag inside `raw`.
    op_offset: usize,
}

impl Pdu {
    /// Parse a complete envelope.
    pub fn parse(raw: Bytes) -> Result<Self, PduError> {
        let (header_len, content_len) =
            parse_header(&raw)?.ok_or(PduError::Malformed("incomplete header"))?;
        let end = header_len + content_len;
        if raw.len() != end {
            return Err(PduError::Malformed("length does not match frame"));
        }

        let mut pos = header_len;
        if raw.get(pos) != Some(&INTEGER) {
            return Err(PduError::Malformed("missing message id"));
        }
        let id_len = *raw.get(pos + 1).ok_or(PduError::Malformed("missing message id"))? as usize;
        pos += 2;
        if !(1..=4).contains(&id_len) || pos + id_len > end {
            return Err(PduError::Malformed("bad message id length"));
        }
        let message_id = decode_integer(&raw[pos..pos + id_len])?;
        pos += id_len;
        if pos >= end {
            return Err(PduError::Malformed("missing protocol op"));
        }

        Ok(Self {
            raw,
            message_id,
            op_offset: pos,
        })
    }

    /// Build an envelope around an already-encoded protocol op body.
    pub fn encode(message_id: MessageId, op_tag: u8, op_body: &[u8]) -> Self {
        let mut op = BytesMut::with_capacity(op_body.len() + 6);
        op.put_u8(op_tag);
        put_length(&mut op, op_body.len());
        op.put_slice(op_body);
        Self::assemble(message_id, &op)
    }

    /// An abandon request for `target`, issued with `message_id`.
    pub fn abandon(message_id: MessageId, target: MessageId) -> Self {
        Self::encode(message_id, tag::ABANDON_REQUEST, &integer_bytes(target))
    }

    /// An LDAPResult carrying `code` and a diagnostic message.
    pub fn result(message_id: MessageId, response_tag: u8, code: ResultCode, message: &str) -> Self {
        let mut body = BytesMut::with_capacity(message.len() + 12);
        body.put_u8(ENUMERATED);
        let code = integer_bytes(code as i32);
        put_length(&mut body, code.len());
        body.put_slice(&code);
        body.put_u8(OCTET_STRING);
        body.put_u8(0);
        body.put_u8(OCTET_STRING);
        put_length(&mut body, message.len());
        body.put_slice(message.as_bytes());
        Self::encode(message_id, response_tag, &body)
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn op_tag(&self) -> u8 {
        self.raw[self.op_offset]
    }

    /// The wire bytes of this PDU.
    pub fn as_bytes(&self) -> &Bytes {
        &self.raw
    }

    pub fn into_bytes(self) -> Bytes {
        self.raw
    }

    /// Copy of this PDU with only the message id replaced.
    pub fn with_message_id(&self, message_id: MessageId) -> Self {
        if message_id == self.message_id {
            return self.clone();
        }
        Self::assemble(message_id, &self.raw[self.op_offset..])
    }

    /// For an abandon request, the message id it targets.
    pub fn abandon_target(&self) -> Option<MessageId> {
        if self.op_tag() != tag::ABANDON_REQUEST {
            return None;
        }
        let len = *self.raw.get(self.op_offset + 1)? as usize;
        let start = self.op_offset + 2;
        if !(1..=4).contains(&len) || start + len > self.raw.len() {
            return None;
        }
        decode_integer(&self.raw[start..start + len]).ok()
    }

    /// Result code of an LDAPResult-shaped response, if it can be read.
    pub fn result_code(&self) -> Option<u8> {
        let (width, _) = read_length(&self.raw[self.op_offset + 1..]).ok().flatten()?;
        let start = self.op_offset + 1 + width;
        if self.raw.get(start) != Some(&ENUMERATED) || self.raw.get(start + 1) != Some(&1) {
            return None;
        }
        self.raw.get(start + 2).copied()
    }

    fn assemble(message_id: MessageId, op: &[u8]) -> Self {
        let id = integer_bytes(message_id);
        let content_len = 2 + id.len() + op.len();

        let mut out = BytesMut::with_capacity(content_len + 6);
        out.put_u8(SEQUENCE);
        put_length(&mut out, content_len);
        out.put_u8(INTEGER);
        out.put_u8(id.len() as u8);
        out.put_slice(&id);
        let op_offset = out.len();
        out.put_slice(op);

        Self {
            raw: out.freeze(),
            message_id,
            op_offset,
        }
    }
}

/// Parse a definite-length BER header for an LDAPMessage sequence.
///
/// Returns `(header_len, content_len)`, or `None` when more bytes are needed.
pub(crate) fn parse_header(buf: &[u8]) -> Result<Option<(usize, usize)>, PduError> {
    match buf.first() {
        None => Ok(None),
        Some(&SEQUENCE) => Ok(read_length(&buf[1..])?.map(|(width, len)| (1 + width, len))),
        Some(&other) => Err(PduError::UnexpectedTag(other)),
    }
}

/// Decode a definite length field, returning `(field_width, length)`.
fn read_length(buf: &[u8]) -> Result<Option<(usize, usize)>, PduError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    if first < 0x80 {
        return Ok(Some((1, first as usize)));
    }
    if first == 0x80 {
        return Err(PduError::IndefiniteLength);
    }
    let width = (first & 0x7f) as usize;
    if width > 4 {
        return Err(PduError::LengthOverflow);
    }
    if buf.len() < 1 + width {
        return Ok(None);
    }
    let len = buf[1..1 + width]
        .iter()
        .fold(0usize, |acc, b| (acc << 8) | *b as usize);
    Ok(Some((1 + width, len)))
}

fn put_length(buf: &mut BytesMut, len: usize) {
    if len < 0x80 {
        buf.put_u8(len as u8);
        return;
    }
    let bytes = (len as u32).to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    buf.put_u8(0x80 | (4 - skip) as u8);
    buf.put_slice(&bytes[skip..]);
}

/// Minimal two's complement encoding of a non-negative integer.
fn integer_bytes(value: i32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 3 && bytes[start] == 0 && bytes[start + 1] & 0x80 == 0 {
        start += 1;
    }
    bytes[start..].to_vec()
}

fn decode_integer(bytes: &[u8]) -> Result<MessageId, PduError> {
    if bytes.is_empty() || bytes.len() > 4 {
        return Err(PduError::Malformed("integer width"));
    }
    if bytes[0] & 0x80 != 0 {
        return Err(PduError::Malformed("negative message id"));
    }
    Ok(bytes.iter().fold(0i32, |acc, b| (acc << 8) | *b as i32))
}
