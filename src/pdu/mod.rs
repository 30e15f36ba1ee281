//! Protocol data unit boundary.
//!
//! # Data Flow
//! ```text
//! socket bytes
//!     → reader.rs (frame one LDAPMessage envelope at a time)
//!     → message.rs (Pdu: message id + protocol op tag, payload opaque)
//!     → routing layer rewrites the message id and forwards the bytes
//! ```
//!
//! # Design Decisions
//! - Only the envelope is understood: outer SEQUENCE, message id, op tag
//! - Everything after the message id is proxied byte-for-byte
//! - The balancer only originates abandon requests and LDAPResult failures

pub mod message;
pub mod reader;

pub use message::{MessageId, Pdu, PduError, ResultCode};
pub use reader::PduReader;

/// Largest message id a connection will hand out (`maxInt` in RFC 4511).
pub const MAX_MESSAGE_ID: MessageId = i32::MAX;

/// Default ceiling for a single framed PDU.
pub const DEFAULT_MAX_PDU_SIZE: usize = 16 * 1024 * 1024;

/// Protocol op tags (application class, RFC 4511 section 4.2 onwards).
pub mod tag {
    pub const BIND_REQUEST: u8 = 0x60;
    pub const BIND_RESPONSE: u8 = 0x61;
    pub const UNBIND_REQUEST: u8 = 0x42;
    pub const SEARCH_REQUEST: u8 = 0x63;
    pub const SEARCH_RESULT_ENTRY: u8 = 0x64;
    pub const SEARCH_RESULT_DONE: u8 = 0x65;
    pub const SEARCH_RESULT_REFERENCE: u8 = 0x73;
    pub const MODIFY_REQUEST: u8 = 0x66;
    pub const MODIFY_RESPONSE: u8 = 0x67;
    pub const ADD_REQUEST: u8 = 0x68;
    pub const ADD_RESPONSE: u8 = 0x69;
    pub const DEL_REQUEST: u8 = 0x4a;
    pub const DEL_RESPONSE: u8 = 0x6b;
    pub const MODDN_REQUEST: u8 = 0x6c;
    pub const MODDN_RESPONSE: u8 = 0x6d;
    pub const COMPARE_REQUEST: u8 = 0x6e;
    pub const COMPARE_RESPONSE: u8 = 0x6f;
    pub const ABANDON_REQUEST: u8 = 0x50;
    pub const EXTENDED_REQUEST: u8 = 0x77;
    pub const EXTENDED_RESPONSE: u8 = 0x78;
    pub const INTERMEDIATE_RESPONSE: u8 = 0x79;
}

/// Map a request op tag to the op tag of its terminating response.
///
/// Returns `None` for requests that never get a response (unbind, abandon).
pub fn response_tag_for(request_tag: u8) -> Option<u8> {
    match request_tag {
        tag::BIND_REQUEST => Some(tag::BIND_RESPONSE),
        tag::SEARCH_REQUEST => Some(tag::SEARCH_RESULT_DONE),
        tag::MODIFY_REQUEST => Some(tag::MODIFY_RESPONSE),
        tag::ADD_REQUEST => Some(tag::ADD_RESPONSE),
        tag::DEL_REQUEST => Some(tag::DEL_RESPONSE),
        tag::MODDN_REQUEST => Some(tag::MODDN_RESPONSE),
        tag::COMPARE_REQUEST => Some(tag::COMPARE_RESPONSE),
        tag::EXTENDED_REQUEST => Some(tag::EXTENDED_RESPONSE),
        _ => None,
    }
}

/// Whether a response PDU with this op tag completes its operation.
pub fn is_final_response(op_tag: u8) -> bool {
    !matches!(
        op_tag,
        tag::SEARCH_RESULT_ENTRY | tag::SEARCH_RESULT_REFERENCE | tag::INTERMEDIATE_RESPONSE
    )
}
