//! The control protocol spoken over the daemon's local stream socket.
//!
//! Each frame is a 4-octet header - payload length then message type,
//! both big-endian u16s - followed by a fixed-size payload.  Name
//! fields are NUL-terminated dotted strings in a fixed 256-octet
//! field; numeric fields are network-endian.  The protocol is not
//! versioned: the client library is compiled against these layouts.

use std::fmt;

use crate::protocol::types::*;

/// Size of a name field: 255 presentation octets plus the NUL.
pub const NAME_FIELD_LEN: usize = 256;

/// Size of a TXT field: a length octet plus up to 255 octets of data.
pub const TXT_FIELD_LEN: usize = TXT_MAX_LEN + 1;

/// Size of each of the HINFO cpu and os fields.
pub const HINFO_FIELD_LEN: usize = 64;

/// Size of the fixed rdata area in a record payload.  SRV is the
/// widest layout: priority, weight, port, then a name field.
pub const RDATA_FIELD_LEN: usize = 6 + NAME_FIELD_LEN;

/// Payload size for a record-set key: name, type, class.
pub const KEY_PAYLOAD_LEN: usize = NAME_FIELD_LEN + 4;

/// Payload size for a record: key, TTL, cache-flush flag, one octet
/// of padding, rdata area.
pub const RECORD_PAYLOAD_LEN: usize = KEY_PAYLOAD_LEN + 6 + RDATA_FIELD_LEN;

/// Payload size for a resolved service: name, TXT, priority, weight,
/// port, IPv4 address.
pub const SERVICE_PAYLOAD_LEN: usize = NAME_FIELD_LEN + TXT_FIELD_LEN + 6 + 4;

/// Frame header size: payload length and message type.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest frame payload either side may send.
pub const PAYLOAD_MAX_LEN: usize = RECORD_PAYLOAD_LEN;

/// Message type codes.  Requests and their answers share a code; the
/// failure notifications are daemon-to-client only.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MessageType {
    Lookup,
    BrowseAdd,
    BrowseDel,
    Resolve,
    LookupFailed,
    ResolveFailed,
}

impl TryFrom<u16> for MessageType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, u16> {
        match value {
            1 => Ok(MessageType::Lookup),
            2 => Ok(MessageType::BrowseAdd),
            3 => Ok(MessageType::BrowseDel),
            4 => Ok(MessageType::Resolve),
            5 => Ok(MessageType::LookupFailed),
            6 => Ok(MessageType::ResolveFailed),
            _ => Err(value),
        }
    }
}

impl From<MessageType> for u16 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Lookup => 1,
            MessageType::BrowseAdd => 2,
            MessageType::BrowseDel => 3,
            MessageType::Resolve => 4,
            MessageType::LookupFailed => 5,
            MessageType::ResolveFailed => 6,
        }
    }
}

/// A request from a client.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ControlRequest {
    /// One-shot: answer with a single record for this key.
    Lookup(RecordKey),

    /// Continuous: stream every appearance and disappearance of a
    /// record under this PTR key.
    BrowseAdd(RecordKey),

    /// Stop the browse for this key.
    BrowseDel(RecordKey),

    /// Resolve a service instance name to host, port, address, and
    /// metadata.
    Resolve(DomainName),
}

/// A message to a client.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ControlResponse {
    /// The answer to a lookup.
    Lookup(Record),

    /// A browse hit appeared.
    BrowseAdd(Record),

    /// A browse hit went away.
    BrowseDel(Record),

    /// A resolve completed.
    Resolve(Service),

    /// A lookup exhausted its retransmissions without an answer.
    LookupFailed(RecordKey),

    /// A resolve exhausted its retransmissions without learning all
    /// of the service's records.
    ResolveFailed(DomainName),
}

impl ControlResponse {
    pub fn message_type(&self) -> MessageType {
        match self {
            ControlResponse::Lookup(_) => MessageType::Lookup,
            ControlResponse::BrowseAdd(_) => MessageType::BrowseAdd,
            ControlResponse::BrowseDel(_) => MessageType::BrowseDel,
            ControlResponse::Resolve(_) => MessageType::Resolve,
            ControlResponse::LookupFailed(_) => MessageType::LookupFailed,
            ControlResponse::ResolveFailed(_) => MessageType::ResolveFailed,
        }
    }
}

/// Errors encountered handling a control frame.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// The message type is not one we know.
    UnknownMessageType(u16),

    /// The payload is not the fixed size for its message type.
    BadLength {
        mtype: u16,
        expected: usize,
        actual: usize,
    },

    /// A name field does not hold a well-formed dotted name.
    InvalidName,

    /// A record payload carries a type with no fixed rdata layout.
    UnsupportedRecordType(RecordType),

    /// The message type is valid but not for this direction.
    UnexpectedMessageType(MessageType),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnknownMessageType(mtype) => write!(f, "unknown message type {mtype}"),
            Error::BadLength {
                mtype,
                expected,
                actual,
            } => write!(
                f,
                "bad payload length for message type {mtype}: expected {expected}, got {actual}"
            ),
            Error::InvalidName => write!(f, "invalid name field"),
            Error::UnsupportedRecordType(rtype) => {
                write!(f, "record type {rtype} has no control payload layout")
            }
            Error::UnexpectedMessageType(mtype) => {
                write!(f, "message type {mtype:?} not valid in this direction")
            }
        }
    }
}

impl std::error::Error for Error {}
