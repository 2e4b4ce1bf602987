//! Deserialisation of control frames.  Payload lengths are checked
//! against the fixed size for the message type before any field is
//! read; name fields are truncated to a NUL at their last allowed
//! octet first, since clients may be sloppy about termination.

use std::net::Ipv4Addr;

use crate::control::types::*;
use crate::protocol::types::*;

/// Parse a client-to-daemon payload.
///
/// # Errors
///
/// If the message type is unknown or daemon-to-client only, the
/// payload is not the fixed size for the type, or a name field is
/// malformed.
pub fn deserialise_request(mtype: u16, payload: &[u8]) -> Result<ControlRequest, Error> {
    match MessageType::try_from(mtype).map_err(Error::UnknownMessageType)? {
        MessageType::Lookup => Ok(ControlRequest::Lookup(read_key(mtype, payload)?)),
        MessageType::BrowseAdd => Ok(ControlRequest::BrowseAdd(read_key(mtype, payload)?)),
        MessageType::BrowseDel => Ok(ControlRequest::BrowseDel(read_key(mtype, payload)?)),
        MessageType::Resolve => {
            check_length(mtype, NAME_FIELD_LEN, payload)?;
            Ok(ControlRequest::Resolve(read_name_field(payload)?))
        }
        mtype @ (MessageType::LookupFailed | MessageType::ResolveFailed) => {
            Err(Error::UnexpectedMessageType(mtype))
        }
    }
}

/// Parse a daemon-to-client payload.  This is the client library's
/// half of the protocol, and what the tests decode with.
///
/// # Errors
///
/// As [`deserialise_request`].
pub fn deserialise_response(mtype: u16, payload: &[u8]) -> Result<ControlResponse, Error> {
    match MessageType::try_from(mtype).map_err(Error::UnknownMessageType)? {
        MessageType::Lookup => Ok(ControlResponse::Lookup(read_record(mtype, payload)?)),
        MessageType::BrowseAdd => Ok(ControlResponse::BrowseAdd(read_record(mtype, payload)?)),
        MessageType::BrowseDel => Ok(ControlResponse::BrowseDel(read_record(mtype, payload)?)),
        MessageType::Resolve => Ok(ControlResponse::Resolve(read_service(mtype, payload)?)),
        MessageType::LookupFailed => Ok(ControlResponse::LookupFailed(read_key(mtype, payload)?)),
        MessageType::ResolveFailed => {
            check_length(mtype, NAME_FIELD_LEN, payload)?;
            Ok(ControlResponse::ResolveFailed(read_name_field(payload)?))
        }
    }
}

fn check_length(mtype: u16, expected: usize, payload: &[u8]) -> Result<(), Error> {
    if payload.len() == expected {
        Ok(())
    } else {
        Err(Error::BadLength {
            mtype,
            expected,
            actual: payload.len(),
        })
    }
}

fn read_key(mtype: u16, payload: &[u8]) -> Result<RecordKey, Error> {
    check_length(mtype, KEY_PAYLOAD_LEN, payload)?;
    read_key_fields(payload)
}

fn read_key_fields(octets: &[u8]) -> Result<RecordKey, Error> {
    let name = read_name_field(&octets[..NAME_FIELD_LEN])?;
    let rtype = read_u16(octets, NAME_FIELD_LEN);
    let class = read_u16(octets, NAME_FIELD_LEN + 2);

    Ok(RecordKey {
        name,
        rtype: RecordType::from(rtype),
        class: RecordClass::from(class),
    })
}

fn read_record(mtype: u16, payload: &[u8]) -> Result<Record, Error> {
    check_length(mtype, RECORD_PAYLOAD_LEN, payload)?;

    let key = read_key_fields(&payload[..KEY_PAYLOAD_LEN])?;
    let ttl = read_u32(payload, KEY_PAYLOAD_LEN);
    let cache_flush = payload[KEY_PAYLOAD_LEN + 4] != 0;
    let rdata = &payload[KEY_PAYLOAD_LEN + 6..];

    let data = match key.rtype {
        RecordType::A => RecordData::A {
            address: Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]),
        },
        RecordType::NS => RecordData::NS {
            nsdname: read_name_field(&rdata[..NAME_FIELD_LEN])?,
        },
        RecordType::CNAME => RecordData::CNAME {
            cname: read_name_field(&rdata[..NAME_FIELD_LEN])?,
        },
        RecordType::PTR => RecordData::PTR {
            ptrdname: read_name_field(&rdata[..NAME_FIELD_LEN])?,
        },
        RecordType::HINFO => RecordData::HINFO {
            cpu: read_string_field(&rdata[..HINFO_FIELD_LEN]),
            os: read_string_field(&rdata[HINFO_FIELD_LEN..HINFO_FIELD_LEN * 2]),
        },
        RecordType::TXT => RecordData::TXT {
            octets: read_txt_field(rdata),
        },
        RecordType::SRV => RecordData::SRV {
            priority: read_u16(rdata, 0),
            weight: read_u16(rdata, 2),
            port: read_u16(rdata, 4),
            target: read_name_field(&rdata[6..6 + NAME_FIELD_LEN])?,
        },
        rtype @ RecordType::Unknown(_) => return Err(Error::UnsupportedRecordType(rtype)),
    };

    Ok(Record {
        name: key.name,
        class: key.class,
        ttl,
        cache_flush,
        data,
    })
}

fn read_service(mtype: u16, payload: &[u8]) -> Result<Service, Error> {
    check_length(mtype, SERVICE_PAYLOAD_LEN, payload)?;

    let name = read_name_field(&payload[..NAME_FIELD_LEN])?;
    let txt = read_txt_field(&payload[NAME_FIELD_LEN..NAME_FIELD_LEN + TXT_FIELD_LEN]);
    let rest = &payload[NAME_FIELD_LEN + TXT_FIELD_LEN..];

    Ok(Service {
        name,
        txt,
        priority: read_u16(rest, 0),
        weight: read_u16(rest, 2),
        port: read_u16(rest, 4),
        addr: Ipv4Addr::new(rest[6], rest[7], rest[8], rest[9]),
    })
}

/// Read a NUL-terminated name field.  The final octet is treated as a
/// NUL no matter what the client sent.
fn read_name_field(octets: &[u8]) -> Result<DomainName, Error> {
    let end = octets[..NAME_FIELD_LEN - 1]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(NAME_FIELD_LEN - 1);

    let s = std::str::from_utf8(&octets[..end]).map_err(|_| Error::InvalidName)?;
    DomainName::from_dotted_string(s).ok_or(Error::InvalidName)
}

fn read_txt_field(octets: &[u8]) -> Vec<u8> {
    let len = usize::from(octets[0]).min(TXT_MAX_LEN);
    octets[1..=len].to_vec()
}

fn read_string_field(octets: &[u8]) -> String {
    let end = octets.iter().position(|&b| b == 0).unwrap_or(octets.len());
    String::from_utf8_lossy(&octets[..end]).into_owned()
}

fn read_u16(octets: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([octets[at], octets[at + 1]])
}

fn read_u32(octets: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([octets[at], octets[at + 1], octets[at + 2], octets[at + 3]])
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::control::serialise::{serialise_request, serialise_response};
    use crate::protocol::types::test_util::*;

    fn split_frame(frame: &[u8]) -> (u16, &[u8]) {
        let length = usize::from(u16::from_be_bytes([frame[0], frame[1]]));
        let mtype = u16::from_be_bytes([frame[2], frame[3]]);
        assert_eq!(FRAME_HEADER_LEN + length, frame.len());
        (mtype, &frame[FRAME_HEADER_LEN..])
    }

    #[test]
    fn roundtrip_requests() {
        let requests = [
            ControlRequest::Lookup(key("printer.local", RecordType::A)),
            ControlRequest::BrowseAdd(key("_http._tcp.local", RecordType::PTR)),
            ControlRequest::BrowseDel(key("_http._tcp.local", RecordType::PTR)),
            ControlRequest::Resolve(domain("srv1._http._tcp.local")),
        ];

        for original in requests {
            let frame = serialise_request(&original);
            let (mtype, payload) = split_frame(&frame);
            assert_eq!(Ok(original), deserialise_request(mtype, payload));
        }
    }

    #[test]
    fn roundtrip_responses() {
        let responses = [
            ControlResponse::Lookup(a_record("printer.local", Ipv4Addr::new(10, 0, 0, 5))),
            ControlResponse::BrowseAdd(ptr_record("_http._tcp.local", "srv1._http._tcp.local")),
            ControlResponse::BrowseDel(ptr_record("_http._tcp.local", "srv1._http._tcp.local")),
            ControlResponse::Lookup(srv_record("srv1._http._tcp.local", 0, 0, 8080, "host.local")),
            ControlResponse::Lookup(txt_record("srv1._http._tcp.local", "path=/")),
            ControlResponse::Lookup(hinfo_record("host.local", "amd64", "openbsd")),
            ControlResponse::Resolve(Service {
                name: domain("srv1._http._tcp.local"),
                txt: b"path=/".to_vec(),
                priority: 0,
                weight: 0,
                port: 8080,
                addr: Ipv4Addr::new(10, 0, 0, 7),
            }),
            ControlResponse::LookupFailed(key("gone.local", RecordType::A)),
            ControlResponse::ResolveFailed(domain("gone._http._tcp.local")),
        ];

        for original in responses {
            let frame = serialise_response(&original);
            let (mtype, payload) = split_frame(&frame);
            assert_eq!(Ok(original), deserialise_response(mtype, payload));
        }
    }

    #[test]
    fn response_preserves_ttl_and_flush() {
        let mut record = a_record("printer.local", Ipv4Addr::new(10, 0, 0, 5));
        record.ttl = 42;
        record.cache_flush = true;

        let frame = serialise_response(&ControlResponse::Lookup(record));
        let (mtype, payload) = split_frame(&frame);
        if let Ok(ControlResponse::Lookup(decoded)) = deserialise_response(mtype, payload) {
            assert_eq!(42, decoded.ttl);
            assert!(decoded.cache_flush);
        } else {
            panic!("expected lookup response");
        }
    }

    #[test]
    fn request_with_wrong_length_is_rejected() {
        let frame = serialise_request(&ControlRequest::Lookup(key("x.local", RecordType::A)));
        let (mtype, payload) = split_frame(&frame);

        assert_eq!(
            Err(Error::BadLength {
                mtype,
                expected: KEY_PAYLOAD_LEN,
                actual: KEY_PAYLOAD_LEN - 1,
            }),
            deserialise_request(mtype, &payload[..KEY_PAYLOAD_LEN - 1])
        );
    }

    #[test]
    fn request_with_unknown_type_is_rejected() {
        assert_eq!(
            Err(Error::UnknownMessageType(99)),
            deserialise_request(99, &[0u8; KEY_PAYLOAD_LEN])
        );
    }

    #[test]
    fn failure_types_are_not_requests() {
        assert_eq!(
            Err(Error::UnexpectedMessageType(MessageType::LookupFailed)),
            deserialise_request(
                u16::from(MessageType::LookupFailed),
                &[0u8; KEY_PAYLOAD_LEN]
            )
        );
    }

    #[test]
    fn unterminated_name_is_truncated_not_rejected() {
        // a client which fills the whole name field loses its last
        // octet, it does not get an error
        let mut payload = vec![b'x'; NAME_FIELD_LEN];
        payload.extend(u16::from(RecordType::A).to_be_bytes());
        payload.extend(u16::from(RecordClass::IN).to_be_bytes());

        // 255 octets of "x" is an over-long label, so this one is
        // still rejected, but by name validation
        assert_eq!(
            Err(Error::InvalidName),
            deserialise_request(u16::from(MessageType::Lookup), &payload)
        );

        let mut payload = Vec::new();
        let name = format!("{}.local", "x".repeat(20));
        payload.extend(name.as_bytes());
        payload.resize(NAME_FIELD_LEN, b'!');
        payload[name.len()] = 0;
        payload.extend(u16::from(RecordType::A).to_be_bytes());
        payload.extend(u16::from(RecordClass::IN).to_be_bytes());

        assert_eq!(
            Ok(ControlRequest::Lookup(key(&name, RecordType::A))),
            deserialise_request(u16::from(MessageType::Lookup), &payload)
        );
    }
}
