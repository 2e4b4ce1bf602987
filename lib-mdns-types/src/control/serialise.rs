//! Serialisation of control frames.  Fields which do not fill their
//! fixed-size slot are truncated or zero-padded as appropriate; the
//! co-deployed client library never sees a short frame.

use crate::control::types::*;
use crate::protocol::types::*;

/// Build a complete client-to-daemon frame.
pub fn serialise_request(request: &ControlRequest) -> Vec<u8> {
    match request {
        ControlRequest::Lookup(key) => frame(MessageType::Lookup, key_payload(key)),
        ControlRequest::BrowseAdd(key) => frame(MessageType::BrowseAdd, key_payload(key)),
        ControlRequest::BrowseDel(key) => frame(MessageType::BrowseDel, key_payload(key)),
        ControlRequest::Resolve(name) => frame(MessageType::Resolve, name_payload(name)),
    }
}

/// Build a complete daemon-to-client frame.
pub fn serialise_response(response: &ControlResponse) -> Vec<u8> {
    match response {
        ControlResponse::Lookup(record) => frame(MessageType::Lookup, record_payload(record)),
        ControlResponse::BrowseAdd(record) => {
            frame(MessageType::BrowseAdd, record_payload(record))
        }
        ControlResponse::BrowseDel(record) => {
            frame(MessageType::BrowseDel, record_payload(record))
        }
        ControlResponse::Resolve(service) => frame(MessageType::Resolve, service_payload(service)),
        ControlResponse::LookupFailed(key) => frame(MessageType::LookupFailed, key_payload(key)),
        ControlResponse::ResolveFailed(name) => {
            frame(MessageType::ResolveFailed, name_payload(name))
        }
    }
}

fn frame(mtype: MessageType, payload: Vec<u8>) -> Vec<u8> {
    let mut octets = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    // lengths are bounded well below u16::MAX by the payload layouts
    octets.extend((payload.len() as u16).to_be_bytes());
    octets.extend(u16::from(mtype).to_be_bytes());
    octets.extend(payload);
    octets
}

fn key_payload(key: &RecordKey) -> Vec<u8> {
    let mut octets = Vec::with_capacity(KEY_PAYLOAD_LEN);
    write_name_field(&mut octets, &key.name);
    octets.extend(u16::from(key.rtype).to_be_bytes());
    octets.extend(u16::from(key.class).to_be_bytes());
    octets
}

fn name_payload(name: &DomainName) -> Vec<u8> {
    let mut octets = Vec::with_capacity(NAME_FIELD_LEN);
    write_name_field(&mut octets, name);
    octets
}

fn record_payload(record: &Record) -> Vec<u8> {
    let mut octets = Vec::with_capacity(RECORD_PAYLOAD_LEN);
    write_name_field(&mut octets, &record.name);
    octets.extend(u16::from(record.data.rtype()).to_be_bytes());
    octets.extend(u16::from(record.class).to_be_bytes());
    octets.extend(record.ttl.to_be_bytes());
    octets.push(u8::from(record.cache_flush));
    octets.push(0);

    let rdata_start = octets.len();
    match &record.data {
        RecordData::A { address } => octets.extend(address.octets()),
        RecordData::NS { nsdname } => write_name_field(&mut octets, nsdname),
        RecordData::CNAME { cname } => write_name_field(&mut octets, cname),
        RecordData::PTR { ptrdname } => write_name_field(&mut octets, ptrdname),
        RecordData::HINFO { cpu, os } => {
            write_bounded_field(&mut octets, cpu.as_bytes(), HINFO_FIELD_LEN);
            write_bounded_field(&mut octets, os.as_bytes(), HINFO_FIELD_LEN);
        }
        RecordData::TXT { octets: txt } => write_txt_field(&mut octets, txt),
        RecordData::SRV {
            priority,
            weight,
            port,
            target,
        } => {
            octets.extend(priority.to_be_bytes());
            octets.extend(weight.to_be_bytes());
            octets.extend(port.to_be_bytes());
            write_name_field(&mut octets, target);
        }
    }
    octets.resize(rdata_start + RDATA_FIELD_LEN, 0);

    octets
}

fn service_payload(service: &Service) -> Vec<u8> {
    let mut octets = Vec::with_capacity(SERVICE_PAYLOAD_LEN);
    write_name_field(&mut octets, &service.name);
    write_txt_field(&mut octets, &service.txt);
    octets.extend(service.priority.to_be_bytes());
    octets.extend(service.weight.to_be_bytes());
    octets.extend(service.port.to_be_bytes());
    octets.extend(service.addr.octets());
    octets
}

/// Write a dotted name into a NUL-terminated fixed-size field,
/// truncating an over-long name.
fn write_name_field(octets: &mut Vec<u8>, name: &DomainName) {
    write_bounded_field(octets, name.to_dotted_string().as_bytes(), NAME_FIELD_LEN);
}

fn write_txt_field(octets: &mut Vec<u8>, txt: &[u8]) {
    let len = txt.len().min(TXT_MAX_LEN);
    // truncation cannot overflow the length octet
    octets.push(len as u8);
    octets.extend(&txt[..len]);
    for _ in len..TXT_MAX_LEN {
        octets.push(0);
    }
}

fn write_bounded_field(octets: &mut Vec<u8>, value: &[u8], field_len: usize) {
    let len = value.len().min(field_len - 1);
    octets.extend(&value[..len]);
    for _ in len..field_len {
        octets.push(0);
    }
}
