//! Serialisation of multicast DNS messages to the wire format.  See
//! the `types` module for details of the format.

use std::fmt;

use crate::protocol::types::*;

impl Packet {
    /// # Errors
    ///
    /// If the message is invalid (the `Packet` type permits more
    /// states than strictly allowed).
    pub fn to_octets(self) -> Result<Vec<u8>, Error> {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer)?;
        Ok(buffer.octets)
    }

    /// # Errors
    ///
    /// If the message is invalid (the `Packet` type permits more
    /// states than strictly allowed).
    pub fn serialise(self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let qdcount = usize_to_u16(self.questions.len())?;
        let ancount = usize_to_u16(self.answers.len())?;
        let nscount = usize_to_u16(self.authority.len())?;
        let arcount = usize_to_u16(self.additional.len())?;

        let flags: u16 = if self.is_response {
            // QR and AA: multicast responses are always authoritative
            0x8400
        } else {
            0x0000
        };

        buffer.write_u16(self.id);
        buffer.write_u16(flags);
        buffer.write_u16(qdcount);
        buffer.write_u16(ancount);
        buffer.write_u16(nscount);
        buffer.write_u16(arcount);

        for question in self.questions {
            question.serialise(buffer);
        }
        for record in self.answers {
            record.serialise(buffer)?;
        }
        for record in self.authority {
            record.serialise(buffer)?;
        }
        for record in self.additional {
            record.serialise(buffer)?;
        }

        Ok(())
    }
}

impl RecordKey {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        self.name.serialise(buffer);
        buffer.write_u16(self.rtype.into());
        buffer.write_u16(self.class.into());
    }
}

impl Record {
    /// # Errors
    ///
    /// If the RDATA is too long.
    pub fn serialise(self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        self.name.serialise(buffer);
        buffer.write_u16(self.data.rtype().into());

        let class: u16 = self.class.into();
        if self.cache_flush {
            buffer.write_u16(class | CLASS_MASK_CACHE_FLUSH);
        } else {
            buffer.write_u16(class);
        }

        buffer.write_u32(self.ttl);

        // filled in below
        let rdlength_index = buffer.index();
        buffer.write_u16(0);

        match self.data {
            RecordData::A { address } => buffer.write_octets(&address.octets()),
            RecordData::NS { nsdname } => buffer.write_octets(&nsdname.octets),
            RecordData::CNAME { cname } => buffer.write_octets(&cname.octets),
            RecordData::PTR { ptrdname } => buffer.write_octets(&ptrdname.octets),
            RecordData::HINFO { cpu, os } => {
                write_character_string(buffer, cpu.as_bytes())?;
                write_character_string(buffer, os.as_bytes())?;
            }
            RecordData::TXT { octets } => buffer.write_octets(&octets),
            RecordData::SRV {
                priority,
                weight,
                port,
                target,
            } => {
                buffer.write_u16(priority);
                buffer.write_u16(weight);
                buffer.write_u16(port);
                buffer.write_octets(&target.octets);
            }
        };

        // -2 so we don't also include the 2 octets for the rdlength
        let rdlength = buffer.index() - rdlength_index - 2;
        match u16::try_from(rdlength) {
            Ok(len) => {
                let [hi, lo] = len.to_be_bytes();
                buffer.octets[rdlength_index] = hi;
                buffer.octets[rdlength_index + 1] = lo;
                Ok(())
            }
            Err(_) => Err(Error::RdataTooLong { length: rdlength }),
        }
    }
}

impl DomainName {
    /// Names are always written in full: compression is only ever
    /// expanded, never produced.
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_octets(&self.octets);
    }
}

fn write_character_string(buffer: &mut WritableBuffer, octets: &[u8]) -> Result<(), Error> {
    match u8::try_from(octets.len()) {
        Ok(len) => {
            buffer.write_u8(len);
            buffer.write_octets(octets);
            Ok(())
        }
        Err(_) => Err(Error::StringTooLong {
            length: octets.len(),
        }),
    }
}

fn usize_to_u16(value: usize) -> Result<u16, Error> {
    u16::try_from(value).map_err(|_| Error::TooManyRecordSets { count: value })
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// More than 65535 entries in one section.
    TooManyRecordSets { count: usize },

    /// The RDATA of a record does not fit in its length field.
    RdataTooLong { length: usize },

    /// A character-string is over 255 octets.
    StringTooLong { length: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TooManyRecordSets { count } => {
                write!(f, "too many entries for one section: {count}")
            }
            Error::RdataTooLong { length } => write!(f, "rdata too long: {length} octets"),
            Error::StringTooLong { length } => {
                write!(f, "character-string too long: {length} octets")
            }
        }
    }
}

impl std::error::Error for Error {}

/// A buffer which can be written to, for serialisation.
#[derive(Debug, Default)]
pub struct WritableBuffer {
    pub octets: Vec<u8>,
}

impl WritableBuffer {
    pub fn index(&self) -> usize {
        self.octets.len()
    }

    pub fn write_u8(&mut self, octet: u8) {
        self.octets.push(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        for octet in value.to_be_bytes() {
            self.octets.push(octet);
        }
    }

    pub fn write_u32(&mut self, value: u32) {
        for octet in value.to_be_bytes() {
            self.octets.push(octet);
        }
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        for octet in octets {
            self.octets.push(*octet);
        }
    }
}
