use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Maximum length of a single label, in octets.
pub const LABEL_MAX_LEN: usize = 63;

/// Maximum length of a whole domain name, in octets.
pub const DOMAINNAME_MAX_LEN: usize = 255;

/// Maximum length of the TXT data carried across the control channel.
pub const TXT_MAX_LEN: usize = 255;

/// Maximum size of a multicast DNS datagram we will process.
pub const PACKET_MAX_LEN: usize = 10000;

/// The cache-flush bit, folded into the class field of records on the
/// wire.  See section 10.2 of RFC 6762.
pub const CLASS_MASK_CACHE_FLUSH: u16 = 0x8000;

/// A domain name is a sequence of labels, compared without regard to
/// ASCII case.  Labels are lowercased on construction, so two names
/// which differ only in case have equal `octets` and `labels` and the
/// derived equality is the case-insensitive one.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct DomainName {
    pub octets: Vec<u8>,
    pub labels: Vec<Vec<u8>>,
}

impl DomainName {
    pub fn root_domain() -> Self {
        DomainName {
            octets: vec![0],
            labels: vec![vec![]],
        }
    }

    pub fn is_root(&self) -> bool {
        self.octets.len() == 1 && self.labels.len() == 1
    }

    /// The dotted presentation form, without the trailing dot (the
    /// root label is implicit at this boundary).  The root domain
    /// itself renders as `"."`.
    pub fn to_dotted_string(&self) -> String {
        if self.is_root() {
            return ".".to_string();
        }

        let mut out = String::with_capacity(self.octets.len());
        let mut first = true;
        for label in &self.labels {
            if label.is_empty() {
                continue;
            }
            if first {
                first = false;
            } else {
                out.push('.');
            }
            for octet in label {
                out.push(*octet as char);
            }
        }

        out
    }

    /// Parse a dotted presentation name.  The trailing root dot is
    /// accepted but not required.
    pub fn from_dotted_string(s: &str) -> Option<Self> {
        if s == "." || s.is_empty() {
            return Some(Self::root_domain());
        }

        let mut chunks = s.split('.').collect::<Vec<_>>();
        if chunks.last() != Some(&"") {
            chunks.push("");
        }

        let mut labels = Vec::with_capacity(chunks.len());
        for (i, label) in chunks.iter().enumerate() {
            if label.is_empty() && i != chunks.len() - 1 {
                return None;
            }

            labels.push(label.as_bytes().into());
        }

        Self::from_labels(labels)
    }

    /// Build a name from labels of any case, validating the length
    /// limits.  The final label must be the empty root label.
    pub fn from_labels(mixed_case_labels: Vec<Vec<u8>>) -> Option<Self> {
        if mixed_case_labels.is_empty() {
            return None;
        }

        let mut labels = Vec::<Vec<u8>>::with_capacity(mixed_case_labels.len());
        let mut octets = Vec::<u8>::with_capacity(DOMAINNAME_MAX_LEN);
        let mut blank_label = false;

        for mc_label in &mixed_case_labels {
            if blank_label {
                return None;
            }

            blank_label = mc_label.is_empty();

            match u8::try_from(mc_label.len()) {
                Ok(n) if usize::from(n) <= LABEL_MAX_LEN => {
                    octets.push(n);
                    let mut label = Vec::<u8>::with_capacity(mc_label.len());
                    for octet in mc_label {
                        if !octet.is_ascii() {
                            return None;
                        }

                        let octet = octet.to_ascii_lowercase();
                        label.push(octet);
                        octets.push(octet);
                    }
                    labels.push(label);
                }
                _ => return None,
            }
        }

        if blank_label && octets.len() <= DOMAINNAME_MAX_LEN {
            Some(Self { octets, labels })
        } else {
            None
        }
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_dotted_string())
    }
}

impl fmt::Debug for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainName")
            .field("to_dotted_string()", &self.to_dotted_string())
            .finish()
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for DomainName {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let num_labels = u.int_in_range::<usize>(1..=4)?;
        let mut octets = Vec::new();
        let mut labels = Vec::new();
        for _ in 0..num_labels {
            let label_len = u.int_in_range::<u8>(1..=20)?;
            let mut label = Vec::new();
            octets.push(label_len);
            let bs = u.bytes(label_len.into())?;
            for b in bs {
                let ascii_byte = if b.is_ascii() { *b } else { *b % 128 };
                let octet = if ascii_byte == b'.' || (ascii_byte as char).is_whitespace() {
                    b'x'
                } else {
                    ascii_byte.to_ascii_lowercase()
                };
                label.push(octet);
                octets.push(octet);
            }
            labels.push(label);
        }
        octets.push(0);
        labels.push(Vec::new());
        Ok(Self { octets, labels })
    }
}

/// The record types this daemon understands.  Anything else is carried
/// as `Unknown` for diagnostics and skipped by the cache.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub enum RecordType {
    A,
    NS,
    CNAME,
    PTR,
    HINFO,
    TXT,
    SRV,
    Unknown(u16),
}

impl From<u16> for RecordType {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordType::A,
            2 => RecordType::NS,
            5 => RecordType::CNAME,
            12 => RecordType::PTR,
            13 => RecordType::HINFO,
            16 => RecordType::TXT,
            33 => RecordType::SRV,
            _ => RecordType::Unknown(value),
        }
    }
}

impl From<RecordType> for u16 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::A => 1,
            RecordType::NS => 2,
            RecordType::CNAME => 5,
            RecordType::PTR => 12,
            RecordType::HINFO => 13,
            RecordType::TXT => 16,
            RecordType::SRV => 33,
            RecordType::Unknown(value) => value,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::A => write!(f, "A"),
            RecordType::NS => write!(f, "NS"),
            RecordType::CNAME => write!(f, "CNAME"),
            RecordType::PTR => write!(f, "PTR"),
            RecordType::HINFO => write!(f, "HINFO"),
            RecordType::TXT => write!(f, "TXT"),
            RecordType::SRV => write!(f, "SRV"),
            RecordType::Unknown(value) => write!(f, "TYPE{value}"),
        }
    }
}

impl FromStr for RecordType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "NS" => Ok(RecordType::NS),
            "CNAME" => Ok(RecordType::CNAME),
            "PTR" => Ok(RecordType::PTR),
            "HINFO" => Ok(RecordType::HINFO),
            "TXT" => Ok(RecordType::TXT),
            "SRV" => Ok(RecordType::SRV),
            _ => Err(()),
        }
    }
}

/// Record classes.  Everything on a local link is IN; other values are
/// kept only so they can be named in log messages.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub enum RecordClass {
    IN,
    Unknown(u16),
}

impl From<u16> for RecordClass {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordClass::IN,
            _ => RecordClass::Unknown(value),
        }
    }
}

impl From<RecordClass> for u16 {
    fn from(value: RecordClass) -> Self {
        match value {
            RecordClass::IN => 1,
            RecordClass::Unknown(value) => value,
        }
    }
}

impl fmt::Display for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordClass::IN => write!(f, "IN"),
            RecordClass::Unknown(value) => write!(f, "CLASS{value}"),
        }
    }
}

/// The (name, type, class) triple identifying a record set.  This is
/// the unit of cache lookup and of outbound question deduplication:
/// several records may share one key (a service type with several
/// instances), but the cache holds at most one entry list per key and
/// the question registry at most one question.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub struct RecordKey {
    pub name: DomainName,
    pub rtype: RecordType,
    pub class: RecordClass,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.rtype, self.class)
    }
}

/// A record type with its associated data.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub enum RecordData {
    /// A 32-bit IPv4 address.
    A { address: Ipv4Addr },

    /// The authoritative nameserver for the name.
    NS { nsdname: DomainName },

    /// The canonical name for an alias.
    CNAME { cname: DomainName },

    /// A name pointing elsewhere in the namespace; during service
    /// browsing, the service type name points at each instance.
    PTR { ptrdname: DomainName },

    /// Host information: CPU and operating system strings.
    HINFO { cpu: String, os: String },

    /// Free-form metadata, at most [`TXT_MAX_LEN`] octets at the
    /// control-channel boundary.
    TXT { octets: Vec<u8> },

    /// A service endpoint.
    ///
    /// ```text
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    ///     |                   PRIORITY                    |
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    ///     |                    WEIGHT                     |
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    ///     |                     PORT                      |
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    ///     /                    TARGET                     /
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    /// ```
    ///
    /// See RFC 2782.
    SRV {
        priority: u16,
        weight: u16,
        port: u16,
        target: DomainName,
    },
}

impl RecordData {
    pub fn rtype(&self) -> RecordType {
        match self {
            RecordData::A { .. } => RecordType::A,
            RecordData::NS { .. } => RecordType::NS,
            RecordData::CNAME { .. } => RecordType::CNAME,
            RecordData::PTR { .. } => RecordType::PTR,
            RecordData::HINFO { .. } => RecordType::HINFO,
            RecordData::TXT { .. } => RecordType::TXT,
            RecordData::SRV { .. } => RecordType::SRV,
        }
    }
}

/// A resource record as the engine sees it: key fields, remaining TTL
/// in seconds (zero announces a withdrawal), the cache-flush bit, and
/// the typed data.
///
/// Two records are equal when their key and data agree; the TTL and
/// the cache-flush bit are transport state, not identity.
#[derive(Debug, Clone)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub struct Record {
    pub name: DomainName,
    pub class: RecordClass,
    pub ttl: u32,
    pub cache_flush: bool,
    pub data: RecordData,
}

impl Record {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            name: self.name.clone(),
            rtype: self.data.rtype(),
            class: self.class,
        }
    }

    /// A withdrawal announcement: the record is being removed by its
    /// publisher.
    pub fn is_goodbye(&self) -> bool {
        self.ttl == 0
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.class == other.class && self.data == other.data
    }
}

impl Eq for Record {}

/// A fully resolved service instance, composed from its SRV, TXT, and
/// A records.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Service {
    pub name: DomainName,
    pub txt: Vec<u8>,
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub addr: Ipv4Addr,
}

/// A multicast DNS message.  Queries carry questions plus cached
/// answers for known-answer suppression; responses carry records in
/// the answer, authority, and additional sections.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Packet {
    pub id: u16,
    pub is_response: bool,
    pub questions: Vec<RecordKey>,
    pub answers: Vec<Record>,
    pub authority: Vec<Record>,
    pub additional: Vec<Record>,
}

impl Packet {
    /// Build an outbound query for one record set, with the caller's
    /// current records in the answer section so responders can
    /// suppress replies we already know.
    pub fn query(question: RecordKey, known_answers: Vec<Record>) -> Self {
        Self {
            id: 0,
            is_response: false,
            questions: vec![question],
            answers: known_answers,
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    /// All records from the answer and additional sections, in packet
    /// order.
    pub fn records(self) -> impl Iterator<Item = Record> {
        self.answers.into_iter().chain(self.additional)
    }
}

#[cfg(any(feature = "test-util", test))]
#[allow(clippy::missing_panics_doc)]
pub mod test_util {
    use super::*;

    use arbitrary::{Arbitrary, Unstructured};

    pub fn arbitrary_record() -> Record {
        for size in [128, 256, 512, 1024, 2048, 4096] {
            let mut buf = Vec::new();
            for _ in 0..size {
                buf.push(rand::random::<u8>());
            }

            if let Ok(record) = Record::arbitrary(&mut Unstructured::new(&buf)) {
                return record;
            }
        }

        panic!("could not generate arbitrary value!");
    }

    pub fn domain(name: &str) -> DomainName {
        DomainName::from_dotted_string(name).unwrap()
    }

    pub fn key(name: &str, rtype: RecordType) -> RecordKey {
        RecordKey {
            name: domain(name),
            rtype,
            class: RecordClass::IN,
        }
    }

    pub fn a_record(name: &str, address: Ipv4Addr) -> Record {
        Record {
            name: domain(name),
            class: RecordClass::IN,
            ttl: 120,
            cache_flush: false,
            data: RecordData::A { address },
        }
    }

    pub fn ptr_record(name: &str, target_name: &str) -> Record {
        Record {
            name: domain(name),
            class: RecordClass::IN,
            ttl: 120,
            cache_flush: false,
            data: RecordData::PTR {
                ptrdname: domain(target_name),
            },
        }
    }

    pub fn srv_record(name: &str, priority: u16, weight: u16, port: u16, target: &str) -> Record {
        Record {
            name: domain(name),
            class: RecordClass::IN,
            ttl: 120,
            cache_flush: false,
            data: RecordData::SRV {
                priority,
                weight,
                port,
                target: domain(target),
            },
        }
    }

    pub fn txt_record(name: &str, text: &str) -> Record {
        Record {
            name: domain(name),
            class: RecordClass::IN,
            ttl: 120,
            cache_flush: false,
            data: RecordData::TXT {
                octets: text.as_bytes().to_vec(),
            },
        }
    }

    pub fn hinfo_record(name: &str, cpu: &str, os: &str) -> Record {
        Record {
            name: domain(name),
            class: RecordClass::IN,
            ttl: 120,
            cache_flush: false,
            data: RecordData::HINFO {
                cpu: cpu.to_string(),
                os: os.to_string(),
            },
        }
    }

    pub fn cname_record(name: &str, target_name: &str) -> Record {
        Record {
            name: domain(name),
            class: RecordClass::IN,
            ttl: 120,
            cache_flush: false,
            data: RecordData::CNAME {
                cname: domain(target_name),
            },
        }
    }

    pub fn ns_record(name: &str, nameserver_name: &str) -> Record {
        Record {
            name: domain(name),
            class: RecordClass::IN,
            ttl: 120,
            cache_flush: false,
            data: RecordData::NS {
                nsdname: domain(nameserver_name),
            },
        }
    }

    pub fn goodbye(mut record: Record) -> Record {
        record.ttl = 0;
        record
    }

    pub fn flush(mut record: Record) -> Record {
        record.cache_flush = true;
        record
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn domainname_comparison_ignores_case() {
        assert_eq!(domain("Printer.Local"), domain("printer.local"));
        assert_eq!(domain("PRINTER.LOCAL."), domain("printer.local"));
    }

    #[test]
    fn domainname_trailing_dot_is_optional() {
        assert_eq!(domain("x.local."), domain("x.local"));
    }

    #[test]
    fn domainname_rejects_overlong_label() {
        let label = "x".repeat(LABEL_MAX_LEN + 1);
        assert_eq!(None, DomainName::from_dotted_string(&format!("{label}.local")));
    }

    #[test]
    fn domainname_rejects_overlong_name() {
        let name = format!("{}.{}.{}.{}.local", "a".repeat(63), "b".repeat(63), "c".repeat(63), "d".repeat(63));
        assert_eq!(None, DomainName::from_dotted_string(&name));
    }

    #[test]
    fn domainname_rejects_empty_middle_label() {
        assert_eq!(None, DomainName::from_dotted_string("a..local"));
    }

    #[test]
    fn dotted_string_roundtrip() {
        for name in ["printer.local", "_http._tcp.local", "."] {
            assert_eq!(name, domain(name).to_dotted_string());
        }
    }

    #[test]
    fn record_equality_ignores_ttl_and_flush() {
        let record = a_record("x.local", Ipv4Addr::new(10, 0, 0, 1));
        let mut refreshed = record.clone();
        refreshed.ttl = 5;
        refreshed.cache_flush = true;

        assert_eq!(record, refreshed);
    }

    #[test]
    fn record_equality_observes_data() {
        let a = a_record("x.local", Ipv4Addr::new(10, 0, 0, 1));
        let b = a_record("x.local", Ipv4Addr::new(10, 0, 0, 2));

        assert_ne!(a, b);
    }

    #[test]
    fn record_type_parse_and_display() {
        for rtype in [
            RecordType::A,
            RecordType::NS,
            RecordType::CNAME,
            RecordType::PTR,
            RecordType::HINFO,
            RecordType::TXT,
            RecordType::SRV,
        ] {
            assert_eq!(Ok(rtype), rtype.to_string().parse());
            assert_eq!(rtype, RecordType::from(u16::from(rtype)));
        }

        assert!("SPF".parse::<RecordType>().is_err());
    }
}
