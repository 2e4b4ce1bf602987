use std::time::Duration;

use mdns_types::protocol::types::*;

use crate::control::ClientId;
use crate::{MAX_QUERY_ATTEMPTS, RETRY_INTERVAL, RETRY_INTERVAL_MAX};

/// Identifies one query aggregate for the lifetime of the engine.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u64);

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// What kind of question a client asked.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum QueryStyle {
    /// One record, one answer, done.
    Lookup,

    /// Stream changes to one PTR record set until cancelled.
    Browse,

    /// Collect a service instance's SRV, TXT, and address records,
    /// then answer once with the composed service.
    Resolve,
}

/// Progress of one record set within a query.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SlotState {
    /// Waiting for the initial jittered transmission.
    PendingFirst,

    /// Transmitted n times, waiting for an answer or the next
    /// retransmission.
    PendingRetry(u32),

    /// An answer arrived.
    Answered,

    /// Retransmissions exhausted without an answer.
    Dead,
}

/// One pending record set in a query: the key, how far its
/// transmissions have got, and the answering record once there is
/// one.
#[derive(Debug)]
pub struct Slot {
    pub key: RecordKey,
    pub state: SlotState,
    pub answer: Option<Record>,
}

impl Slot {
    fn new(key: RecordKey) -> Self {
        Self {
            key,
            state: SlotState::PendingFirst,
            answer: None,
        }
    }

    fn is_pending(&self) -> bool {
        matches!(
            self.state,
            SlotState::PendingFirst | SlotState::PendingRetry(_)
        )
    }
}

/// What a timer fire asks the engine to do.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TimerAction {
    /// Transmit questions for these keys and re-arm the timer.
    Transmit {
        keys: Vec<RecordKey>,
        rearm: Duration,
    },

    /// Every pending slot has run out of retransmissions; the query
    /// has failed.
    Exhausted,

    /// Nothing left to transmit and nothing to wait for.
    Idle,
}

/// The effect of a cache addition on a query.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AddOutcome {
    /// Not relevant to this query.
    Ignored,

    /// A browse hit: forward to the client immediately.
    Streamed(Record),

    /// A pending slot was answered.  For a resolve learning its SRV,
    /// `appended` carries the new address slot's key, which still
    /// needs a cache probe, a question, and a subscription.
    SlotAnswered { appended: Option<RecordKey> },
}

/// One client request in flight: a group of record-set slots driven
/// by a shared retransmission timer.  This is a pure state machine;
/// the engine owns the clock, the cache, and the sockets.
#[derive(Debug)]
pub struct Query {
    pub id: QueryId,
    pub client: ClientId,
    pub style: QueryStyle,
    slots: Vec<Slot>,
    attempt: u32,
}

impl Query {
    pub fn lookup(id: QueryId, client: ClientId, key: RecordKey) -> Self {
        Self {
            id,
            client,
            style: QueryStyle::Lookup,
            slots: vec![Slot::new(key)],
            attempt: 0,
        }
    }

    pub fn browse(id: QueryId, client: ClientId, key: RecordKey) -> Self {
        Self {
            id,
            client,
            style: QueryStyle::Browse,
            slots: vec![Slot::new(key)],
            attempt: 0,
        }
    }

    /// A resolve starts with SRV and TXT slots for the instance name;
    /// the address slot is appended once the SRV target is known.
    pub fn resolve(id: QueryId, client: ClientId, name: &DomainName) -> Self {
        let srv = RecordKey {
            name: name.clone(),
            rtype: RecordType::SRV,
            class: RecordClass::IN,
        };
        let txt = RecordKey {
            name: name.clone(),
            rtype: RecordType::TXT,
            class: RecordClass::IN,
        };
        Self {
            id,
            client,
            style: QueryStyle::Resolve,
            slots: vec![Slot::new(srv), Slot::new(txt)],
            attempt: 0,
        }
    }

    pub fn slot_keys(&self) -> impl Iterator<Item = &RecordKey> {
        self.slots.iter().map(|slot| &slot.key)
    }

    pub fn has_slot(&self, key: &RecordKey) -> bool {
        self.slots.iter().any(|slot| &slot.key == key)
    }

    /// Whether a request for (style, key) duplicates this query.
    pub fn matches_request(&self, style: QueryStyle, key: &RecordKey) -> bool {
        self.style == style && self.has_slot(key)
    }

    /// Append a slot awaiting its first transmission.
    pub fn push_slot(&mut self, key: RecordKey) {
        self.slots.push(Slot::new(key));
    }

    /// Mark the slot for a key answered, out of band of the cache
    /// notification path (cache pre-population at construction).
    pub fn answer_slot(&mut self, key: &RecordKey, record: Record) {
        if let Some(slot) = self.slots.iter_mut().find(|slot| &slot.key == key) {
            slot.state = SlotState::Answered;
            slot.answer = Some(record);
        }
    }

    /// All slots answered, for a style which can complete.  A browse
    /// never completes on its own.
    pub fn is_complete(&self) -> bool {
        self.style != QueryStyle::Browse
            && self
                .slots
                .iter()
                .all(|slot| slot.state == SlotState::Answered)
    }

    /// The answer to a completed lookup.
    pub fn final_answer(&self) -> Option<&Record> {
        self.slots.first().and_then(|slot| slot.answer.as_ref())
    }

    /// The instance name a resolve was created for.
    pub fn resolve_name(&self) -> Option<&DomainName> {
        self.slots
            .iter()
            .find(|slot| slot.key.rtype == RecordType::SRV)
            .map(|slot| &slot.key.name)
    }

    /// The composed result of a completed resolve: endpoint fields
    /// from the SRV, metadata from the TXT, address from the A, name
    /// from the SRV slot's key.
    pub fn service(&self) -> Option<Service> {
        let mut name = None;
        let mut txt = Vec::new();
        let mut priority = 0;
        let mut weight = 0;
        let mut port = 0;
        let mut addr = None;

        for slot in &self.slots {
            match slot.answer.as_ref().map(|record| &record.data) {
                Some(RecordData::SRV {
                    priority: p,
                    weight: w,
                    port: pt,
                    ..
                }) => {
                    name = Some(slot.key.name.clone());
                    priority = *p;
                    weight = *w;
                    port = *pt;
                }
                Some(RecordData::TXT { octets }) => txt = octets.clone(),
                Some(RecordData::A { address }) => addr = Some(*address),
                _ => {}
            }
        }

        Some(Service {
            name: name?,
            txt,
            priority,
            weight,
            port,
            addr: addr?,
        })
    }

    /// Drive the retransmission schedule one step.  The first fire
    /// transmits and arms a one-second retry; each later fire doubles
    /// the interval up to the cap; after [`MAX_QUERY_ATTEMPTS`] fires
    /// a lookup or resolve is exhausted, while a browse settles into
    /// the maintenance cadence.
    pub fn on_timer(&mut self) -> TimerAction {
        if self.attempt >= MAX_QUERY_ATTEMPTS {
            if self.style == QueryStyle::Browse {
                let keys = self.pending_keys();
                return TimerAction::Transmit {
                    keys,
                    rearm: RETRY_INTERVAL_MAX,
                };
            }

            for slot in &mut self.slots {
                if slot.is_pending() {
                    slot.state = SlotState::Dead;
                }
            }
            return TimerAction::Exhausted;
        }

        self.attempt += 1;

        let mut keys = Vec::new();
        for slot in &mut self.slots {
            match slot.state {
                SlotState::PendingFirst => {
                    slot.state = SlotState::PendingRetry(1);
                    keys.push(slot.key.clone());
                }
                SlotState::PendingRetry(n) => {
                    slot.state = SlotState::PendingRetry(n + 1);
                    keys.push(slot.key.clone());
                }
                SlotState::Answered | SlotState::Dead => {}
            }
        }

        if keys.is_empty() && self.style != QueryStyle::Browse {
            return TimerAction::Idle;
        }

        TimerAction::Transmit {
            keys,
            rearm: retry_interval(self.attempt),
        }
    }

    /// React to a record appearing in the cache under a subscribed
    /// key.
    pub fn on_cache_add(&mut self, record: &Record) -> AddOutcome {
        if self.style == QueryStyle::Browse {
            return AddOutcome::Streamed(record.clone());
        }

        let record_key = record.key();
        let Some(slot) = self
            .slots
            .iter_mut()
            .find(|slot| slot.key == record_key && slot.is_pending())
        else {
            return AddOutcome::Ignored;
        };

        slot.state = SlotState::Answered;
        slot.answer = Some(record.clone());

        let mut appended = None;
        if self.style == QueryStyle::Resolve {
            if let RecordData::SRV { target, .. } = &record.data {
                let a_key = RecordKey {
                    name: target.clone(),
                    rtype: RecordType::A,
                    class: RecordClass::IN,
                };
                if !self.has_slot(&a_key) {
                    self.push_slot(a_key.clone());
                    appended = Some(a_key);
                }
            }
        }

        AddOutcome::SlotAnswered { appended }
    }

    fn pending_keys(&self) -> Vec<RecordKey> {
        self.slots
            .iter()
            .filter(|slot| slot.is_pending())
            .map(|slot| slot.key.clone())
            .collect()
    }
}

/// The interval armed after the nth fire: 1 s after the first, then
/// doubling, capped at [`RETRY_INTERVAL_MAX`].
fn retry_interval(attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(6);
    (RETRY_INTERVAL * 2u32.pow(doublings)).min(RETRY_INTERVAL_MAX)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use mdns_types::protocol::types::test_util::*;

    use super::*;

    fn qid() -> QueryId {
        QueryId(1)
    }

    fn cid() -> ClientId {
        ClientId(1)
    }

    #[test]
    fn lookup_timer_observes_backoff_schedule() {
        let mut query = Query::lookup(qid(), cid(), key("x.local", RecordType::A));

        let mut intervals = Vec::new();
        loop {
            match query.on_timer() {
                TimerAction::Transmit { keys, rearm } => {
                    assert_eq!(vec![key("x.local", RecordType::A)], keys);
                    intervals.push(rearm.as_secs());
                }
                TimerAction::Exhausted => break,
                TimerAction::Idle => panic!("lookup went idle"),
            }
        }

        assert_eq!(vec![1, 2, 4, 8, 16, 32], intervals);
    }

    #[test]
    fn browse_settles_into_maintenance_cadence() {
        let mut query = Query::browse(qid(), cid(), key("_http._tcp.local", RecordType::PTR));

        for _ in 0..MAX_QUERY_ATTEMPTS {
            assert!(matches!(query.on_timer(), TimerAction::Transmit { .. }));
        }

        for _ in 0..3 {
            match query.on_timer() {
                TimerAction::Transmit { keys, rearm } => {
                    assert_eq!(vec![key("_http._tcp.local", RecordType::PTR)], keys);
                    assert_eq!(RETRY_INTERVAL_MAX, rearm);
                }
                other => panic!("browse stopped transmitting: {other:?}"),
            }
        }
    }

    #[test]
    fn answered_lookup_stops_transmitting() {
        let mut query = Query::lookup(qid(), cid(), key("x.local", RecordType::A));
        let record = a_record("x.local", Ipv4Addr::new(10, 0, 0, 1));

        assert_eq!(
            AddOutcome::SlotAnswered { appended: None },
            query.on_cache_add(&record)
        );
        assert!(query.is_complete());
        assert_eq!(Some(&record), query.final_answer());
        assert_eq!(TimerAction::Idle, query.on_timer());
    }

    #[test]
    fn second_answer_for_a_slot_is_ignored() {
        let mut query = Query::lookup(qid(), cid(), key("x.local", RecordType::A));

        query.on_cache_add(&a_record("x.local", Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(
            AddOutcome::Ignored,
            query.on_cache_add(&a_record("x.local", Ipv4Addr::new(10, 0, 0, 2)))
        );
    }

    #[test]
    fn browse_streams_and_never_completes() {
        let mut query = Query::browse(qid(), cid(), key("_http._tcp.local", RecordType::PTR));
        let hit = ptr_record("_http._tcp.local", "srv1._http._tcp.local");

        assert_eq!(AddOutcome::Streamed(hit.clone()), query.on_cache_add(&hit));
        assert!(!query.is_complete());
    }

    #[test]
    fn resolve_appends_address_slot_when_srv_arrives() {
        let mut query = Query::resolve(qid(), cid(), &domain("srv1._http._tcp.local"));
        assert_eq!(2, query.slot_keys().count());

        let srv = srv_record("srv1._http._tcp.local", 0, 0, 8080, "host.local");
        let outcome = query.on_cache_add(&srv);
        assert_eq!(
            AddOutcome::SlotAnswered {
                appended: Some(key("host.local", RecordType::A)),
            },
            outcome
        );
        assert_eq!(3, query.slot_keys().count());
        assert!(!query.is_complete());
    }

    #[test]
    fn resolve_composes_service_from_all_three_answers() {
        let mut query = Query::resolve(qid(), cid(), &domain("srv1._http._tcp.local"));

        query.on_cache_add(&srv_record("srv1._http._tcp.local", 10, 20, 8080, "host.local"));
        query.on_cache_add(&txt_record("srv1._http._tcp.local", "path=/"));
        assert!(!query.is_complete());

        query.on_cache_add(&a_record("host.local", Ipv4Addr::new(10, 0, 0, 7)));
        assert!(query.is_complete());

        assert_eq!(
            Some(Service {
                name: domain("srv1._http._tcp.local"),
                txt: b"path=/".to_vec(),
                priority: 10,
                weight: 20,
                port: 8080,
                addr: Ipv4Addr::new(10, 0, 0, 7),
            }),
            query.service()
        );
    }

    #[test]
    fn resolve_with_duplicate_srv_target_keeps_one_address_slot() {
        let mut query = Query::resolve(qid(), cid(), &domain("srv1._http._tcp.local"));
        query.push_slot(key("host.local", RecordType::A));

        let srv = srv_record("srv1._http._tcp.local", 0, 0, 8080, "host.local");
        assert_eq!(
            AddOutcome::SlotAnswered { appended: None },
            query.on_cache_add(&srv)
        );
        assert_eq!(3, query.slot_keys().count());
    }

    #[test]
    fn dedup_matches_on_style_and_key() {
        let query = Query::lookup(qid(), cid(), key("x.local", RecordType::A));

        assert!(query.matches_request(QueryStyle::Lookup, &key("x.local", RecordType::A)));
        assert!(!query.matches_request(QueryStyle::Browse, &key("x.local", RecordType::A)));
        assert!(!query.matches_request(QueryStyle::Lookup, &key("y.local", RecordType::A)));
    }
}
