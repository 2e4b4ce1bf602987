//! Request handling for control-socket clients: validation,
//! per-client duplicate rejection, cache-first query construction,
//! and browse cancellation.

use std::fmt;
use std::time::Instant;

use tokio::sync::mpsc;

use mdns_types::control::types::{ControlRequest, ControlResponse};
use mdns_types::protocol::types::*;

use crate::engine::Engine;
use crate::query::{Query, QueryId, QueryStyle};

/// Identifies one control-socket connection for the lifetime of the
/// engine.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Per-connection state: where answers go, and which queries the
/// connection owns.  The queries die with the connection.
#[derive(Debug)]
pub struct Client {
    pub tx: mpsc::UnboundedSender<ControlResponse>,
    pub queries: Vec<QueryId>,
}

impl Client {
    pub fn new(tx: mpsc::UnboundedSender<ControlResponse>) -> Self {
        Self {
            tx,
            queries: Vec::new(),
        }
    }
}

/// The record types a client may look up.
const SUPPORTED_LOOKUP_TYPES: [RecordType; 5] = [
    RecordType::A,
    RecordType::HINFO,
    RecordType::PTR,
    RecordType::SRV,
    RecordType::TXT,
];

impl Engine {
    pub(crate) fn handle_request(
        &mut self,
        client: ClientId,
        request: ControlRequest,
        now: Instant,
    ) {
        if !self.clients.contains_key(&client) {
            // raced a disconnect, nowhere to answer to
            return;
        }

        match request {
            ControlRequest::Lookup(key) => self.control_lookup(client, key, now),
            ControlRequest::BrowseAdd(key) => self.control_browse_add(client, key, now),
            ControlRequest::BrowseDel(key) => self.control_browse_del(client, &key),
            ControlRequest::Resolve(name) => self.control_resolve(client, &name, now),
        }
    }

    fn control_lookup(&mut self, client: ClientId, key: RecordKey, now: Instant) {
        if !SUPPORTED_LOOKUP_TYPES.contains(&key.rtype) {
            tracing::warn!(rtype = %key.rtype, "lookup type not supported/implemented");
            self.metrics.rejected_requests += 1;
            return;
        }
        if key.class != RecordClass::IN {
            tracing::warn!(class = %key.class, "lookup class not supported/implemented");
            self.metrics.rejected_requests += 1;
            return;
        }
        if self.is_duplicate(client, QueryStyle::Lookup, &key) {
            return;
        }

        tracing::debug!(%key, "looking up");

        // cache hit: answer now, no query is created at all
        let cached = self.cache.records(&key, now);
        self.metrics.cache_hit_or_miss(!cached.is_empty());
        if let Some(record) = cached.into_iter().next() {
            self.respond(client, ControlResponse::Lookup(record));
            return;
        }

        let id = self.next_query_id();
        self.create_query(Query::lookup(id, client, key), now);
    }

    fn control_browse_add(&mut self, client: ClientId, key: RecordKey, now: Instant) {
        if key.rtype != RecordType::PTR {
            tracing::warn!(rtype = %key.rtype, "browse type not supported/implemented");
            self.metrics.rejected_requests += 1;
            return;
        }
        if key.class != RecordClass::IN {
            tracing::warn!(class = %key.class, "browse class not supported/implemented");
            self.metrics.rejected_requests += 1;
            return;
        }
        if self.is_duplicate(client, QueryStyle::Browse, &key) {
            return;
        }

        tracing::debug!(%key, "browse add");

        // everything already known streams first, then the query
        // watches for changes
        let cached = self.cache.records(&key, now);
        self.metrics.cache_hit_or_miss(!cached.is_empty());
        for record in cached {
            self.respond(client, ControlResponse::BrowseAdd(record));
        }

        let id = self.next_query_id();
        self.create_query(Query::browse(id, client, key), now);
    }

    fn control_browse_del(&mut self, client: ClientId, key: &RecordKey) {
        if key.rtype != RecordType::PTR {
            tracing::warn!(rtype = %key.rtype, "browse type not supported/implemented");
            self.metrics.rejected_requests += 1;
            return;
        }
        if key.class != RecordClass::IN {
            tracing::warn!(class = %key.class, "browse class not supported/implemented");
            self.metrics.rejected_requests += 1;
            return;
        }

        let Some(state) = self.clients.get(&client) else {
            return;
        };
        let found = state.queries.iter().copied().find(|id| {
            self.queries
                .get(id)
                .is_some_and(|query| query.matches_request(QueryStyle::Browse, key))
        });

        // a miss is not an error: the browse may have raced a
        // disconnect on another channel
        if let Some(id) = found {
            tracing::debug!(%key, "browse del");
            self.destroy_query(id);
        }
    }

    fn control_resolve(&mut self, client: ClientId, name: &DomainName, now: Instant) {
        let srv_key = RecordKey {
            name: name.clone(),
            rtype: RecordType::SRV,
            class: RecordClass::IN,
        };
        let txt_key = RecordKey {
            name: name.clone(),
            rtype: RecordType::TXT,
            class: RecordClass::IN,
        };

        if self.is_duplicate(client, QueryStyle::Resolve, &srv_key) {
            return;
        }

        tracing::debug!(%name, "resolve");

        // probe for all three components; the address key only exists
        // once the SRV is known
        let srv_cache = self.cache.records(&srv_key, now).into_iter().next();
        let txt_cache = self.cache.records(&txt_key, now).into_iter().next();
        let a_cache = srv_cache.as_ref().and_then(|record| match &record.data {
            RecordData::SRV { target, .. } => {
                let a_key = RecordKey {
                    name: target.clone(),
                    rtype: RecordType::A,
                    class: RecordClass::IN,
                };
                self.cache.records(&a_key, now).into_iter().next()
            }
            _ => None,
        });

        // fully cached: compose and answer without creating a query
        if let (Some(srv), Some(txt), Some(a)) = (&srv_cache, &txt_cache, &a_cache) {
            if let (
                RecordData::SRV {
                    priority,
                    weight,
                    port,
                    ..
                },
                RecordData::TXT { octets },
                RecordData::A { address },
            ) = (&srv.data, &txt.data, &a.data)
            {
                self.metrics.cache_hit_or_miss(true);
                self.respond(
                    client,
                    ControlResponse::Resolve(Service {
                        name: name.clone(),
                        txt: octets.clone(),
                        priority: *priority,
                        weight: *weight,
                        port: *port,
                        addr: *address,
                    }),
                );
                return;
            }
        }
        self.metrics.cache_hit_or_miss(false);

        let id = self.next_query_id();
        let mut query = Query::resolve(id, client, name);

        if let Some(srv) = srv_cache {
            let data = srv.data.clone();
            query.answer_slot(&srv_key, srv);
            if let RecordData::SRV { target, .. } = data {
                let a_key = RecordKey {
                    name: target,
                    rtype: RecordType::A,
                    class: RecordClass::IN,
                };
                if !query.has_slot(&a_key) {
                    query.push_slot(a_key.clone());
                    if let Some(a) = a_cache {
                        query.answer_slot(&a_key, a);
                    }
                }
            }
        }
        if let Some(txt) = txt_cache {
            query.answer_slot(&txt_key, txt);
        }

        self.create_query(query, now);
    }

    /// Wire a new query into the engine: questions registered,
    /// subscriptions placed for every slot, timer armed with the
    /// initial jitter.
    fn create_query(&mut self, query: Query, now: Instant) {
        let id = query.id;
        let client = query.client;

        for key in query.slot_keys() {
            self.questions.add(key);
            self.cache.subscribe(key, id);
        }

        self.queries.insert(id, query);
        if let Some(state) = self.clients.get_mut(&client) {
            state.queries.push(id);
        }
        self.metrics.queries_created += 1;

        self.arm_timer(id, now + crate::engine::first_query_delay());
    }

    /// The per-client duplicate check: a request whose (style, key)
    /// matches a query the client already has is dropped silently.
    fn is_duplicate(&mut self, client: ClientId, style: QueryStyle, key: &RecordKey) -> bool {
        let Some(state) = self.clients.get(&client) else {
            return false;
        };

        for id in &state.queries {
            if let Some(query) = self.queries.get(id) {
                if query.matches_request(style, key) {
                    tracing::debug!(%client, %key, "already querying");
                    self.metrics.duplicate_requests += 1;
                    return true;
                }
            }
        }

        false
    }
}
