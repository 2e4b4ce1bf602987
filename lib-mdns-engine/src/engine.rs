use priority_queue::PriorityQueue;
use rand::Rng;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use mdns_types::control::types::{ControlRequest, ControlResponse};
use mdns_types::protocol::types::{Record, RecordKey};

use crate::cache::{Cache, CacheEvent, Notification};
use crate::control::{Client, ClientId};
use crate::metrics::Metrics;
use crate::query::{AddOutcome, QueryId, QueryStyle, TimerAction};
use crate::question::QuestionRegistry;
use crate::{FIRST_QUERY_DELAY_MAX, FIRST_QUERY_DELAY_MIN};

/// Everything that can happen to the engine, on one stream.  The
/// socket tasks produce these; the engine is the only consumer and
/// the only owner of any state.
#[derive(Debug)]
pub enum Event {
    /// A client connected to the control socket; its answers go out
    /// through `tx`.
    Connected {
        client: ClientId,
        tx: mpsc::UnboundedSender<ControlResponse>,
    },

    /// A client sent a well-formed frame.
    Request {
        client: ClientId,
        request: ControlRequest,
    },

    /// A client went away; all of its queries die with it.
    Disconnected { client: ClientId },

    /// The network layer saw a record in a multicast response.
    Record { record: Record },
}

/// One question for the network layer to put on the wire, with the
/// cache's current records for the key so responders can suppress
/// answers we already hold.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OutboundQuestion {
    pub key: RecordKey,
    pub known_answers: Vec<Record>,
}

/// The query engine.  Single-threaded and cooperative: all state
/// lives here, events arrive on one channel, and the only other
/// wakeups are its own timers.
pub struct Engine {
    pub(crate) cache: Cache,
    pub(crate) questions: QuestionRegistry,
    pub(crate) clients: HashMap<ClientId, Client>,
    pub(crate) queries: HashMap<QueryId, crate::query::Query>,

    /// Each live query's next timer fire.
    pub(crate) deadlines: PriorityQueue<QueryId, Reverse<Instant>>,

    pub(crate) metrics: Metrics,
    network: mpsc::UnboundedSender<OutboundQuestion>,
    next_query: u64,
}

impl Engine {
    pub fn new(network: mpsc::UnboundedSender<OutboundQuestion>) -> Self {
        Self {
            cache: Cache::new(),
            questions: QuestionRegistry::new(),
            clients: HashMap::new(),
            queries: HashMap::new(),
            deadlines: PriorityQueue::new(),
            metrics: Metrics::new(),
            network,
            next_query: 0,
        }
    }

    /// Run until the event channel closes.  Within one wakeup, cache
    /// changes are always processed before due timers, so an answer
    /// that has already arrived cancels a retransmission scheduled
    /// for the same instant.
    ///
    /// Time comes from the tokio clock (as `Instant`s the rest of the
    /// engine can do arithmetic on), so tests can drive the whole
    /// retransmission schedule with the clock paused.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event, tokio::time::Instant::now().into_std()),
                    None => break,
                },
                () = sleep_until(self.next_wakeup()) => self.on_tick(tokio::time::Instant::now().into_std()),
            }
        }

        tracing::info!(metrics = ?self.metrics, "engine stopped");
    }

    pub fn handle_event(&mut self, event: Event, now: Instant) {
        match event {
            Event::Connected { client, tx } => {
                tracing::debug!(%client, "client connected");
                self.clients.insert(client, Client::new(tx));
            }
            Event::Request { client, request } => self.handle_request(client, request, now),
            Event::Disconnected { client } => self.disconnect(client),
            Event::Record { record } => self.on_record(record, now),
        }
    }

    /// The earliest instant at which `on_tick` has work: a cache
    /// expiry or a query timer.
    pub fn next_wakeup(&self) -> Option<Instant> {
        let cache = self.cache.next_expiry();
        let timer = self
            .deadlines
            .peek()
            .map(|(_, Reverse(deadline))| *deadline);

        match (cache, timer) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Expire cache entries and fire due query timers, in that order.
    pub fn on_tick(&mut self, now: Instant) {
        let notifications = self.cache.tick(now);
        self.deliver(notifications, now);

        while let Some((_, Reverse(deadline))) = self.deadlines.peek() {
            if *deadline > now {
                break;
            }

            // unwrap is safe: peek just succeeded
            let (id, _) = self.deadlines.pop().unwrap();
            self.fire_timer(id, now);
        }
    }

    fn disconnect(&mut self, client: ClientId) {
        let Some(state) = self.clients.remove(&client) else {
            return;
        };

        tracing::debug!(%client, queries = state.queries.len(), "client disconnected");
        for id in state.queries {
            self.destroy_query(id);
        }
    }

    /// Route a record learned from the network: a goodbye withdraws
    /// the exact record, anything else is inserted or refreshed.
    fn on_record(&mut self, record: Record, now: Instant) {
        let notifications = if record.is_goodbye() {
            self.cache.remove(&record, now)
        } else {
            self.cache.insert(record, now)
        };
        self.deliver(notifications, now);
    }

    fn deliver(&mut self, notifications: Vec<Notification>, now: Instant) {
        for Notification { subscriber, event } in notifications {
            match event {
                CacheEvent::Added(record) => self.query_saw_add(subscriber, &record, now),
                CacheEvent::Removed(record) => self.query_saw_remove(subscriber, &record),
            }
        }
    }

    fn query_saw_add(&mut self, id: QueryId, record: &Record, now: Instant) {
        let outcome = match self.queries.get_mut(&id) {
            Some(query) => query.on_cache_add(record),
            None => return,
        };

        match outcome {
            AddOutcome::Ignored => {}
            AddOutcome::Streamed(record) => {
                // unwrap is safe: the query was just looked up
                let client = self.queries.get(&id).unwrap().client;
                self.respond(client, ControlResponse::BrowseAdd(record));
            }
            AddOutcome::SlotAnswered { appended } => {
                if let Some(a_key) = appended {
                    self.attach_slot(id, &a_key, now);
                }
                self.finish_if_complete(id);
            }
        }
    }

    fn query_saw_remove(&mut self, id: QueryId, record: &Record) {
        let Some(query) = self.queries.get(&id) else {
            return;
        };

        if query.style == QueryStyle::Browse {
            let client = query.client;
            self.respond(client, ControlResponse::BrowseDel(record.clone()));
        }
    }

    /// Wire a newly appended slot into the cache and the question
    /// registry, answering it straight from the cache when possible.
    pub(crate) fn attach_slot(&mut self, id: QueryId, key: &RecordKey, now: Instant) {
        self.questions.add(key);
        self.cache.subscribe(key, id);

        let cached = self.cache.records(key, now).into_iter().next();
        self.metrics.cache_hit_or_miss(cached.is_some());
        match cached {
            Some(record) => {
                if let Some(query) = self.queries.get_mut(&id) {
                    query.answer_slot(key, record);
                }
            }
            None => self.arm_timer(id, now + first_query_delay()),
        }
    }

    /// Emit the final answer and tear the query down, if every slot
    /// is now answered.
    pub(crate) fn finish_if_complete(&mut self, id: QueryId) {
        let Some(query) = self.queries.get(&id) else {
            return;
        };
        if !query.is_complete() {
            return;
        }

        let client = query.client;
        let response = match query.style {
            QueryStyle::Lookup => query.final_answer().cloned().map(ControlResponse::Lookup),
            QueryStyle::Resolve => query.service().map(ControlResponse::Resolve),
            QueryStyle::Browse => None,
        };

        if let Some(response) = response {
            self.respond(client, response);
        }
        self.destroy_query(id);
    }

    fn fire_timer(&mut self, id: QueryId, now: Instant) {
        let action = match self.queries.get_mut(&id) {
            Some(query) => query.on_timer(),
            None => return,
        };

        match action {
            TimerAction::Transmit { keys, rearm } => {
                for key in keys {
                    self.send_question(&key, now);
                }
                self.arm_timer(id, now + rearm);
            }
            TimerAction::Exhausted => {
                if let Some(query) = self.queries.get(&id) {
                    tracing::debug!(query = %id, "retransmissions exhausted");
                    self.metrics.queries_failed += 1;

                    let client = query.client;
                    let response = match query.style {
                        QueryStyle::Lookup => query
                            .slot_keys()
                            .next()
                            .cloned()
                            .map(ControlResponse::LookupFailed),
                        QueryStyle::Resolve => query
                            .resolve_name()
                            .cloned()
                            .map(ControlResponse::ResolveFailed),
                        QueryStyle::Browse => None,
                    };
                    if let Some(response) = response {
                        self.respond(client, response);
                    }
                }
                self.destroy_query(id);
            }
            TimerAction::Idle => {}
        }
    }

    /// Hand a question to the network layer, unless another query
    /// transmitted the same question a moment ago.
    pub(crate) fn send_question(&mut self, key: &RecordKey, now: Instant) {
        if !self.questions.should_send(key, now) {
            self.metrics.questions_suppressed += 1;
            return;
        }

        self.questions.mark_sent(key, now);
        self.metrics.questions_sent += 1;

        let known_answers = self.cache.records(key, now);
        tracing::debug!(%key, known_answers = known_answers.len(), "sending question");
        if self
            .network
            .send(OutboundQuestion {
                key: key.clone(),
                known_answers,
            })
            .is_err()
        {
            tracing::debug!("network channel closed");
        }
    }

    pub(crate) fn respond(&mut self, client: ClientId, response: ControlResponse) {
        self.metrics.answers_delivered += 1;
        if let Some(state) = self.clients.get(&client) {
            if state.tx.send(response).is_err() {
                tracing::debug!(%client, "client channel closed");
            }
        }
    }

    /// Tear a query down completely: timer disarmed, every slot's
    /// question reference released, every subscription dropped.  No
    /// caller can observe it half-gone.
    pub(crate) fn destroy_query(&mut self, id: QueryId) {
        let Some(query) = self.queries.remove(&id) else {
            return;
        };

        self.deadlines.remove(&id);
        for key in query.slot_keys() {
            self.cache.unsubscribe(key, id);
            self.questions.release(key);
        }
        if let Some(state) = self.clients.get_mut(&query.client) {
            state.queries.retain(|q| *q != id);
        }

        tracing::debug!(query = %id, "query destroyed");
    }

    /// Arm the query's timer, keeping an already-earlier deadline.
    pub(crate) fn arm_timer(&mut self, id: QueryId, at: Instant) {
        let already_earlier = matches!(
            self.deadlines.get_priority(&id),
            Some(Reverse(existing)) if *existing <= at
        );
        if !already_earlier {
            self.deadlines.push(id, Reverse(at));
        }
    }

    pub(crate) fn next_query_id(&mut self) -> QueryId {
        self.next_query += 1;
        QueryId(self.next_query)
    }
}

/// The jittered delay before a query's first transmission.
pub(crate) fn first_query_delay() -> Duration {
    rand::thread_rng().gen_range(FIRST_QUERY_DELAY_MIN..=FIRST_QUERY_DELAY_MAX)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}
