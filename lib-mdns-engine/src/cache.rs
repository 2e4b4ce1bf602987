use priority_queue::PriorityQueue;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::Instant;

use mdns_types::protocol::types::*;

use crate::query::QueryId;
use crate::{CACHE_FLUSH_GRACE, SAME_BURST_WINDOW};

/// The record cache: everything this host has learned from the
/// network, keyed by record set.
///
/// All mutating operations take the current time and return the batch
/// of notifications they produced, for the caller to deliver to the
/// subscribed queries.  Records handed out are copies: nothing may
/// retain a reference into the cache across a reactor turn.
#[derive(Debug, Default)]
pub struct Cache {
    /// Current entries.  Within one key the record tuples are
    /// distinct; iteration order is unspecified but stable between
    /// mutations.
    entries: HashMap<RecordKey, Vec<CacheEntry>>,

    /// Each key's earliest expiry deadline.
    ///
    /// INVARIANT: the keys in here are exactly the keys in `entries`.
    expiry_priority: PriorityQueue<RecordKey, Reverse<Instant>>,

    /// Queries which want to hear about changes, per key.
    subscribers: HashMap<RecordKey, Vec<QueryId>>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    record: Record,
    expires_at: Instant,
    received_at: Instant,
}

/// A change of cache state.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CacheEvent {
    Added(Record),
    Removed(Record),
}

/// A change of cache state, addressed to one subscribed query.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Notification {
    pub subscriber: QueryId,
    pub event: CacheEvent,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current set for a key, possibly empty.  Entries which have
    /// expired but not yet been swept by `tick` are included.
    pub fn lookup(&self, key: &RecordKey) -> impl Iterator<Item = &Record> {
        self.entries
            .get(key)
            .into_iter()
            .flatten()
            .map(|entry| &entry.record)
    }

    /// The current set for a key as owned records, with each TTL
    /// rewritten to the remaining lifetime.  This is both the answer
    /// to a cache probe and the Known-Answer section of an outgoing
    /// question.
    pub fn records(&self, key: &RecordKey, now: Instant) -> Vec<Record> {
        self.entries
            .get(key)
            .into_iter()
            .flatten()
            .filter(|entry| entry.expires_at > now)
            .map(|entry| {
                let mut record = entry.record.clone();
                record.ttl = remaining_ttl(entry.expires_at, now);
                record
            })
            .collect()
    }

    /// Insert a record, or refresh its lifetime if the same (key,
    /// data) tuple is already present.  A refresh produces no
    /// notification: subscribers only hear about state changes.
    ///
    /// A record with the cache-flush bit set schedules every other
    /// record under its key for expiry one second out, unless that
    /// record arrived within the same reception burst.
    pub fn insert(&mut self, record: Record, now: Instant) -> Vec<Notification> {
        let key = record.key();
        let expires_at = now + std::time::Duration::from_secs(u64::from(record.ttl));
        let cache_flush = record.cache_flush;

        let mut added = None;
        {
            let entries = self.entries.entry(key.clone()).or_default();

            if let Some(existing) = entries.iter_mut().find(|entry| entry.record == record) {
                existing.expires_at = expires_at;
                existing.received_at = now;
                existing.record.cache_flush = cache_flush;
            } else {
                entries.push(CacheEntry {
                    record: record.clone(),
                    expires_at,
                    received_at: now,
                });
                added = Some(record);
            }

            if cache_flush {
                let deadline = now + CACHE_FLUSH_GRACE;
                for entry in entries.iter_mut() {
                    if now.duration_since(entry.received_at) > SAME_BURST_WINDOW
                        && entry.expires_at > deadline
                    {
                        entry.expires_at = deadline;
                    }
                }
            }
        }

        let notifications = match added {
            Some(record) => {
                tracing::trace!(%key, "cache add");
                self.notify(&key, CacheEvent::Added(record))
            }
            None => Vec::new(),
        };

        self.reindex(&key);
        notifications
    }

    /// Remove a record by exact (key, data) match, as on an explicit
    /// goodbye.  Removing an absent record is a no-op.
    pub fn remove(&mut self, record: &Record, _now: Instant) -> Vec<Notification> {
        let key = record.key();

        let Some(entries) = self.entries.get_mut(&key) else {
            return Vec::new();
        };
        let Some(index) = entries.iter().position(|entry| &entry.record == record) else {
            return Vec::new();
        };

        let removed = entries.swap_remove(index).record;
        tracing::trace!(%key, "cache remove");
        let notifications = self.notify(&key, CacheEvent::Removed(removed));
        self.reindex(&key);
        notifications
    }

    /// Expire records whose deadline has passed.
    pub fn tick(&mut self, now: Instant) -> Vec<Notification> {
        let mut notifications = Vec::new();

        while let Some((_, Reverse(deadline))) = self.expiry_priority.peek() {
            if *deadline > now {
                break;
            }

            // unwrap is safe: peek just succeeded
            let (key, _) = self.expiry_priority.pop().unwrap();

            let mut expired = Vec::new();
            if let Some(entries) = self.entries.get_mut(&key) {
                let mut kept = Vec::with_capacity(entries.len());
                for entry in entries.drain(..) {
                    if entry.expires_at > now {
                        kept.push(entry);
                    } else {
                        expired.push(entry.record);
                    }
                }
                *entries = kept;
            }

            for record in expired {
                tracing::trace!(%key, "cache expire");
                notifications.append(&mut self.notify(&key, CacheEvent::Removed(record)));
            }

            self.reindex(&key);
        }

        notifications
    }

    /// When the next `tick` has something to do.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.expiry_priority
            .peek()
            .map(|(_, Reverse(deadline))| *deadline)
    }

    /// Start notifying the query of changes under the key.
    pub fn subscribe(&mut self, key: &RecordKey, subscriber: QueryId) {
        let subscribers = self.subscribers.entry(key.clone()).or_default();
        if !subscribers.contains(&subscriber) {
            subscribers.push(subscriber);
        }
    }

    /// Stop notifying the query of changes under the key.
    pub fn unsubscribe(&mut self, key: &RecordKey, subscriber: QueryId) {
        if let Some(subscribers) = self.subscribers.get_mut(key) {
            subscribers.retain(|s| *s != subscriber);
            if subscribers.is_empty() {
                self.subscribers.remove(key);
            }
        }
    }

    /// Total number of cached records, across all keys.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn notify(&self, key: &RecordKey, event: CacheEvent) -> Vec<Notification> {
        match self.subscribers.get(key) {
            Some(subscribers) => subscribers
                .iter()
                .map(|subscriber| Notification {
                    subscriber: *subscriber,
                    event: event.clone(),
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Recompute the key's position in the expiry index after its
    /// entry list changed.
    fn reindex(&mut self, key: &RecordKey) {
        let earliest = self
            .entries
            .get(key)
            .into_iter()
            .flatten()
            .map(|entry| entry.expires_at)
            .min();

        match earliest {
            Some(deadline) => {
                self.expiry_priority.push(key.clone(), Reverse(deadline));
            }
            None => {
                self.entries.remove(key);
                self.expiry_priority.remove(key);
            }
        }
    }
}

fn remaining_ttl(expires_at: Instant, now: Instant) -> u32 {
    u32::try_from(expires_at.saturating_duration_since(now).as_secs()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use mdns_types::protocol::types::test_util::*;

    use super::*;

    fn subscriber() -> QueryId {
        QueryId(1)
    }

    #[test]
    fn insert_then_lookup() {
        for _ in 0..100 {
            let mut cache = Cache::new();
            let record = arbitrary_record();
            cache.insert(record.clone(), Instant::now());

            let found: Vec<&Record> = cache.lookup(&record.key()).collect();
            assert_eq!(vec![&record], found);
        }
    }

    #[test]
    fn insert_deduplicates_by_record_tuple() {
        let now = Instant::now();
        let mut cache = Cache::new();
        let record = a_record("x.local", Ipv4Addr::new(10, 0, 0, 1));

        cache.insert(record.clone(), now);
        cache.insert(record.clone(), now + Duration::from_secs(5));

        assert_eq!(1, cache.len());
        assert_eq!(1, cache.lookup(&record.key()).count());
    }

    #[test]
    fn distinct_records_share_a_key() {
        let now = Instant::now();
        let mut cache = Cache::new();
        let ptr1 = ptr_record("_http._tcp.local", "srv1._http._tcp.local");
        let ptr2 = ptr_record("_http._tcp.local", "srv2._http._tcp.local");

        cache.insert(ptr1.clone(), now);
        cache.insert(ptr2.clone(), now);

        assert_eq!(2, cache.lookup(&ptr1.key()).count());
    }

    #[test]
    fn refresh_does_not_notify() {
        let now = Instant::now();
        let mut cache = Cache::new();
        let record = a_record("x.local", Ipv4Addr::new(10, 0, 0, 1));
        cache.subscribe(&record.key(), subscriber());

        let first = cache.insert(record.clone(), now);
        let second = cache.insert(record.clone(), now + Duration::from_secs(30));

        assert_eq!(1, first.len());
        assert!(second.is_empty());
    }

    #[test]
    fn refresh_extends_lifetime() {
        let now = Instant::now();
        let mut cache = Cache::new();
        let record = a_record("x.local", Ipv4Addr::new(10, 0, 0, 1));

        cache.insert(record.clone(), now);
        cache.insert(record.clone(), now + Duration::from_secs(60));

        // the original deadline passes without expiry
        assert!(cache.tick(now + Duration::from_secs(121)).is_empty());
        assert_eq!(1, cache.lookup(&record.key()).count());
    }

    #[test]
    fn records_expire_at_their_deadline() {
        let now = Instant::now();
        let mut cache = Cache::new();
        let record = a_record("x.local", Ipv4Addr::new(10, 0, 0, 1));
        let key = record.key();
        cache.subscribe(&key, subscriber());

        cache.insert(record.clone(), now);

        assert!(cache.tick(now + Duration::from_secs(119)).is_empty());
        assert_eq!(1, cache.lookup(&key).count());

        let notifications = cache.tick(now + Duration::from_secs(120));
        assert_eq!(
            vec![Notification {
                subscriber: subscriber(),
                event: CacheEvent::Removed(record),
            }],
            notifications
        );
        assert_eq!(0, cache.lookup(&key).count());
        assert_eq!(None, cache.next_expiry());
    }

    #[test]
    fn cache_flush_evicts_older_records_after_grace() {
        let now = Instant::now();
        let mut cache = Cache::new();
        let old = a_record("x.local", Ipv4Addr::new(10, 0, 0, 1));
        let new = flush(a_record("x.local", Ipv4Addr::new(10, 0, 0, 2)));
        let key = old.key();
        cache.subscribe(&key, subscriber());

        cache.insert(old.clone(), now);
        let later = now + Duration::from_secs(5);
        cache.insert(new.clone(), later);

        // both visible within the grace second
        assert_eq!(2, cache.lookup(&key).count());

        let notifications = cache.tick(later + CACHE_FLUSH_GRACE);
        assert_eq!(
            vec![Notification {
                subscriber: subscriber(),
                event: CacheEvent::Removed(old),
            }],
            notifications
        );

        let found = cache.records(&key, later + CACHE_FLUSH_GRACE);
        assert_eq!(1, found.len());
        assert_eq!(new, found[0]);
    }

    #[test]
    fn cache_flush_spares_same_burst_records() {
        let now = Instant::now();
        let mut cache = Cache::new();
        let first = a_record("x.local", Ipv4Addr::new(10, 0, 0, 1));
        let second = flush(a_record("x.local", Ipv4Addr::new(10, 0, 0, 2)));
        let key = first.key();

        cache.insert(first, now);
        cache.insert(second, now + Duration::from_millis(500));

        // nothing scheduled out at the grace deadline: both survive
        assert!(cache
            .tick(now + Duration::from_millis(500) + CACHE_FLUSH_GRACE)
            .is_empty());
        assert_eq!(2, cache.lookup(&key).count());
    }

    #[test]
    fn remove_is_exact_and_idempotent() {
        let now = Instant::now();
        let mut cache = Cache::new();
        let ptr1 = ptr_record("_http._tcp.local", "srv1._http._tcp.local");
        let ptr2 = ptr_record("_http._tcp.local", "srv2._http._tcp.local");
        let key = ptr1.key();
        cache.subscribe(&key, subscriber());

        cache.insert(ptr1.clone(), now);
        cache.insert(ptr2.clone(), now);

        let notifications = cache.remove(&ptr1, now);
        assert_eq!(
            vec![Notification {
                subscriber: subscriber(),
                event: CacheEvent::Removed(ptr1.clone()),
            }],
            notifications
        );
        assert!(cache.remove(&ptr1, now).is_empty());

        let found: Vec<&Record> = cache.lookup(&key).collect();
        assert_eq!(vec![&ptr2], found);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let now = Instant::now();
        let mut cache = Cache::new();
        let record = a_record("x.local", Ipv4Addr::new(10, 0, 0, 1));
        let key = record.key();

        cache.subscribe(&key, subscriber());
        cache.unsubscribe(&key, subscriber());

        assert!(cache.insert(record, now).is_empty());
    }

    #[test]
    fn records_rewrites_ttl_to_remaining_lifetime() {
        let now = Instant::now();
        let mut cache = Cache::new();
        let record = a_record("x.local", Ipv4Addr::new(10, 0, 0, 1));
        let key = record.key();

        cache.insert(record, now);

        let found = cache.records(&key, now + Duration::from_secs(50));
        assert_eq!(1, found.len());
        assert_eq!(70, found[0].ttl);

        assert!(cache.records(&key, now + Duration::from_secs(120)).is_empty());
    }
}
