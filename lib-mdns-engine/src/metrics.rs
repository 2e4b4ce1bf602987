/// Counters accumulated by the engine over its lifetime.  The engine
/// updates this structure as it works and logs it on shutdown, rather
/// than exporting anything while running.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Cache probes answered without touching the network.
    pub cache_hits: u64,

    /// Cache probes which forced an outbound question.
    pub cache_misses: u64,

    /// Questions handed to the network layer, retransmissions
    /// included.
    pub questions_sent: u64,

    /// Question transmissions suppressed because another query sent
    /// the same question moments before.
    pub questions_suppressed: u64,

    /// Messages streamed to clients: records, services, and failure
    /// notices.
    pub answers_delivered: u64,

    /// Query aggregates created.
    pub queries_created: u64,

    /// Lookups and resolves which exhausted their retransmissions.
    pub queries_failed: u64,

    /// Requests dropped as duplicates of one the client already has.
    pub duplicate_requests: u64,

    /// Requests dropped for an unsupported type or class.
    pub rejected_requests: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_hit_or_miss(&mut self, hit: bool) {
        if hit {
            self.cache_hits += 1;
        } else {
            self.cache_misses += 1;
        }
    }
}
