#![warn(clippy::pedantic)]
// Sometimes a redundant else is clearer
#![allow(clippy::redundant_else)]
// Don't care enough to fix
#![allow(clippy::match_same_arms)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::similar_names)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::wildcard_imports)]

pub mod cache;
pub mod control;
pub mod engine;
pub mod metrics;
pub mod question;
pub mod query;

use std::time::Duration;

/// Bounds on the delay before a query's first transmission.  The
/// jitter breaks ties between hosts which start querying for the same
/// records simultaneously.  See section 5.2 of RFC 6762.
pub const FIRST_QUERY_DELAY_MIN: Duration = Duration::from_millis(20);
pub const FIRST_QUERY_DELAY_MAX: Duration = Duration::from_millis(120);

/// Interval before the first retransmission of an unanswered
/// question.  Each further interval doubles, up to
/// [`RETRY_INTERVAL_MAX`].
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Ceiling on the retransmission interval, and the maintenance
/// cadence of a long-lived browse.
pub const RETRY_INTERVAL_MAX: Duration = Duration::from_secs(60);

/// How many transmissions a lookup or resolve makes before reporting
/// failure.  Six rounds of the doubling schedule is roughly a minute
/// of trying.
pub const MAX_QUERY_ATTEMPTS: u32 = 6;

/// Minimum spacing between transmissions of the same question,
/// whichever queries want it.  Slightly under [`RETRY_INTERVAL`] so a
/// query's own retransmission is never suppressed by timer skew.
pub const MIN_QUESTION_INTERVAL: Duration = Duration::from_millis(900);

/// How long a record superseded by a cache-flush announcement lives
/// on, absorbing duplicates from the same reception burst.
pub const CACHE_FLUSH_GRACE: Duration = Duration::from_secs(1);

/// Records received within this window of a cache-flush announcement
/// count as part of the same burst and are not flushed.
pub const SAME_BURST_WINDOW: Duration = Duration::from_secs(1);
